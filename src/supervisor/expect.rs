//! Canned responses to interactive prompts.

use regex::Regex;

use crate::config::ExpectPrompt;

/// Number of trailing output characters searched for a prompt.
pub const SEARCH_WINDOW: usize = 100;

/// Matches recent output against prompt patterns in registration order.
#[derive(Debug, Clone, Default)]
pub struct PromptMatcher {
    prompts: Vec<(Regex, String)>,
    window: String,
}

impl PromptMatcher {
    /// Compile the configured prompts.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern is not a valid regex.
    pub fn new(prompts: &[ExpectPrompt]) -> Result<Self, regex::Error> {
        let prompts = prompts
            .iter()
            .map(|p| Ok((Regex::new(&p.pattern)?, p.response.clone())))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self {
            prompts,
            window: String::new(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Append output and return the response for the first matching prompt.
    ///
    /// A match consumes the window so the same prompt is answered once.
    pub fn feed(&mut self, text: &str) -> Option<&str> {
        if self.prompts.is_empty() {
            return None;
        }
        self.window.push_str(text);
        let excess = self.window.chars().count().saturating_sub(SEARCH_WINDOW);
        if excess > 0 {
            let cut = self
                .window
                .char_indices()
                .nth(excess)
                .map_or(self.window.len(), |(i, _)| i);
            self.window.drain(..cut);
        }

        let (_, response) = self
            .prompts
            .iter()
            .find(|(pattern, _)| pattern.is_match(&self.window))?;
        self.window.clear();
        Some(response.as_str())
    }
}
