//! In-band event marker codec.
//!
//! A marker is a base64-encoded JSON object hidden inside terminal output:
//!
//! ```text
//! ESC[K <chunk> ESC[<len>D <chunk> ESC[<len>D ... ESC[K
//! ```
//!
//! Every base64 chunk is followed by a cursor-left sequence of its own width
//! and the whole span is bracketed by erase-to-end-of-line, so a terminal
//! renders nothing while the raw byte stream still carries the payload.

use std::ops::Range;
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use super::error::DecodeError;

/// Erase-to-end-of-line; opens and closes every marker.
pub const ERASE_LINE: &str = "\x1b[K";

/// Width of each base64 chunk written by the plugin.
pub const DEFAULT_MARKER_WIDTH: usize = 78;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[K((?:[A-Za-z0-9+/=]+\x1b\[[0-9]+D)+)\x1b\[K").expect("valid marker regex")
});

static ESCAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9]*[DK]").expect("valid escape regex"));

/// An opaque vault-encrypted value, serialized as `{"__vault": "<ciphertext>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultValue {
    pub ciphertext: String,
}

impl VaultValue {
    /// JSON key wrapping the ciphertext.
    pub const KEY: &'static str = "__vault";

    #[must_use]
    pub fn new(ciphertext: impl Into<String>) -> Self {
        Self {
            ciphertext: ciphertext.into(),
        }
    }

    /// Recognize a decoded `{"__vault": ...}` object.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        if map.len() != 1 {
            return None;
        }
        map.get(Self::KEY)?.as_str().map(Self::new)
    }
}

impl Serialize for VaultValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(Self::KEY, &self.ciphertext)?;
        map.end()
    }
}

/// Location of one complete marker inside a text buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerSpan {
    /// Offset of the opening `ESC[K`.
    pub start: usize,
    /// Offset just past the closing `ESC[K`.
    pub end: usize,
    /// Chunks and cursor sequences between the brackets.
    pub payload: Range<usize>,
}

/// Encoder/decoder for event markers.
#[derive(Debug, Clone, Copy)]
pub struct EventMarkerCodec {
    width: usize,
}

impl Default for EventMarkerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMarkerCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            width: DEFAULT_MARKER_WIDTH,
        }
    }

    /// Use a different chunk width when encoding. Zero is treated as one.
    #[must_use]
    pub fn with_width(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    /// Encode a payload as an invisible marker.
    ///
    /// Vault values serialize through [`VaultValue`]; `chrono` date/time
    /// values serialize as ISO-8601 strings.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized to JSON.
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<String, serde_json::Error> {
        let json = serde_json::to_vec(payload)?;
        let b64 = STANDARD.encode(json);

        let mut marker = String::with_capacity(b64.len() * 2);
        marker.push_str(ERASE_LINE);
        for offset in (0..b64.len()).step_by(self.width) {
            let end = (offset + self.width).min(b64.len());
            // base64 is ASCII, so any byte offset is a char boundary
            let chunk = &b64[offset..end];
            marker.push_str(chunk);
            marker.push_str(&format!("\x1b[{}D", chunk.len()));
        }
        marker.push_str(ERASE_LINE);
        Ok(marker)
    }

    /// Decode a marker span back into its JSON object.
    ///
    /// Accepts either a whole marker or just the text between its brackets.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for invalid base64, UTF-8 or JSON, or when
    /// the payload is not a JSON object.
    pub fn decode(&self, span: &str) -> Result<Map<String, Value>, DecodeError> {
        let b64 = strip_escape_sequences(span);
        let bytes = STANDARD.decode(b64.as_bytes())?;
        let text = String::from_utf8(bytes)?;
        match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => Ok(map),
            _ => Err(DecodeError::NotAnObject),
        }
    }

    /// Find the leftmost complete marker in `text`.
    #[must_use]
    pub fn find(&self, text: &str) -> Option<MarkerSpan> {
        let caps = MARKER_RE.captures(text)?;
        let whole = caps.get(0)?;
        let payload = caps.get(1)?;
        Some(MarkerSpan {
            start: whole.start(),
            end: whole.end(),
            payload: payload.range(),
        })
    }

    /// Returns true if `text` contains the marker bracket token.
    #[must_use]
    pub fn has_token(text: &str) -> bool {
        text.contains(ERASE_LINE)
    }
}

/// Drop `ESC[K` and `ESC[<n>D` sequences, keeping the base64 text.
fn strip_escape_sequences(span: &str) -> String {
    ESCAPE_RE.replace_all(span, "").trim().to_string()
}
