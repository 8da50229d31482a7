//! Process supervision: spawning, prompt answering, timeouts and the job
//! state machine.

mod expect;
mod process;
mod pty;
mod runner;
mod state;
mod utf8;

pub use expect::*;
pub use process::*;
pub use pty::*;
pub use runner::*;
pub use state::*;
pub use utf8::*;
