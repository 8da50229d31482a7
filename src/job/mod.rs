//! Job composition root and the read-side handle.

mod error;
mod handle;
mod runner;

pub use error::*;
pub use handle::*;
pub use runner::*;
