//! Event reconstruction: marker codec, stream scanner, partial records,
//! persistence and the events-directory reader.

mod codec;
mod error;
mod partial;
mod persister;
mod reader;
mod scanner;
mod types;

pub use codec::*;
pub use error::*;
pub use partial::*;
pub use persister::*;
pub use reader::*;
pub use scanner::*;
pub use types::*;
