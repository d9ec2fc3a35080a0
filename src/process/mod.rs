//! Child process supervision: launch, line-streamed output, stdin, kill and timeout.

mod error;
mod outcome;
mod streams;
mod supervisor;

pub use error::*;
pub use outcome::*;
pub use streams::{InputStream, OutputLines, DEFAULT_OUTPUT_BUFFER, INPUT_BUFFER_SIZE};
pub use supervisor::*;
