//! proc-supervisor - supervise a single child process.
//!
//! Start a program, read its combined stdout/stderr as lines, feed its
//! stdin, and terminate it on request or after a timeout while always
//! learning how it ended.

pub mod config;
pub mod display;
pub mod process;
