//! Purpose: Contract for the blocking connection to one stateful interpreter.
//! Exports: `InterpreterLink`, `LinkProvider`, `http` (ureq-backed implementation).
//! Role: Seam between the engine and whatever backend evaluates calls.
//! Invariants: A link is used by exactly one thread at a time (the owning session worker).
//! Invariants: Transport failures surface as `ErrorKind::Unavailable`, interpreter failures as `Execution`.

pub mod http;

use crate::core::error::Error;
use crate::core::value::Value;

pub trait InterpreterLink: Send {
    /// Evaluates a fully-qualified call string and blocks until the interpreter answers.
    fn execute(&mut self, call: &str) -> Result<Value, Error>;

    /// Places a file in the interpreter's working directory.
    fn write_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), Error>;

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>, Error>;
}

/// Provisions new links for a profile; provisioning mechanics are backend specific.
pub trait LinkProvider: Send + Sync {
    fn connect(&self, profile: &str) -> Result<Box<dyn InterpreterLink>, Error>;
}
