//! The loader, interpreter, embedding state and standard library for the
//! Saurus virtual machine, built on top of `su-core`'s value representation
//! and collections.

pub mod diagnostics;
pub mod interp;
pub mod loader;
pub mod state;
pub mod stdlib;

pub use loader::{ByteSource, MAGIC, VERSION_MAJOR, VERSION_MINOR};
pub use state::{Frame, State, DEFAULT_MAX_CALLS, DEFAULT_STACK_SIZE};
