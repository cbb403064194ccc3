//! A script-driven test harness for command-line programs.
//!
//! Each test file runs in its own [`Session`]: a fresh temporary work
//! directory, scratch files for the last command's results and a registry of
//! background processes. Assertions abort the file with an [`Interrupt`] on
//! the first failure; the [`runner`] stops the whole run there.

pub mod assertion;
pub mod background;
pub mod diff;
pub mod env;
pub mod error;
pub mod executor;
pub mod loader;
pub mod logging;
pub mod runner;
pub mod schema;
pub mod script;
pub mod session;
pub mod watcher;

pub use error::{INTERRUPT_STATUS, Interrupt};
pub use schema::CommandLine;
pub use session::{Session, SessionOptions, SessionOutcome};
