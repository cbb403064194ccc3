//! The interrupt that aborts a test file.
//!
//! Every fatal condition inside a session (assertion failure, resource
//! error, background launch failure, a failing `sh` step) is an
//! [`Interrupt`]. It is returned as `Err` and propagated with `?` until the
//! runner boundary, which always tears the session down before reporting the
//! status.

use std::io;
use thiserror::Error;

/// Exit status reserved for an interrupted test file.
///
/// Stable and documented: 88 means the harness aborted the file, as opposed
/// to a command's own exit code surfacing through an `sh` step.
pub const INTERRUPT_STATUS: i32 = 88;

/// A fatal condition that unwinds the current test file.
#[derive(Debug, Error)]
pub enum Interrupt {
    /// Workspace, scratch or capture files could not be created or read.
    #[error("{context}: {source}")]
    Resource {
        /// What the harness was doing.
        context: String,
        #[source]
        source: io::Error,
    },

    /// An assertion did not hold under the current operator.
    #[error("assertion failed: {label}")]
    Assertion {
        /// Failure label as logged.
        label: String,
    },

    /// A background command could not be confirmed started.
    #[error("failed to launch background command {command:?}: {reason}")]
    Launch { command: String, reason: String },

    /// A command that had to succeed exited non-zero.
    #[error("command {command:?} exited with status {code}")]
    CommandFailed { command: String, code: i32 },

    /// The script referenced something that does not exist in this session.
    #[error("script error: {0}")]
    Script(String),
}

impl Interrupt {
    pub(crate) fn resource(context: impl Into<String>, source: io::Error) -> Self {
        Interrupt::Resource {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn assertion(label: impl Into<String>) -> Self {
        Interrupt::Assertion {
            label: label.into(),
        }
    }

    /// Exit status the runner reports for this interrupt.
    ///
    /// A failing `sh` step surfaces the command's own code unchanged;
    /// everything else uses [`INTERRUPT_STATUS`].
    pub fn status(&self) -> i32 {
        match self {
            Interrupt::CommandFailed { code, .. } => *code,
            _ => INTERRUPT_STATUS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_status_is_reserved_sentinel() {
        assert_eq!(Interrupt::assertion("x").status(), 88);
        assert_eq!(Interrupt::Script("y".into()).status(), 88);
        let err = Interrupt::resource("creating workspace", io::Error::other("boom"));
        assert_eq!(err.status(), 88);
        assert!(err.to_string().contains("creating workspace"));
    }

    #[test]
    fn command_failure_surfaces_its_code() {
        let err = Interrupt::CommandFailed {
            command: "make".into(),
            code: 2,
        };
        assert_eq!(err.status(), 2);
    }
}
