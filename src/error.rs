//! Error types for cxl-fleet

use std::fmt;

use thiserror::Error;

/// Result type alias using cxl-fleet Error
pub type Result<T> = std::result::Result<T, Error>;

/// A single external command that exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Rendered command line
    pub command: String,
    /// Exit status (-1 when the process could not be spawned or was signalled)
    pub status: i32,
    /// Captured standard error
    pub stderr: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` exited with {}", self.command, self.status)?;
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, ": {}", stderr)?;
        }
        Ok(())
    }
}

/// Errors that can occur while provisioning a fleet
#[derive(Error, Debug)]
pub enum Error {
    /// Host enumeration tool missing or its output malformed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Not enough devices, VFs, cores or addresses for the request
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// An external command failed where failure is not expected
    #[error("Command failed: {0}")]
    Command(CommandFailure),

    /// One or more commands of a concurrent batch failed
    #[error("{} of the batched commands failed: {}", .0.len(), join_failures(.0))]
    CommandBatch(Vec<CommandFailure>),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host state conflicts with starting a new fleet
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    /// A launcher stage was invoked out of order
    #[error("Invalid fleet state: expected {expected}, found {actual}")]
    State {
        expected: &'static str,
        actual: &'static str,
    },

    /// Monitor (QMP) communication errors
    #[error("QMP error: {0}")]
    Qmp(String),

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML configuration errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// QMP wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] qmp_protocol::ProtocolError),
}

fn join_failures(failures: &[CommandFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failure_display_includes_stderr() {
        let failure = CommandFailure {
            command: "sudo driverctl --nosave set-override 0000:41:00.0 vfio-pci".into(),
            status: 1,
            stderr: "device busy\n".into(),
        };
        let text = Error::Command(failure).to_string();
        assert!(text.contains("set-override 0000:41:00.0"));
        assert!(text.ends_with("device busy"));
    }

    #[test]
    fn test_batch_display_lists_every_failure() {
        let err = Error::CommandBatch(vec![
            CommandFailure {
                command: "dd a".into(),
                status: 1,
                stderr: String::new(),
            },
            CommandFailure {
                command: "dd b".into(),
                status: 2,
                stderr: "no space".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 of the batched"));
        assert!(text.contains("`dd a` exited with 1"));
        assert!(text.contains("no space"));
    }
}
