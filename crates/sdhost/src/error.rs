//! Error taxonomy of the SDHost engine.
//!
//! Callers see the coarse [`ErrorKind`] through [`SdhcError::kind`]; the
//! variants carry enough context to produce a useful diagnostic message.

use std::fmt;

use crate::command::Command;

/// Coarse error categories surfaced to block-I/O consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any register access
    InvalidParameter,
    /// A polling retry budget ran out, or the card did not answer
    Timeout,
    /// The controller reported a failure no known quirk explains
    DeviceError,
    /// An allocation failed while bringing a controller up
    OutOfResources,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::Timeout => "timed out",
            ErrorKind::DeviceError => "device error",
            ErrorKind::OutOfResources => "out of resources",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a timeout was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSite {
    /// Waiting for an issued command to complete
    Command(Command),
    /// Draining stale words out of the read FIFO before a read command
    FifoFlush,
    /// Waiting for the FIFO to accept or provide a data word
    DataWord { index: usize, write: bool },
}

/// Hardware failures that are not timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// The previous command never left the NEW state
    ControllerBusy,
    /// The controller flagged the command as failed
    CommandFailed { command: Command, status: u32 },
    /// The platform could not report a clock frequency
    ClockUnavailable { clock_id: u32 },
    /// The card flagged an error in its R1 status
    CardStatus { command: Command, status: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdhcError {
    InvalidParameter(&'static str),
    Timeout(TimeoutSite),
    DeviceError(DeviceFault),
    OutOfResources(&'static str),
}

impl SdhcError {
    /// Returns the coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SdhcError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            SdhcError::Timeout(_) => ErrorKind::Timeout,
            SdhcError::DeviceError(_) => ErrorKind::DeviceError,
            SdhcError::OutOfResources(_) => ErrorKind::OutOfResources,
        }
    }

    /// A command timeout that a voltage negotiation loop is expected to hit
    /// on some cards (CMD1, CMD5 and CMD8).
    pub fn is_expected_timeout(&self) -> bool {
        matches!(self, SdhcError::Timeout(TimeoutSite::Command(cmd)) if cmd.timeout_may_be_expected())
    }
}

impl fmt::Display for SdhcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdhcError::InvalidParameter(what) => write!(f, "invalid parameter: {what}"),
            SdhcError::Timeout(TimeoutSite::Command(cmd)) => {
                write!(f, "{cmd} response timed out")
            }
            SdhcError::Timeout(TimeoutSite::FifoFlush) => write!(f, "read FIFO flush timed out"),
            SdhcError::Timeout(TimeoutSite::DataWord { index, write }) => write!(
                f,
                "block word {index} {} poll timed out",
                if *write { "write" } else { "read" }
            ),
            SdhcError::DeviceError(DeviceFault::ControllerBusy) => {
                write!(f, "device error: previous command still in flight")
            }
            SdhcError::DeviceError(DeviceFault::CommandFailed { command, status }) => {
                write!(f, "device error: {command} failed, status {status:#X}")
            }
            SdhcError::DeviceError(DeviceFault::ClockUnavailable { clock_id }) => {
                write!(f, "device error: failed to query clock {clock_id}")
            }
            SdhcError::DeviceError(DeviceFault::CardStatus { command, status }) => {
                write!(f, "device error: card rejected {command}, status {status:#010X}")
            }
            SdhcError::OutOfResources(what) => write!(f, "out of resources: {what}"),
        }
    }
}

impl std::error::Error for SdhcError {}

impl From<SdhcError> for std::io::Error {
    fn from(e: SdhcError) -> Self {
        let kind = match e.kind() {
            ErrorKind::InvalidParameter => std::io::ErrorKind::InvalidInput,
            ErrorKind::Timeout => std::io::ErrorKind::TimedOut,
            ErrorKind::OutOfResources => std::io::ErrorKind::OutOfMemory,
            ErrorKind::DeviceError => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

/// A specialized [`Result`] type for controller operations.
pub type Result<T> = core::result::Result<T, SdhcError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, ResponseType};

    #[test]
    fn expected_timeouts_are_limited_to_negotiation_commands() {
        for index in [1, 5, 8] {
            let e = SdhcError::Timeout(TimeoutSite::Command(Command::new(index, ResponseType::R1)));
            assert!(e.is_expected_timeout(), "CMD{index}");
        }

        let e = SdhcError::Timeout(TimeoutSite::Command(Command::new(17, ResponseType::R1)));
        assert!(!e.is_expected_timeout());
        assert!(!SdhcError::Timeout(TimeoutSite::FifoFlush).is_expected_timeout());
    }

    #[test]
    fn fifo_and_word_timeouts_are_distinct_from_command_timeouts() {
        let flush = SdhcError::Timeout(TimeoutSite::FifoFlush);
        let word = SdhcError::Timeout(TimeoutSite::DataWord { index: 3, write: false });
        let cmd = SdhcError::Timeout(TimeoutSite::Command(Command::new(17, ResponseType::R1)));

        assert_eq!(flush.kind(), ErrorKind::Timeout);
        assert_ne!(flush, cmd);
        assert_ne!(word, cmd);
        assert_eq!(word.to_string(), "block word 3 read poll timed out");
    }

    #[test]
    fn io_error_conversion_keeps_category() {
        let io: std::io::Error = SdhcError::InvalidParameter("length").into();
        assert_eq!(io.kind(), std::io::ErrorKind::InvalidInput);

        let io: std::io::Error = SdhcError::Timeout(TimeoutSite::FifoFlush).into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);

        let io: std::io::Error = SdhcError::OutOfResources("file buffer").into();
        assert_eq!(io.kind(), std::io::ErrorKind::OutOfMemory);
        assert_eq!(io.to_string(), "out of resources: file buffer");
    }
}
