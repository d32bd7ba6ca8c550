//! Error types for dxlbus.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Local validation failures (unknown
//! models, unknown or read-only registers, out-of-range values) are raised
//! before any bytes reach the bus. Bus-level failures are grouped under
//! [`CommError`] and wrapped by [`Error::Comm`].

use crate::types::MotorId;

/// The error type for all dxlbus operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No register schema is mapped for this model tag.
    ///
    /// Returned both for tags nobody has heard of and for known families
    /// whose control table has not been mapped yet.
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    /// The model's schema has no register with this name.
    #[error("unknown register {register} for model {model}")]
    UnknownRegister { model: String, register: String },

    /// Attempted to write a register that the device only allows reading.
    #[error("register {0} is read-only")]
    ReadOnlyViolation(String),

    /// A value does not fit the register it is destined for.
    #[error("value {value} out of range for register {register}")]
    ValueOutOfRange { register: String, value: i64 },

    /// The motor directory has no entry for this ID.
    #[error("no motor configured with id {0}")]
    MotorConfigNotFound(MotorId),

    /// An invalid parameter was passed to an operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A malformed or unexpected frame was received from the bus.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The configuration source could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A bus-level communication failure.
    #[error("communication error: {0}")]
    Comm(#[from] CommError),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bus-level communication failures.
///
/// These are raised during or after I/O and are surfaced to the caller
/// unchanged. The library never retries on its own; re-issuing a
/// transaction is the caller's decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommError {
    /// The port could not be opened, or I/O was attempted while closed.
    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    /// The baud rate could not be negotiated.
    #[error("baud rate {0} rejected")]
    BaudRejected(u32),

    /// Bytes arrived but no complete, valid status packet was assembled
    /// before the deadline.
    #[error("timeout waiting for status packet")]
    Timeout,

    /// Nothing at all was received before the deadline.
    #[error("no response")]
    NoResponse,

    /// The device answered with a non-zero error byte in its status packet.
    #[error("motor {id} reported device error 0x{code:02X}")]
    DeviceError { id: MotorId, code: u8 },

    /// The bus rejected the outgoing frame as a whole.
    #[error("transmit failed: {0}")]
    TxFailed(String),

    /// A bulk read completed without a status packet for this motor.
    #[error("no response from motor {0} in bulk read")]
    PartialResponse(MotorId),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the wrapped [`CommError`], if this is a bus-level failure.
    pub fn as_comm(&self) -> Option<&CommError> {
        match self {
            Error::Comm(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this error was raised by local validation, before any bus I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedModel(_)
                | Error::UnknownRegister { .. }
                | Error::ReadOnlyViolation(_)
                | Error::ValueOutOfRange { .. }
                | Error::MotorConfigNotFound(_)
                | Error::InvalidParameter(_)
        )
    }
}
