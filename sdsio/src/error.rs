//! SDS I/O return codes
//!
//! Every client call, transport and the server report exactly one of the
//! codes below. `OK` is represented by `Ok(..)`; the negative codes are the
//! variants of [`SdsioError`].

use std::fmt;

/// Operation completed successfully
pub const SDSIO_OK: i32 = 0;

/// Result alias used by the client, server and orchestrator
pub type SdsioResult<T> = Result<T, SdsioError>;

/// Negative SDS I/O return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SdsioError {
    /// Generic failure
    #[error("operation failed")]
    Error,

    /// Invalid id, null buffer or disallowed zero length
    #[error("parameter error")]
    Parameter,

    /// No reply within the deadline
    #[error("timeout")]
    Timeout,

    /// Transport-level fault
    #[error("interface error")]
    Interface,

    /// Server unreachable or the link was lost before a reply
    #[error("no response from server")]
    NoServer,

    /// End of stream reached on Read
    #[error("end of stream")]
    Eos,
}

impl SdsioError {
    /// Numeric return code as used on the wire and in the C API
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Error => -1,
            Self::Parameter => -2,
            Self::Timeout => -3,
            Self::Interface => -4,
            Self::NoServer => -5,
            Self::Eos => -6,
        }
    }

    /// Map a numeric code back to an error.
    ///
    /// Returns `None` for `SDSIO_OK` and for codes outside the contract.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Error),
            -2 => Some(Self::Parameter),
            -3 => Some(Self::Timeout),
            -4 => Some(Self::Interface),
            -5 => Some(Self::NoServer),
            -6 => Some(Self::Eos),
            _ => None,
        }
    }
}

/// Convert a status code into a result; unknown negative codes become `Error`
pub fn status_to_result(code: i32) -> SdsioResult<()> {
    if code >= SDSIO_OK {
        Ok(())
    } else {
        Err(SdsioError::from_code(code).unwrap_or(SdsioError::Error))
    }
}

/// Collapse a result into the numeric return code
#[must_use]
pub fn result_to_status<T>(result: &SdsioResult<T>) -> i32 {
    match result {
        Ok(_) => SDSIO_OK,
        Err(e) => e.code(),
    }
}

impl embedded_io_async::Error for SdsioError {
    fn kind(&self) -> embedded_io_async::ErrorKind {
        match self {
            Self::Parameter => embedded_io_async::ErrorKind::InvalidInput,
            Self::Timeout => embedded_io_async::ErrorKind::TimedOut,
            Self::Interface => embedded_io_async::ErrorKind::BrokenPipe,
            Self::NoServer => embedded_io_async::ErrorKind::NotConnected,
            Self::Error | Self::Eos => embedded_io_async::ErrorKind::Other,
        }
    }
}

/// Open mode of a stream, as carried in the Open frame argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Open for read (binary)
    Read,
    /// Open for write (binary)
    Write,
}

impl Mode {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }

    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}
