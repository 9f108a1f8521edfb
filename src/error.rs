//! Error types surfaced by the engine and translated to status codes at the C boundary.

/// Status code returned for success across the C boundary.
pub const STATUS_SUCCESS: i32 = 0;

const SYS_IOKIT: u32 = 0xe000_0000;

const fn iokit_err(code: u32) -> i32 {
    (SYS_IOKIT | code) as i32
}

/// Allocation failed.
pub const STATUS_NO_MEMORY: i32 = iokit_err(0x2bd);
/// The device is gone.
pub const STATUS_NO_DEVICE: i32 = iokit_err(0x2c0);
/// An argument failed validation.
pub const STATUS_BAD_ARGUMENT: i32 = iokit_err(0x2c2);
/// Exclusive access conflict.
pub const STATUS_EXCLUSIVE_ACCESS: i32 = iokit_err(0x2c5);
/// Unsupported request.
pub const STATUS_UNSUPPORTED: i32 = iokit_err(0x2c7);
/// Driver-level I/O failure.
pub const STATUS_IO_ERROR: i32 = iokit_err(0x2ca);
/// The client is not started.
pub const STATUS_OFFLINE: i32 = iokit_err(0x2d7);
/// The engine is not running.
pub const STATUS_NOT_READY: i32 = iokit_err(0x2d8);
/// A clip pass ran past what its source could supply.
pub const STATUS_OVERRUN: i32 = iokit_err(0x2e8);

/// Failure while converting mixed samples into the hardware buffer.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClipError {
    /// More frames were due than the exclusive source can supply.
    #[error("clip overrun: {requested} frames requested, limit {limit}")]
    Overrun {
        /// Frames the pass needed.
        requested: u32,
        /// Frames the source can supply.
        limit: u32,
    },
    /// The conversion routine does not handle this format.
    #[error("unsupported sample format for conversion")]
    UnsupportedFormat,
}

/// Failure reported by a concrete driver hook.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("driver error: {0}")]
pub struct DriverError(pub String);

/// Error enumeration surfaced across the public API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// An argument failed validation; no state was changed.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
    /// A non-mixable output stream already has its one client.
    #[error("stream is in exclusive use")]
    ExclusiveAccess,
    /// A buffer or bookkeeping allocation failed.
    #[error("out of memory")]
    NoMemory,
    /// The engine or device has been terminated; retrying is futile.
    #[error("no device")]
    NoDevice,
    /// The client exists but has not been started.
    #[error("client offline")]
    Offline,
    /// The engine is not in a running state.
    #[error("engine not ready")]
    NotReady,
    /// The request is valid but not supported by this engine or stream.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Clipping failed.
    #[error(transparent)]
    Clip(#[from] ClipError),
    /// A driver hook failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl AudioError {
    /// IOReturn-style status code for the C boundary.
    pub fn status_code(&self) -> i32 {
        match self {
            AudioError::BadArgument(_) => STATUS_BAD_ARGUMENT,
            AudioError::ExclusiveAccess => STATUS_EXCLUSIVE_ACCESS,
            AudioError::NoMemory => STATUS_NO_MEMORY,
            AudioError::NoDevice => STATUS_NO_DEVICE,
            AudioError::Offline => STATUS_OFFLINE,
            AudioError::NotReady => STATUS_NOT_READY,
            AudioError::Unsupported(_) => STATUS_UNSUPPORTED,
            AudioError::Clip(ClipError::Overrun { .. }) => STATUS_OVERRUN,
            AudioError::Clip(ClipError::UnsupportedFormat) => STATUS_UNSUPPORTED,
            AudioError::Driver(_) => STATUS_IO_ERROR,
        }
    }
}

/// Translate a result into a status code.
pub fn translate_status(result: Result<(), AudioError>) -> i32 {
    match result {
        Ok(()) => STATUS_SUCCESS,
        Err(err) => err.status_code(),
    }
}

/// Crate-wide result alias.
pub type Result<T, E = AudioError> = std::result::Result<T, E>;
