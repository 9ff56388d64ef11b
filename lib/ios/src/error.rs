//! IOS error codes.
//!
//! Replies travel as raw `i32` values: non-negative values are successes
//! (an `Open` reply is the new handle), negative values are error codes.
//! Devices may reply with their own negative codes, so not every negative
//! reply maps onto an [`IosError`].

/// IOS error codes as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum IosError {
    /// Success
    Ok = 0,
    /// Access denied
    Access = -1,
    /// Object already exists
    Exists = -2,
    /// Interrupted
    Intr = -3,
    /// Invalid argument
    Invalid = -4,
    /// Limit reached
    Max = -5,
    /// No such object
    NoExists = -6,
    /// Queue empty
    QEmpty = -7,
    /// Queue full
    QFull = -8,
    /// Unknown failure
    Unknown = -9,
    /// Driver not ready
    NotReady = -10,
    /// Internal failure
    FailInternal = -21,
    /// Allocation failed
    FailAlloc = -22,
    /// Invalid size
    InvalidSize = -23,
    /// Invalid handle
    InvalidHandle = -28,
    /// Invalid argument value
    InvalidArg = -29,
    /// Out of resources
    NoResource = -30,
    /// Busy
    Busy = -31,
    /// Timed out
    Timeout = -32,
}

/// Result of an IOS-level operation.
pub type IosResult<T> = Result<T, IosError>;

impl IosError {
    /// Raw wire code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Maps a raw reply onto a known error code.
    pub fn from_code(code: i32) -> Option<Self> {
        let error = match code {
            0 => IosError::Ok,
            -1 => IosError::Access,
            -2 => IosError::Exists,
            -3 => IosError::Intr,
            -4 => IosError::Invalid,
            -5 => IosError::Max,
            -6 => IosError::NoExists,
            -7 => IosError::QEmpty,
            -8 => IosError::QFull,
            -9 => IosError::Unknown,
            -10 => IosError::NotReady,
            -21 => IosError::FailInternal,
            -22 => IosError::FailAlloc,
            -23 => IosError::InvalidSize,
            -28 => IosError::InvalidHandle,
            -29 => IosError::InvalidArg,
            -30 => IosError::NoResource,
            -31 => IosError::Busy,
            -32 => IosError::Timeout,
            _ => return None,
        };
        Some(error)
    }
}

impl From<IosError> for i32 {
    fn from(error: IosError) -> i32 {
        error.code()
    }
}

impl core::fmt::Display for IosError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IosError::Ok => write!(f, "OK"),
            IosError::Access => write!(f, "Access denied"),
            IosError::Exists => write!(f, "Already exists"),
            IosError::Intr => write!(f, "Interrupted"),
            IosError::Invalid => write!(f, "Invalid argument"),
            IosError::Max => write!(f, "Limit reached"),
            IosError::NoExists => write!(f, "No such device"),
            IosError::QEmpty => write!(f, "Queue empty"),
            IosError::QFull => write!(f, "Queue full"),
            IosError::Unknown => write!(f, "Unknown error"),
            IosError::NotReady => write!(f, "Not ready"),
            IosError::FailInternal => write!(f, "Internal failure"),
            IosError::FailAlloc => write!(f, "Allocation failed"),
            IosError::InvalidSize => write!(f, "Invalid size"),
            IosError::InvalidHandle => write!(f, "Invalid handle"),
            IosError::InvalidArg => write!(f, "Invalid argument value"),
            IosError::NoResource => write!(f, "Out of resources"),
            IosError::Busy => write!(f, "Busy"),
            IosError::Timeout => write!(f, "Timed out"),
        }
    }
}
