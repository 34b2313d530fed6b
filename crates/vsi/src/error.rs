//! Error taxonomy of the signal bus.

use vsi_shm::BtreeError;

/// Operational errors. Every bus operation returns one of these; none of
/// them indicates memory corruption (corruption aborts in the substrate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A required argument was missing or malformed.
    Invalid,
    /// An index lookup found nothing.
    NotFound,
    /// The entity being created already exists.
    AlreadyExists,
    /// Non-blocking fetch on an empty signal list.
    NoData,
    /// The shared allocator or the index node pool is exhausted.
    NoMemory,
    /// The operation is not available on this platform.
    Unsupported,
    /// A blocking operation reached its deadline.
    TimedOut,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "no such entry"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NoData => write!(f, "no data available"),
            Self::NoMemory => write!(f, "shared memory exhausted"),
            Self::Unsupported => write!(f, "operation not supported"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for Error {}

impl From<BtreeError> for Error {
    fn from(e: BtreeError) -> Self {
        match e {
            BtreeError::Duplicate => Error::AlreadyExists,
            BtreeError::OutOfNodes => Error::NoMemory,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
