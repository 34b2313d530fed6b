//! Common identifier and result types.

use bytes::Bytes;

use crate::error::Error;

/// Small-integer namespace for signal ids.
pub type DomainId = u32;

/// Signal id, unique within a domain.
pub type SignalId = u32;

/// Optional secondary id; zero means "none".
pub type PrivateId = u32;

/// Application-chosen group id.
pub type GroupId = u32;

/// Domain used for signals defined through a VSS file.
pub const VSS_DOMAIN: DomainId = 1;

/// Per-member outcome of a collective group fetch. A group call can succeed
/// overall while individual members report, for example, [`Error::NoData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFetch {
    pub domain: DomainId,
    pub signal: SignalId,
    pub result: std::result::Result<Bytes, Error>,
}
