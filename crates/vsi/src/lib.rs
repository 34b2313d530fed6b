//! Vehicle signal interface: a multi-process, shared-memory signal bus.
//!
//! Producers publish opaque byte samples onto per-(domain, signal) FIFOs;
//! consumers fetch them oldest-first (consuming) or newest-first (peeking),
//! optionally blocking until data arrives. Signals may be addressed by the
//! textual names of a Vehicle Signal Specification, and ad-hoc *groups* of
//! signals support collective retrieval: fetch all members at once, block
//! until any one fires, or block until all have fired.
//!
//! Everything lives in two memory-mapped files (see [`vsi_shm`]), so any
//! number of processes can participate; within a process the [`Vsi`] handle
//! is cheaply cloneable and thread-safe.
//!
//! ```no_run
//! use vsi::{Vsi, VsiConfig};
//!
//! let bus = Vsi::create(&VsiConfig::default())?;
//! bus.define_signal(0, 2, 0, Some("door.front_left"))?;
//! bus.fire_signal(0, 2, b"open")?;
//! let sample = bus.get_oldest_signal(0, 2)?;
//! assert_eq!(&sample[..], b"open");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

mod api;
mod error;
mod group;
mod index;
mod signal;
mod types;
mod vss;

pub use api::{Vsi, VsiConfig};
pub use error::{Error, Result};
pub use group::GroupList;
pub use signal::SignalList;
pub use types::{DomainId, GroupId, MemberFetch, PrivateId, SignalId, VSS_DOMAIN};
pub use vss::{ImportError, ImportSummary};

// The substrate types surface in a few public signatures.
pub use vsi_shm::{AllocStats, SegmentError};
