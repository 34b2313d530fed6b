//! The public bus handle.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use vsi_shm::{AllocStats, SegmentError, Shm, ShmConfig, deadline_after};

use crate::error::Result;
use crate::group;
use crate::index;
use crate::signal::{self, FetchMode};
use crate::types::{DomainId, GroupId, MemberFetch, PrivateId, SignalId};
use crate::vss::{ImportError, ImportSummary};

/// Segment paths and sizes for [`Vsi::create`] / [`Vsi::open`].
pub type VsiConfig = ShmConfig;

struct Inner {
    shm: Shm,
    /// Process-local cache of resolved (domain, signal) records. Safe to
    /// cache forever: signal lists are never destroyed before teardown.
    lists: RwLock<HashMap<(DomainId, SignalId), u64>>,
}

/// A handle to the signal bus. Cheap to clone; all clones share one mapping.
///
/// `create` builds the segments and becomes the first attached process;
/// `open` attaches to segments an earlier process built. Dropping the handle
/// unmaps this process's view and leaves the bus running for everyone else.
#[derive(Clone)]
pub struct Vsi {
    inner: Arc<Inner>,
}

impl Vsi {
    /// Create the backing segments and initialize the bus.
    pub fn create(config: &VsiConfig) -> std::result::Result<Self, SegmentError> {
        Ok(Self::wrap(Shm::create(config)?))
    }

    /// Attach to a bus another process created.
    pub fn open(config: &VsiConfig) -> std::result::Result<Self, SegmentError> {
        Ok(Self::wrap(Shm::open(config)?))
    }

    fn wrap(shm: Shm) -> Self {
        Self {
            inner: Arc::new(Inner {
                shm,
                lists: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Tear the bus down: unmap this handle and delete both backing files.
    /// Other attached processes keep their mappings until they exit.
    pub fn destroy(self) -> std::io::Result<()> {
        self.inner.shm.unlink()
    }

    fn shm(&self) -> &Shm {
        &self.inner.shm
    }

    /// Resolve (domain, signal) to its record, creating the signal list on
    /// first touch.
    fn resolve(&self, domain: DomainId, signal: SignalId) -> Result<u64> {
        if let Some(&off) = self.inner.lists.read().get(&(domain, signal)) {
            return Ok(off);
        }
        let off = index::find_or_create_list(self.shm(), domain, signal)?;
        self.inner.lists.write().insert((domain, signal), off);
        Ok(off)
    }

    // =========================================================================
    // Definitions and name resolution
    // =========================================================================

    /// Define a signal: create its list if needed and bind the optional
    /// name and private id in their indices.
    pub fn define_signal(
        &self,
        domain: DomainId,
        signal: SignalId,
        private_id: PrivateId,
        name: Option<&str>,
    ) -> Result<()> {
        index::define(self.shm(), domain, signal, private_id, name)?;
        Ok(())
    }

    /// Import signal definitions from a VSS file.
    pub fn vss_import(&self, path: impl AsRef<Path>) -> std::result::Result<ImportSummary, ImportError> {
        crate::vss::import(self.shm(), path.as_ref())
    }

    /// Resolve a signal name to its id.
    pub fn name_to_id(&self, domain: DomainId, name: &str) -> Result<SignalId> {
        index::name_to_id(self.shm(), domain, name)
    }

    /// Resolve a signal id to its defined name.
    pub fn id_to_name(&self, domain: DomainId, signal: SignalId) -> Result<String> {
        index::id_to_name(self.shm(), domain, signal)
    }

    /// Resolve a non-zero private id to its (domain, signal) pair.
    pub fn private_id_to_signal(&self, private_id: PrivateId) -> Result<(DomainId, SignalId)> {
        index::private_to_id(self.shm(), private_id)
    }

    // =========================================================================
    // Publish / fetch / flush
    // =========================================================================

    /// Publish one sample. May unblock waiting consumers before returning.
    pub fn fire_signal(&self, domain: DomainId, signal: SignalId, data: &[u8]) -> Result<()> {
        let off = self.resolve(domain, signal)?;
        signal::publish(self.shm(), off, data)
    }

    /// As [`fire_signal`](Self::fire_signal), addressing by name.
    pub fn fire_signal_by_name(&self, domain: DomainId, name: &str, data: &[u8]) -> Result<()> {
        let signal = self.name_to_id(domain, name)?;
        self.fire_signal(domain, signal, data)
    }

    fn fetch(
        &self,
        domain: DomainId,
        signal: SignalId,
        mode: FetchMode,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let off = self.resolve(domain, signal)?;
        let deadline = timeout.map(deadline_after);
        signal::fetch(self.shm(), off, mode, wait, deadline.as_ref())
    }

    /// Consume the oldest queued sample, or [`Error::NoData`](crate::Error::NoData) if none.
    pub fn get_oldest_signal(&self, domain: DomainId, signal: SignalId) -> Result<Bytes> {
        self.fetch(domain, signal, FetchMode::Oldest, false, None)
    }

    /// Consume the oldest sample, blocking until one arrives. `None` waits
    /// forever; a timeout yields [`Error::TimedOut`](crate::Error::TimedOut).
    pub fn get_oldest_signal_wait(
        &self,
        domain: DomainId,
        signal: SignalId,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.fetch(domain, signal, FetchMode::Oldest, true, timeout)
    }

    /// Read the newest sample without removing it.
    pub fn get_newest_signal(&self, domain: DomainId, signal: SignalId) -> Result<Bytes> {
        self.fetch(domain, signal, FetchMode::Newest, false, None)
    }

    /// Read the newest sample, blocking until one arrives.
    pub fn get_newest_signal_wait(
        &self,
        domain: DomainId,
        signal: SignalId,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.fetch(domain, signal, FetchMode::Newest, true, timeout)
    }

    /// Name-addressed variant of [`get_oldest_signal`](Self::get_oldest_signal).
    pub fn get_oldest_signal_by_name(&self, domain: DomainId, name: &str) -> Result<Bytes> {
        let signal = self.name_to_id(domain, name)?;
        self.get_oldest_signal(domain, signal)
    }

    /// Name-addressed variant of [`get_newest_signal`](Self::get_newest_signal).
    pub fn get_newest_signal_by_name(&self, domain: DomainId, name: &str) -> Result<Bytes> {
        let signal = self.name_to_id(domain, name)?;
        self.get_newest_signal(domain, signal)
    }

    /// Drop every queued sample of one signal.
    pub fn flush_signal(&self, domain: DomainId, signal: SignalId) -> Result<()> {
        let off = self.resolve(domain, signal)?;
        signal::flush(self.shm(), off)
    }

    /// Name-addressed variant of [`flush_signal`](Self::flush_signal).
    pub fn flush_signal_by_name(&self, domain: DomainId, name: &str) -> Result<()> {
        let signal = self.name_to_id(domain, name)?;
        self.flush_signal(domain, signal)
    }

    /// Number of samples currently queued on one signal.
    pub fn pending_samples(&self, domain: DomainId, signal: SignalId) -> Result<u32> {
        let off = self.resolve(domain, signal)?;
        Ok(signal::list_at(self.shm(), off).sample_count())
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Create an empty group. [`Error::AlreadyExists`](crate::Error::AlreadyExists) if the id is taken.
    pub fn create_signal_group(&self, gid: GroupId) -> Result<()> {
        group::create_group(self.shm(), gid)
    }

    /// Delete a group and its membership records. Never touches signal
    /// data.
    pub fn delete_signal_group(&self, gid: GroupId) -> Result<()> {
        group::delete_group(self.shm(), gid)
    }

    /// Append (domain, signal) to a group, creating the signal list if
    /// needed.
    pub fn add_signal_to_group(
        &self,
        gid: GroupId,
        domain: DomainId,
        signal: SignalId,
    ) -> Result<()> {
        group::add_member(self.shm(), gid, domain, signal)
    }

    /// Name-addressed variant of [`add_signal_to_group`](Self::add_signal_to_group).
    pub fn add_signal_to_group_by_name(
        &self,
        gid: GroupId,
        domain: DomainId,
        name: &str,
    ) -> Result<()> {
        let signal = self.name_to_id(domain, name)?;
        self.add_signal_to_group(gid, domain, signal)
    }

    /// Remove the first membership record referencing (domain, signal).
    pub fn remove_signal_from_group(
        &self,
        gid: GroupId,
        domain: DomainId,
        signal: SignalId,
    ) -> Result<()> {
        group::remove_member(self.shm(), gid, domain, signal)
    }

    /// Name-addressed variant of
    /// [`remove_signal_from_group`](Self::remove_signal_from_group).
    pub fn remove_signal_from_group_by_name(
        &self,
        gid: GroupId,
        domain: DomainId,
        name: &str,
    ) -> Result<()> {
        let signal = self.name_to_id(domain, name)?;
        self.remove_signal_from_group(gid, domain, signal)
    }

    /// Peek the newest sample of every member. Per-member failures land in
    /// the corresponding result slot.
    pub fn get_newest_in_group(&self, gid: GroupId) -> Result<Vec<MemberFetch>> {
        group::collective_fetch(self.shm(), gid, FetchMode::Newest, false, None)
    }

    /// Blocking variant: waits until each member has a sample to peek.
    pub fn get_newest_in_group_wait(
        &self,
        gid: GroupId,
        timeout: Option<Duration>,
    ) -> Result<Vec<MemberFetch>> {
        let deadline = timeout.map(deadline_after);
        group::collective_fetch(self.shm(), gid, FetchMode::Newest, true, deadline.as_ref())
    }

    /// Consume the oldest sample of every member. Per-member failures land
    /// in the corresponding result slot.
    pub fn get_oldest_in_group(&self, gid: GroupId) -> Result<Vec<MemberFetch>> {
        group::collective_fetch(self.shm(), gid, FetchMode::Oldest, false, None)
    }

    /// Blocking variant: waits until each member has delivered a sample.
    pub fn get_oldest_in_group_wait(
        &self,
        gid: GroupId,
        timeout: Option<Duration>,
    ) -> Result<Vec<MemberFetch>> {
        let deadline = timeout.map(deadline_after);
        group::collective_fetch(self.shm(), gid, FetchMode::Oldest, true, deadline.as_ref())
    }

    /// Block until any member receives a sample; returns which one fired.
    pub fn listen_any_in_group(
        &self,
        gid: GroupId,
        timeout: Option<Duration>,
    ) -> Result<(DomainId, SignalId)> {
        let deadline = timeout.map(deadline_after);
        group::listen_any(self.shm(), gid, deadline.as_ref())
    }

    /// Block until every member has received a sample; returns one per
    /// member.
    pub fn listen_all_in_group(
        &self,
        gid: GroupId,
        timeout: Option<Duration>,
    ) -> Result<Vec<MemberFetch>> {
        let deadline = timeout.map(deadline_after);
        group::collective_fetch(self.shm(), gid, FetchMode::Oldest, true, deadline.as_ref())
    }

    /// Flush every member's signal list.
    pub fn flush_group(&self, gid: GroupId) -> Result<()> {
        group::flush_group(self.shm(), gid)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Allocator population snapshot for the user segment.
    pub fn alloc_stats(&self) -> AllocStats {
        self.shm().allocator().stats()
    }
}
