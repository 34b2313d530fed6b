//! Signal indices and name resolution.
//!
//! Three trees share the signal-list records as values: the id index keyed
//! on (domain, signal), the name index keyed on (domain, name), and the
//! private-id index keyed on the optional secondary id. A record enters the
//! name and private indices only once `define` supplies the corresponding
//! field; the id index gains an entry the first time anything touches the
//! (domain, signal) pair.

use std::mem::offset_of;

use vsi_shm::{Btree, BtreeError, KeyDef, KeyField, Probe, ProbePart, Shm};

use crate::error::{Error, Result};
use crate::signal::{SignalList, list_at};
use crate::types::{DomainId, PrivateId, SignalId};

const ID_KEY: KeyDef = KeyDef::two(
    KeyField::U32(offset_of!(SignalList, domain)),
    KeyField::U32(offset_of!(SignalList, signal)),
);

const NAME_KEY: KeyDef = KeyDef::two(
    KeyField::U32(offset_of!(SignalList, domain)),
    KeyField::Name(offset_of!(SignalList, name)),
);

const PRIVATE_KEY: KeyDef = KeyDef::one(KeyField::U32(offset_of!(SignalList, private_id)));

pub(crate) fn id_index(shm: &Shm) -> Btree<'_> {
    Btree::new(&shm.user_header().id_index, shm.node_pool(), shm.user(), ID_KEY)
}

pub(crate) fn name_index(shm: &Shm) -> Btree<'_> {
    Btree::new(
        &shm.user_header().name_index,
        shm.node_pool(),
        shm.user(),
        NAME_KEY,
    )
}

pub(crate) fn private_index(shm: &Shm) -> Btree<'_> {
    Btree::new(
        &shm.user_header().private_index,
        shm.node_pool(),
        shm.user(),
        PRIVATE_KEY,
    )
}

fn id_probe<'a>(domain: DomainId, signal: SignalId) -> Probe<'a> {
    Probe::two(ProbePart::U32(domain), ProbePart::U32(signal))
}

/// Look up an existing list.
pub(crate) fn find_list(shm: &Shm, domain: DomainId, signal: SignalId) -> Option<u64> {
    id_index(shm).get(&id_probe(domain, signal))
}

/// Look up or lazily create the list for (domain, signal).
///
/// Creation is serialized by the id-index mutex, so two processes racing on
/// the same key observe a single record.
pub(crate) fn find_or_create_list(shm: &Shm, domain: DomainId, signal: SignalId) -> Result<u64> {
    let idx = id_index(shm);
    let _guard = shm.user_header().id_index.mutex.lock();

    let probe = id_probe(domain, signal);
    if let Some(off) = idx.get(&probe) {
        return Ok(off);
    }

    let off = shm
        .allocator()
        .alloc(size_of::<SignalList>())
        .ok_or(Error::NoMemory)?;
    // SAFETY: freshly allocated, correctly sized, exclusively ours.
    if let Err(e) =
        unsafe { SignalList::init(shm.user().ptr_at(off) as *mut SignalList, domain, signal) }
    {
        tracing::warn!(domain, signal, error = %e, "signal list init failed");
        shm.allocator().free(off);
        return Err(Error::NoMemory);
    }
    match idx.insert(off) {
        Ok(()) => {
            tracing::debug!(domain, signal, "created signal list");
            Ok(off)
        }
        Err(e) => {
            shm.allocator().free(off);
            Err(e.into())
        }
    }
}

/// Create or update a signal definition: ensure the list exists, then attach
/// the name and private id to their indices.
pub(crate) fn define(
    shm: &Shm,
    domain: DomainId,
    signal: SignalId,
    private_id: PrivateId,
    name: Option<&str>,
) -> Result<u64> {
    if let Some(name) = name
        && (name.is_empty() || name.contains('\0'))
    {
        return Err(Error::Invalid);
    }
    let list_off = find_or_create_list(shm, domain, signal)?;
    if let Some(name) = name {
        set_name(shm, list_off, name)?;
    }
    if private_id != 0 {
        set_private(shm, list_off, private_id)?;
    }
    Ok(list_off)
}

// The name field is written only under the name-index mutex; tree
// comparisons read it under the same mutex.
fn write_name_field(shm: &Shm, list_off: u64, value: u64) {
    // SAFETY: list_off is a live record; avoids forming &mut to the whole
    // record while shared references to it exist elsewhere.
    unsafe {
        let p = shm.user().ptr_at(list_off) as *mut SignalList;
        (&raw mut (*p).name).write(value);
    }
}

fn write_private_field(shm: &Shm, list_off: u64, value: u32) {
    // SAFETY: as above, under the private-index mutex.
    unsafe {
        let p = shm.user().ptr_at(list_off) as *mut SignalList;
        (&raw mut (*p).private_id).write(value);
    }
}

fn set_name(shm: &Shm, list_off: u64, name: &str) -> Result<()> {
    let idx = name_index(shm);
    let _guard = shm.user_header().name_index.mutex.lock();

    let (domain, old_name) = {
        let list = list_at(shm, list_off);
        (list.domain, list.name)
    };
    if old_name != 0 {
        // SAFETY: a non-zero name field always references a live string.
        let existing = unsafe { shm.user().cstr_bytes(old_name) };
        if existing == name.as_bytes() {
            return Ok(());
        }
    }

    // Stage the new string first so failure leaves everything untouched.
    let new_str = shm.allocator().alloc(name.len() + 1).ok_or(Error::NoMemory)?;
    // SAFETY: freshly allocated, sized len + 1; the NUL lands inside it.
    unsafe {
        shm.user()
            .bytes_mut(new_str, name.len())
            .copy_from_slice(name.as_bytes());
        *shm.user().get_mut::<u8>(new_str + name.len() as u64) = 0;
    }

    if old_name != 0 {
        // SAFETY: still live, unindexed right here.
        let existing = unsafe { shm.user().cstr_bytes(old_name) };
        idx.remove(&Probe::two(ProbePart::U32(domain), ProbePart::Str(existing)));
    }

    write_name_field(shm, list_off, new_str);
    match idx.insert(list_off) {
        Ok(()) => {
            if old_name != 0 {
                shm.allocator().free(old_name);
            }
            Ok(())
        }
        Err(e) => {
            // Roll back to the previous binding.
            write_name_field(shm, list_off, old_name);
            if old_name != 0
                && let Err(e2) = idx.insert(list_off)
            {
                tracing::warn!(list = list_off, error = %e2, "could not restore name entry");
                write_name_field(shm, list_off, 0);
            }
            shm.allocator().free(new_str);
            Err(match e {
                BtreeError::Duplicate => Error::AlreadyExists,
                BtreeError::OutOfNodes => Error::NoMemory,
            })
        }
    }
}

fn set_private(shm: &Shm, list_off: u64, private_id: PrivateId) -> Result<()> {
    let idx = private_index(shm);
    let _guard = shm.user_header().private_index.mutex.lock();

    let old = list_at(shm, list_off).private_id;
    if old == private_id {
        return Ok(());
    }
    if old != 0 {
        idx.remove(&Probe::one(ProbePart::U32(old)));
    }
    write_private_field(shm, list_off, private_id);
    match idx.insert(list_off) {
        Ok(()) => Ok(()),
        Err(e) => {
            write_private_field(shm, list_off, old);
            if old != 0
                && let Err(e2) = idx.insert(list_off)
            {
                tracing::warn!(list = list_off, error = %e2, "could not restore private-id entry");
                write_private_field(shm, list_off, 0);
            }
            Err(match e {
                BtreeError::Duplicate => Error::AlreadyExists,
                BtreeError::OutOfNodes => Error::NoMemory,
            })
        }
    }
}

/// Resolve a signal name to its id within `domain`.
pub(crate) fn name_to_id(shm: &Shm, domain: DomainId, name: &str) -> Result<SignalId> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::Invalid);
    }
    let off = name_index(shm)
        .get(&Probe::two(
            ProbePart::U32(domain),
            ProbePart::Str(name.as_bytes()),
        ))
        .ok_or(Error::NotFound)?;
    Ok(list_at(shm, off).signal)
}

/// Resolve a signal id to its defined name.
pub(crate) fn id_to_name(shm: &Shm, domain: DomainId, signal: SignalId) -> Result<String> {
    let off = find_list(shm, domain, signal).ok_or(Error::NotFound)?;
    let _guard = shm.user_header().name_index.mutex.lock();
    let name = list_at(shm, off).name;
    if name == 0 {
        return Err(Error::NotFound);
    }
    // SAFETY: non-zero name references a live string.
    let bytes = unsafe { shm.user().cstr_bytes(name) };
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Resolve a private id to its (domain, signal) pair.
pub(crate) fn private_to_id(shm: &Shm, private_id: PrivateId) -> Result<(DomainId, SignalId)> {
    if private_id == 0 {
        return Err(Error::Invalid);
    }
    let off = private_index(shm)
        .get(&Probe::one(ProbePart::U32(private_id)))
        .ok_or(Error::NotFound)?;
    let list = list_at(shm, off);
    Ok((list.domain, list.signal))
}
