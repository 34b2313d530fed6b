//! Paired segments and first-time bootstrap.
//!
//! [`Shm`] owns one mapping of each segment and knows the initialization
//! order: the system segment (node pool, allocator trees) must be live
//! before the user segment's chunk area can be indexed. `create` runs the
//! whole bootstrap and publishes the initialized flags last; `open` attaches
//! to segments some other process already built.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use crate::alloc::Allocator;
use crate::btree::BtreeError;
use crate::pool::{NODE_SIZE, NodePool};
use crate::segment::{
    DEFAULT_SYS_LEN, DEFAULT_USER_LEN, Segment, SegmentError, SysHeader, UserHeader,
};

#[cfg(debug_assertions)]
use crate::segment::{SYS_FILL, USER_FILL};

/// Paths and sizes for the two backing files.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    pub user_path: PathBuf,
    pub sys_path: PathBuf,
    /// User segment length; fixed at creation, never grown.
    pub user_len: usize,
    /// System segment length; bounds the number of index nodes.
    pub sys_len: usize,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            user_path: PathBuf::from("/dev/shm/vsi-user"),
            sys_path: PathBuf::from("/dev/shm/vsi-sys"),
            user_len: DEFAULT_USER_LEN,
            sys_len: DEFAULT_SYS_LEN,
        }
    }
}

/// One process's attachment to the segment pair.
pub struct Shm {
    user: Segment,
    sys: Segment,
}

impl Shm {
    /// Create both segments and run first-time initialization.
    pub fn create(cfg: &ShmConfig) -> Result<Self, SegmentError> {
        let sys_required = SysHeader::pool_base() as usize + 64 * NODE_SIZE;
        if cfg.sys_len < sys_required {
            return Err(SegmentError::TooSmall {
                required: sys_required,
                found: cfg.sys_len,
            });
        }
        let user_required = UserHeader::chunks_base() as usize + 4096;
        if cfg.user_len < user_required {
            return Err(SegmentError::TooSmall {
                required: user_required,
                found: cfg.user_len,
            });
        }

        let sys = Segment::create(&cfg.sys_path, cfg.sys_len)?;
        #[cfg(debug_assertions)]
        // SAFETY: freshly created, exclusively owned.
        unsafe {
            let base = SysHeader::pool_base();
            sys.bytes_mut(base, sys.len() - base as usize).fill(SYS_FILL);
        }
        // SAFETY: freshly created segment, init runs exactly once.
        unsafe {
            SysHeader::init(sys.ptr_at(0) as *mut SysHeader, sys.len()).map_err(SegmentError::Io)?;
            NodePool::new(&sys).bootstrap();
        }

        let user = Segment::create(&cfg.user_path, cfg.user_len)?;
        #[cfg(debug_assertions)]
        // SAFETY: freshly created, exclusively owned.
        unsafe {
            let base = UserHeader::chunks_base();
            user.bytes_mut(base, user.len() - base as usize).fill(USER_FILL);
        }
        // SAFETY: as above.
        unsafe {
            UserHeader::init(user.ptr_at(0) as *mut UserHeader, user.len())
                .map_err(SegmentError::Io)?;
        }

        let shm = Self { user, sys };
        // SAFETY: still exclusively owned, segments not yet published.
        if unsafe { shm.allocator().bootstrap() } == Err(BtreeError::OutOfNodes) {
            return Err(SegmentError::TooSmall {
                required: sys_required,
                found: cfg.sys_len,
            });
        }

        shm.sys_header().initialized.store(1, Ordering::Release);
        shm.user_header().initialized.store(1, Ordering::Release);

        tracing::debug!(
            user = %shm.user.path().display(),
            sys = %shm.sys.path().display(),
            pool_nodes = shm.node_pool().free_count(),
            "created signal store"
        );
        Ok(shm)
    }

    /// Attach to an existing, fully initialized segment pair.
    pub fn open(cfg: &ShmConfig) -> Result<Self, SegmentError> {
        let sys = Segment::open(&cfg.sys_path)?;
        let user = Segment::open(&cfg.user_path)?;
        // SAFETY: headers validated right below; a garbage file fails there.
        unsafe {
            sys.get::<SysHeader>(0).validate(sys.len())?;
            user.get::<UserHeader>(0).validate(user.len())?;
        }
        tracing::debug!(
            user = %user.path().display(),
            sys = %sys.path().display(),
            "attached to signal store"
        );
        Ok(Self { user, sys })
    }

    #[inline]
    pub fn user(&self) -> &Segment {
        &self.user
    }

    #[inline]
    pub fn sys(&self) -> &Segment {
        &self.sys
    }

    pub fn user_header(&self) -> &UserHeader {
        // SAFETY: validated at create/open.
        unsafe { self.user.get::<UserHeader>(0) }
    }

    pub fn sys_header(&self) -> &SysHeader {
        // SAFETY: validated at create/open.
        unsafe { self.sys.get::<SysHeader>(0) }
    }

    pub fn allocator(&self) -> Allocator<'_> {
        Allocator::new(&self.user, &self.sys)
    }

    pub fn node_pool(&self) -> NodePool<'_> {
        NodePool::new(&self.sys)
    }

    /// Delete both backing files. Existing mappings (ours and other
    /// processes') stay valid until unmapped.
    pub fn unlink(&self) -> io::Result<()> {
        std::fs::remove_file(self.user.path())?;
        std::fs::remove_file(self.sys.path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(tag: &str) -> ShmConfig {
        let dir = std::env::temp_dir();
        ShmConfig {
            user_path: dir.join(format!("vsi_shm_user_{}_{}", tag, std::process::id())),
            sys_path: dir.join(format!("vsi_shm_sys_{}_{}", tag, std::process::id())),
            user_len: 256 * 1024,
            sys_len: 128 * 1024,
        }
    }

    fn cleanup(cfg: &ShmConfig) {
        std::fs::remove_file(&cfg.user_path).ok();
        std::fs::remove_file(&cfg.sys_path).ok();
    }

    #[test]
    fn create_then_open() {
        let cfg = cfg("open");
        let created = Shm::create(&cfg).unwrap();
        let opened = Shm::open(&cfg).unwrap();
        assert_eq!(
            created.node_pool().free_count(),
            opened.node_pool().free_count()
        );
        cleanup(&cfg);
    }

    #[test]
    fn open_uninitialized_fails() {
        let cfg = cfg("uninit");
        // A zeroed file of plausible size must be rejected.
        Segment::create(&cfg.user_path, cfg.user_len).unwrap();
        Segment::create(&cfg.sys_path, cfg.sys_len).unwrap();
        assert!(Shm::open(&cfg).is_err());
        cleanup(&cfg);
    }

    #[test]
    fn too_small_rejected() {
        let mut c = cfg("small");
        c.sys_len = 1024;
        assert!(matches!(
            Shm::create(&c),
            Err(SegmentError::TooSmall { .. })
        ));
        cleanup(&c);
    }

    #[test]
    fn pool_alloc_free_roundtrip() {
        let cfg = cfg("pool");
        let shm = Shm::create(&cfg).unwrap();
        let pool = shm.node_pool();

        let before = pool.free_count();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_count(), before - 2);

        pool.free(a);
        pool.free(b);
        assert_eq!(pool.free_count(), before);
        cleanup(&cfg);
    }

    #[test]
    fn pool_exhaustion() {
        let cfg = cfg("poolx");
        let shm = Shm::create(&cfg).unwrap();
        let pool = shm.node_pool();

        let mut taken = Vec::new();
        while let Some(off) = pool.alloc() {
            taken.push(off);
        }
        assert_eq!(pool.free_count(), 0);
        assert!(pool.alloc().is_none());
        for off in taken {
            pool.free(off);
        }
        assert!(pool.alloc().is_some());
        cleanup(&cfg);
    }
}
