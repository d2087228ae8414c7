//! Execution engine abstraction.
//!
//! An [`Engine`] supplies raw byte allocations and queue-ordered copies to the
//! buffer subsystem. The graph treats it as an opaque backend factory: device
//! enumeration and kernel dispatch policy live outside this crate.
//!
//! [`CpuEngine`] is the host reference implementation used by the tests. Its
//! queue is degenerate: copies complete before returning regardless of the
//! requested sync mode, which still satisfies the ordering contract.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::buffer::{Storage, SyncMode};
use crate::error::{TileForgeError, TileResult};
use crate::tensor::MEM_ALIGNMENT;

/// A raw allocation handed out by an engine.
///
/// Must be returned to the same engine via [`Engine::free`] exactly once.
#[derive(Debug)]
pub struct Allocation {
    ptr: NonNull<u8>,
    byte_size: usize,
    storage: Storage,
}

// SAFETY: an Allocation is a plain pointer/size pair; all mutation of the
// pointed-to memory goes through the owning Buffer, which synchronizes access.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    pub fn new(ptr: NonNull<u8>, byte_size: usize, storage: Storage) -> Self {
        Self {
            ptr,
            byte_size,
            storage,
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }
}

/// Backend factory and execution-queue abstraction consumed by [`crate::buffer::Buffer`].
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate `byte_size` bytes of the given storage kind.
    fn alloc(&self, byte_size: usize, storage: Storage) -> TileResult<Allocation>;

    /// Release an allocation previously returned by [`Engine::alloc`].
    fn free(&self, alloc: Allocation);

    /// Queue-ordered byte copy. `SyncMode::Sync` blocks until completion;
    /// `SyncMode::Async` may return earlier but preserves ordering with later
    /// operations submitted to the same engine.
    fn copy(&self, dst: *mut u8, src: *const u8, byte_size: usize, sync: SyncMode) -> TileResult<()>;

    /// Whether this engine can allocate the given storage kind.
    fn supports_storage(&self, storage: Storage) -> bool;

    /// Whether memory of the given storage kind is directly addressable from
    /// the host, making `map()` an identity operation.
    fn is_host_reachable(&self, storage: Storage) -> bool;

    /// Block until all previously submitted work has completed.
    fn flush(&self) -> TileResult<()>;
}

/// Host reference engine backed by aligned heap allocations.
pub struct CpuEngine {
    /// Optional cap on the total live bytes, used to exercise allocation
    /// failure paths without exhausting real memory.
    alloc_limit: Option<usize>,
    live_bytes: AtomicUsize,
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuEngine {
    pub fn new() -> Self {
        Self {
            alloc_limit: None,
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// Cap the total live allocation size. Requests past the cap fail with an
    /// allocation error, leaving previously allocated buffers untouched.
    pub fn with_alloc_limit(limit: usize) -> Self {
        Self {
            alloc_limit: Some(limit),
            live_bytes: AtomicUsize::new(0),
        }
    }

    /// Total bytes currently allocated through this engine.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    fn layout_for(byte_size: usize) -> TileResult<Layout> {
        Layout::from_size_align(byte_size.max(1), MEM_ALIGNMENT)
            .map_err(|e| TileForgeError::Allocation(format!("invalid layout: {}", e)))
    }
}

impl Engine for CpuEngine {
    fn name(&self) -> &str {
        "cpu"
    }

    fn alloc(&self, byte_size: usize, storage: Storage) -> TileResult<Allocation> {
        if !self.supports_storage(storage) {
            return Err(TileForgeError::Unsupported(format!(
                "cpu engine cannot allocate {:?} storage",
                storage
            )));
        }
        if let Some(limit) = self.alloc_limit {
            if self.live_bytes.load(Ordering::Relaxed) + byte_size > limit {
                return Err(TileForgeError::Allocation(format!(
                    "allocation of {} bytes exceeds engine limit of {} bytes",
                    byte_size, limit
                )));
            }
        }

        let layout = Self::layout_for(byte_size)?;
        // Zeroed so freshly planned scratch reads deterministically in tests.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            TileForgeError::Allocation(format!("host allocation of {} bytes failed", byte_size))
        })?;

        self.live_bytes.fetch_add(byte_size, Ordering::Relaxed);
        tracing::trace!(byte_size, ?storage, "cpu engine allocated");
        Ok(Allocation::new(ptr, byte_size, storage))
    }

    fn free(&self, alloc: Allocation) {
        let layout = match Self::layout_for(alloc.byte_size()) {
            Ok(layout) => layout,
            Err(_) => return,
        };
        self.live_bytes.fetch_sub(alloc.byte_size(), Ordering::Relaxed);
        unsafe { std::alloc::dealloc(alloc.ptr(), layout) };
    }

    fn copy(&self, dst: *mut u8, src: *const u8, byte_size: usize, _sync: SyncMode) -> TileResult<()> {
        if byte_size == 0 {
            return Ok(());
        }
        // memmove semantics; caller ranges are normally disjoint but this
        // stays correct if they ever alias.
        unsafe { std::ptr::copy(src, dst, byte_size) };
        Ok(())
    }

    fn supports_storage(&self, storage: Storage) -> bool {
        matches!(storage, Storage::Host | Storage::Managed)
    }

    fn is_host_reachable(&self, storage: Storage) -> bool {
        matches!(storage, Storage::Host | Storage::Managed)
    }

    fn flush(&self) -> TileResult<()> {
        Ok(())
    }
}
