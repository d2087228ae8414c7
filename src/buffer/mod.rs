//! Backing store buffers.
//!
//! A [`Buffer`] owns a contiguous byte range allocated through an
//! [`Engine`](crate::engine::Engine) and is cheap to clone (`Arc` inner,
//! single free on last drop). It carries:
//!
//! - a storage kind (closed set: host, device, managed/unified, undefined);
//! - a side table of mapped regions keyed by the returned host pointer;
//! - a registry of attached views, notified after every reallocation.
//!
//! The view registry holds ids and weak address slots rather than raw view
//! addresses, so a dropped view never leaves a dangling entry and a dropped
//! buffer is never blocked by outstanding views.

mod view;

pub use view::TensorView;

use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::engine::{Allocation, Engine};
use crate::error::{TileForgeError, TileResult};

/// Storage kind of a buffer. Closed set; new backends reuse these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Host-only memory.
    Host,
    /// Discrete device memory, not directly host addressable.
    Device,
    /// Unified shared memory, addressable from both sides.
    Managed,
    /// Externally provided memory of unknown kind.
    Undefined,
}

/// Requested access mode for a mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    /// Write access without preserving previous contents.
    WriteDiscard,
}

impl Access {
    fn reads(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    fn writes(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite | Access::WriteDiscard)
    }
}

/// Synchronization mode for buffer transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Block until the transfer has completed.
    Sync,
    /// May return before completion; ordering on the engine queue is kept.
    Async,
}

/// Shared address slot owned by a view and rewritten by its buffer.
///
/// After a reallocation the buffer stores `new_base + byte_offset` into every
/// attached slot, so the view's next `as_ptr()` sees the updated address.
#[derive(Debug)]
pub(crate) struct ViewSlot {
    ptr: AtomicPtr<u8>,
}

impl ViewSlot {
    pub(crate) fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub(crate) fn load(&self) -> *mut u8 {
        self.ptr.load(Ordering::Acquire)
    }

    fn store(&self, ptr: *mut u8) {
        self.ptr.store(ptr, Ordering::Release);
    }
}

/// A host-visible window onto part of a buffer, booked in the side table.
#[derive(Debug)]
struct MappedRegion {
    byte_offset: usize,
    byte_size: usize,
    access: Access,
    /// Staging copy for storage kinds the host cannot address directly.
    staging: Option<Vec<u8>>,
}

struct ViewEntry {
    slot: Weak<ViewSlot>,
    byte_offset: usize,
}

struct BufferState {
    alloc: Option<Allocation>,
    byte_size: usize,
    mapped: HashMap<usize, MappedRegion>,
    views: HashMap<u64, ViewEntry>,
    next_view_id: u64,
}

struct BufferInner {
    engine: Arc<dyn Engine>,
    storage: Storage,
    state: Mutex<BufferState>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(alloc) = state.alloc.take() {
            self.engine.free(alloc);
        }
    }
}

/// Contiguous byte allocation with a storage kind, host/device transfer
/// primitives, and a view-notification registry.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Allocate a new buffer of `byte_size` bytes with the given storage kind.
    pub fn new(engine: Arc<dyn Engine>, byte_size: usize, storage: Storage) -> TileResult<Self> {
        let alloc = engine.alloc(byte_size, storage)?;
        tracing::debug!(byte_size, ?storage, "buffer allocated");
        Ok(Self {
            inner: Arc::new(BufferInner {
                engine,
                storage,
                state: Mutex::new(BufferState {
                    alloc: Some(alloc),
                    byte_size,
                    mapped: HashMap::new(),
                    views: HashMap::new(),
                    next_view_id: 0,
                }),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        // Poison tolerance: the protected state is valid after any panic site.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn base_ptr(state: &BufferState) -> TileResult<*mut u8> {
        state
            .alloc
            .as_ref()
            .map(|a| a.ptr())
            .ok_or_else(|| TileForgeError::Internal("buffer has no allocation".into()))
    }

    /// Current byte size.
    pub fn byte_size(&self) -> usize {
        self.state().byte_size
    }

    /// Storage kind, fixed at construction.
    pub fn storage(&self) -> Storage {
        self.inner.storage
    }

    /// Engine backing this buffer.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    /// Base data pointer of the current allocation.
    pub fn data_ptr(&self) -> *mut u8 {
        let state = self.state();
        state
            .alloc
            .as_ref()
            .map(|a| a.ptr())
            .unwrap_or(std::ptr::null_mut())
    }

    /// Whether the two handles share the same underlying allocation.
    pub fn same_buffer(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_bounds(byte_offset: usize, byte_size: usize, total: usize) -> TileResult<()> {
        let end = byte_offset
            .checked_add(byte_size)
            .ok_or(TileForgeError::Bounds {
                offset: byte_offset,
                size: byte_size,
                buffer_size: total,
            })?;
        if end > total {
            return Err(TileForgeError::Bounds {
                offset: byte_offset,
                size: byte_size,
                buffer_size: total,
            });
        }
        Ok(())
    }

    /// Map `[byte_offset, byte_offset + byte_size)` into host address space.
    ///
    /// Host-reachable storage answers with the identity pointer; other
    /// storage kinds go through a staging copy. Every returned pointer must
    /// be passed to [`Buffer::unmap`] exactly once. Mapping the same address
    /// twice without an intervening unmap is a usage violation; disjoint
    /// concurrent regions are fine.
    pub fn map(&self, byte_offset: usize, byte_size: usize, access: Access) -> TileResult<*mut u8> {
        let mut state = self.state();
        Self::check_bounds(byte_offset, byte_size, state.byte_size)?;
        let base = Self::base_ptr(&state)?;

        if self.inner.engine.is_host_reachable(self.inner.storage) {
            let ptr = (base as usize + byte_offset) as *mut u8;
            if state.mapped.contains_key(&(ptr as usize)) {
                return Err(TileForgeError::Usage(format!(
                    "map() is not reentrant for the same address {:p}",
                    ptr
                )));
            }
            state.mapped.insert(
                ptr as usize,
                MappedRegion {
                    byte_offset,
                    byte_size,
                    access,
                    staging: None,
                },
            );
            Ok(ptr)
        } else {
            let mut staging = vec![0u8; byte_size];
            if access.reads() {
                let src = (base as usize + byte_offset) as *const u8;
                self.inner
                    .engine
                    .copy(staging.as_mut_ptr(), src, byte_size, SyncMode::Sync)?;
            }
            let ptr = staging.as_mut_ptr();
            state.mapped.insert(
                ptr as usize,
                MappedRegion {
                    byte_offset,
                    byte_size,
                    access,
                    staging: Some(staging),
                },
            );
            Ok(ptr)
        }
    }

    /// Release a pointer previously returned by [`Buffer::map`].
    pub fn unmap(&self, host_ptr: *mut u8) -> TileResult<()> {
        let mut state = self.state();
        let region = state
            .mapped
            .remove(&(host_ptr as usize))
            .ok_or_else(|| {
                TileForgeError::Usage(format!("unmap() of unregistered pointer {:p}", host_ptr))
            })?;

        if let Some(staging) = region.staging {
            if region.access.writes() {
                let base = Self::base_ptr(&state)?;
                let dst = (base as usize + region.byte_offset) as *mut u8;
                self.inner
                    .engine
                    .copy(dst, staging.as_ptr(), region.byte_size, SyncMode::Sync)?;
            }
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at `byte_offset` into host memory.
    pub fn read(&self, byte_offset: usize, dst: &mut [u8], sync: SyncMode) -> TileResult<()> {
        let state = self.state();
        Self::check_bounds(byte_offset, dst.len(), state.byte_size)?;
        let base = Self::base_ptr(&state)?;
        let src = (base as usize + byte_offset) as *const u8;
        self.inner.engine.copy(dst.as_mut_ptr(), src, dst.len(), sync)
    }

    /// Copy host memory into the buffer starting at `byte_offset`.
    pub fn write(&self, byte_offset: usize, src: &[u8], sync: SyncMode) -> TileResult<()> {
        let state = self.state();
        Self::check_bounds(byte_offset, src.len(), state.byte_size)?;
        let base = Self::base_ptr(&state)?;
        let dst = (base as usize + byte_offset) as *mut u8;
        self.inner.engine.copy(dst, src.as_ptr(), src.len(), sync)
    }

    /// Reallocate to `new_byte_size`, discarding current contents.
    ///
    /// Every attached view is re-pointed at `new_base + its offset` before the
    /// call returns; previously returned raw pointers become invalid. On
    /// allocation failure the buffer keeps its pre-call allocation and size.
    pub fn realloc(&self, new_byte_size: usize) -> TileResult<()> {
        let mut state = self.state();
        if !state.mapped.is_empty() {
            return Err(TileForgeError::Usage(format!(
                "realloc() with {} outstanding mapped region(s)",
                state.mapped.len()
            )));
        }

        // Allocate first; only swap once the new allocation exists.
        let new_alloc = self.inner.engine.alloc(new_byte_size, self.inner.storage)?;
        let new_base = new_alloc.ptr();
        if let Some(old) = state.alloc.replace(new_alloc) {
            self.inner.engine.free(old);
        }
        state.byte_size = new_byte_size;

        state.views.retain(|_, entry| match entry.slot.upgrade() {
            Some(slot) => {
                slot.store((new_base as usize + entry.byte_offset) as *mut u8);
                true
            }
            None => false,
        });

        tracing::debug!(
            new_byte_size,
            views = state.views.len(),
            "buffer reallocated, views notified"
        );
        Ok(())
    }

    pub(crate) fn attach(&self, slot: &Arc<ViewSlot>, byte_offset: usize) -> u64 {
        let mut state = self.state();
        let id = state.next_view_id;
        state.next_view_id += 1;
        if let Some(alloc) = state.alloc.as_ref() {
            slot.store((alloc.ptr() as usize + byte_offset) as *mut u8);
        }
        state.views.insert(
            id,
            ViewEntry {
                slot: Arc::downgrade(slot),
                byte_offset,
            },
        );
        id
    }

    pub(crate) fn detach(&self, id: u64) {
        self.state().views.remove(&id);
    }

    /// Number of currently attached views (registry size).
    pub fn attached_view_count(&self) -> usize {
        self.state().views.len()
    }

    /// Number of currently mapped regions.
    pub fn mapped_region_count(&self) -> usize {
        self.state().mapped.len()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("byte_size", &self.byte_size())
            .field("storage", &self.inner.storage)
            .finish()
    }
}
