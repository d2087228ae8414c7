//! Memory views: lightweight {buffer, offset, shape} handles.

use std::sync::Arc;

use crate::buffer::{Buffer, SyncMode, ViewSlot};
use crate::error::{TileForgeError, TileResult};
use crate::tensor::{DataType, TensorDesc};

/// A tensor-shaped window addressing `[byte_offset, byte_offset + byte_size)`
/// of its buffer.
///
/// Construction over a buffer attaches the view to the buffer's registry;
/// dropping it detaches. After the owning buffer reallocates, the buffer
/// rewrites the view's shared address slot, so the next `as_ptr()` already
/// sees the new base. A view without a buffer is an unbacked placeholder used
/// during graph building before planning has resolved an address.
#[derive(Debug)]
pub struct TensorView {
    desc: TensorDesc,
    buffer: Option<Buffer>,
    byte_offset: usize,
    slot: Arc<ViewSlot>,
    registry_id: Option<u64>,
}

impl TensorView {
    /// Descriptor-only placeholder with no backing buffer.
    pub fn unbacked(desc: TensorDesc) -> Self {
        Self {
            desc,
            buffer: None,
            byte_offset: 0,
            slot: Arc::new(ViewSlot::new()),
            registry_id: None,
        }
    }

    /// View over `buffer` starting at `byte_offset`.
    pub fn new(buffer: &Buffer, byte_offset: usize, desc: TensorDesc) -> TileResult<Self> {
        let mut view = Self::unbacked(desc);
        view.bind(buffer, byte_offset)?;
        Ok(view)
    }

    /// Attach to a (new) buffer and offset, detaching from any previous one.
    pub fn bind(&mut self, buffer: &Buffer, byte_offset: usize) -> TileResult<()> {
        let end = byte_offset
            .checked_add(self.desc.byte_size())
            .ok_or(TileForgeError::Bounds {
                offset: byte_offset,
                size: self.desc.byte_size(),
                buffer_size: buffer.byte_size(),
            })?;
        if end > buffer.byte_size() {
            return Err(TileForgeError::Bounds {
                offset: byte_offset,
                size: self.desc.byte_size(),
                buffer_size: buffer.byte_size(),
            });
        }

        self.detach();
        let id = buffer.attach(&self.slot, byte_offset);
        self.buffer = Some(buffer.clone());
        self.byte_offset = byte_offset;
        self.registry_id = Some(id);
        Ok(())
    }

    fn detach(&mut self) {
        if let (Some(buffer), Some(id)) = (self.buffer.take(), self.registry_id.take()) {
            buffer.detach(id);
        }
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn is_backed(&self) -> bool {
        self.buffer.is_some()
    }

    /// Effective base address: buffer data pointer plus byte offset.
    /// Null while unbacked.
    pub fn as_ptr(&self) -> *mut u8 {
        if self.buffer.is_some() {
            self.slot.load()
        } else {
            std::ptr::null_mut()
        }
    }

    fn require_f32(&self) -> TileResult<*mut u8> {
        if self.desc.data_type != DataType::F32 {
            return Err(TileForgeError::Unsupported(format!(
                "expected an f32 view, got {:?}",
                self.desc.data_type
            )));
        }
        let ptr = self.as_ptr();
        if ptr.is_null() {
            return Err(TileForgeError::Usage(
                "view is not backed by a buffer".into(),
            ));
        }
        if ptr as usize % std::mem::align_of::<f32>() != 0 {
            return Err(TileForgeError::Usage(format!(
                "view address {:p} is not f32-aligned",
                ptr
            )));
        }
        Ok(ptr)
    }

    /// Read-only f32 access to the addressed range.
    pub fn as_f32_slice(&self) -> TileResult<&[f32]> {
        let ptr = self.require_f32()?;
        // SAFETY: bounds were validated at bind time; planned ranges with
        // overlapping lifetimes never alias (arena planner invariant).
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const f32, self.desc.element_count()) })
    }

    /// Mutable f32 access to the addressed range.
    pub fn as_f32_slice_mut(&mut self) -> TileResult<&mut [f32]> {
        let ptr = self.require_f32()?;
        // SAFETY: as above, plus &mut self for exclusive access to this view.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr as *mut f32, self.desc.element_count()) })
    }

    /// Upload host bytes into the view's range through the buffer.
    pub fn upload(&self, src: &[u8], sync: SyncMode) -> TileResult<()> {
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| TileForgeError::Usage("upload to an unbacked view".into()))?;
        if src.len() > self.desc.byte_size() {
            return Err(TileForgeError::Bounds {
                offset: self.byte_offset,
                size: src.len(),
                buffer_size: self.byte_offset + self.desc.byte_size(),
            });
        }
        buffer.write(self.byte_offset, src, sync)
    }
}

impl Drop for TensorView {
    fn drop(&mut self) {
        self.detach();
    }
}
