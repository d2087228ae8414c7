//! Boundary operators: image-to-tensor reorder on input, tensor-to-image on
//! output.
//!
//! The input reorder copies a host image tile into the CHW input tensor,
//! sanitizing samples and zero-padding everything outside the image extent.
//! Numeric transfer functions and HDR scaling are external concerns.

use rayon::prelude::*;

use crate::error::{TileForgeError, TileResult};
use crate::op::{lock_view, sanitize, ImageSlot, Op, SharedView};
use crate::tensor::{Image, TensorDesc};

/// Copies an external image into the graph's CHW input tensor.
pub struct InputProcess {
    name: String,
    dst: SharedView,
    src: ImageSlot,
}

impl InputProcess {
    pub fn new(name: impl Into<String>, dst: SharedView, src: ImageSlot) -> Self {
        Self {
            name: name.into(),
            dst,
            src,
        }
    }
}

impl Op for InputProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn work_amount(&self) -> f64 {
        1.0
    }

    fn output_desc(&self) -> Option<TensorDesc> {
        lock_view(&self.dst).ok().map(|view| view.desc().clone())
    }

    fn output(&self) -> Option<SharedView> {
        Some(self.dst.clone())
    }

    fn execute(&self) -> TileResult<()> {
        let slot = self.src.lock().map_err(TileForgeError::from)?;
        let image = slot.as_ref().ok_or_else(|| {
            TileForgeError::Usage(format!("input image not set for '{}'", self.name))
        })?;

        let mut dst = lock_view(&self.dst)?;
        let desc = dst.desc().clone();
        let (channels, height, width) = (desc.channels(), desc.height(), desc.width());
        let data = dst.as_f32_slice_mut()?;

        data.par_chunks_mut(height * width)
            .enumerate()
            .for_each(|(c, plane)| {
                for y in 0..height {
                    for x in 0..width {
                        let value = if c < image.channels && y < image.height && x < image.width {
                            sanitize(image.get(c, y, x))
                        } else {
                            0.0 // zero-pad outside the tile
                        };
                        plane[y * width + x] = value;
                    }
                }
            });
        Ok(())
    }
}

/// Copies the final tensor back into a host image.
pub struct OutputProcess {
    name: String,
    src: SharedView,
    dst: ImageSlot,
}

impl OutputProcess {
    pub fn new(name: impl Into<String>, src: SharedView, dst: ImageSlot) -> Self {
        Self {
            name: name.into(),
            src,
            dst,
        }
    }
}

impl Op for OutputProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn work_amount(&self) -> f64 {
        1.0
    }

    fn execute(&self) -> TileResult<()> {
        let src = lock_view(&self.src)?;
        let desc = src.desc().clone();
        let (channels, height, width) = (desc.channels(), desc.height(), desc.width());
        let data = src.as_f32_slice()?;

        let mut image = Image::new(width, height, channels);
        for c in 0..channels {
            let plane = &data[c * height * width..(c + 1) * height * width];
            for y in 0..height {
                for x in 0..width {
                    image.set(c, y, x, plane[y * width + x]);
                }
            }
        }

        let mut slot = self.dst.lock().map_err(TileForgeError::from)?;
        *slot = Some(image);
        Ok(())
    }
}
