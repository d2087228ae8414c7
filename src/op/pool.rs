//! 2x2 max pooling.

use rayon::prelude::*;

use crate::error::TileResult;
use crate::op::{lock_view, Op, SharedView};
use crate::tensor::TensorDesc;

/// 2x2 max pooling with stride 2; halves height and width.
pub struct Pool {
    name: String,
    src: SharedView,
    dst: SharedView,
    work_amount: f64,
}

impl Pool {
    pub fn new(name: impl Into<String>, src: SharedView, dst: SharedView, work_amount: f64) -> Self {
        Self {
            name: name.into(),
            src,
            dst,
            work_amount,
        }
    }
}

impl Op for Pool {
    fn name(&self) -> &str {
        &self.name
    }

    fn work_amount(&self) -> f64 {
        self.work_amount
    }

    fn output_desc(&self) -> Option<TensorDesc> {
        lock_view(&self.dst).ok().map(|view| view.desc().clone())
    }

    fn output(&self) -> Option<SharedView> {
        Some(self.dst.clone())
    }

    fn execute(&self) -> TileResult<()> {
        let src_guard = lock_view(&self.src)?;
        let src = src_guard.as_f32_slice()?;
        let src_desc = src_guard.desc().clone();
        let (src_h, src_w) = (src_desc.height(), src_desc.width());

        let mut dst_guard = lock_view(&self.dst)?;
        let dst_desc = dst_guard.desc().clone();
        let (dst_h, dst_w) = (dst_desc.height(), dst_desc.width());
        let dst = dst_guard.as_f32_slice_mut()?;

        dst.par_chunks_mut(dst_h * dst_w)
            .enumerate()
            .for_each(|(c, plane)| {
                let src_plane = &src[c * src_h * src_w..(c + 1) * src_h * src_w];
                for y in 0..dst_h {
                    for x in 0..dst_w {
                        let (sy, sx) = (y * 2, x * 2);
                        let m = src_plane[sy * src_w + sx]
                            .max(src_plane[sy * src_w + sx + 1])
                            .max(src_plane[(sy + 1) * src_w + sx])
                            .max(src_plane[(sy + 1) * src_w + sx + 1]);
                        plane[y * dst_w + x] = m;
                    }
                }
            });
        Ok(())
    }
}
