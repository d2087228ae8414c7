//! 3x3 convolution over CHW tiles, including the concatenated-source variant.

use rayon::prelude::*;

use crate::buffer::SyncMode;
use crate::error::TileResult;
use crate::op::{lock_view, Op, SharedView};
use crate::tensor::{DataType, HostTensor, TensorDesc};

/// 3x3 convolution with zero padding and optional ReLU.
///
/// With two sources this is the concat-conv fusion: the kernel reads the
/// channel concatenation of both inputs without materializing it. Weights and
/// bias live in the scratch buffer's private region; `finalize_layout` uploads
/// them (widening f16 host weights to f32) once finalize has bound the views.
pub struct Conv {
    name: String,
    srcs: Vec<SharedView>,
    dst: SharedView,
    weight: HostTensor,
    bias: HostTensor,
    weight_view: SharedView,
    bias_view: SharedView,
    relu: bool,
    work_amount: f64,
    supported: bool,
}

impl Conv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        srcs: Vec<SharedView>,
        dst: SharedView,
        weight: HostTensor,
        bias: HostTensor,
        weight_view: SharedView,
        bias_view: SharedView,
        relu: bool,
        work_amount: f64,
    ) -> Self {
        let supported = matches!(weight.desc.data_type, DataType::F32 | DataType::F16)
            && matches!(bias.desc.data_type, DataType::F32 | DataType::F16)
            && weight.desc.ndims() == 4
            && weight.desc.dims[2] == 3
            && weight.desc.dims[3] == 3;
        Self {
            name: name.into(),
            srcs,
            dst,
            weight,
            bias,
            weight_view,
            bias_view,
            relu,
            work_amount,
            supported,
        }
    }
}

impl Op for Conv {
    fn name(&self) -> &str {
        &self.name
    }

    fn work_amount(&self) -> f64 {
        self.work_amount
    }

    fn is_supported(&self) -> bool {
        self.supported
    }

    fn output_desc(&self) -> Option<TensorDesc> {
        lock_view(&self.dst).ok().map(|view| view.desc().clone())
    }

    fn output(&self) -> Option<SharedView> {
        Some(self.dst.clone())
    }

    fn finalize_layout(&mut self) -> TileResult<()> {
        // Repack host weights into the private region in execution layout.
        let weight_f32 = self.weight.to_f32_vec();
        let bias_f32 = self.bias.to_f32_vec();
        let weight_bytes: Vec<u8> = weight_f32.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let bias_bytes: Vec<u8> = bias_f32.iter().flat_map(|v| v.to_ne_bytes()).collect();
        lock_view(&self.weight_view)?.upload(&weight_bytes, SyncMode::Sync)?;
        lock_view(&self.bias_view)?.upload(&bias_bytes, SyncMode::Sync)?;
        Ok(())
    }

    fn execute(&self) -> TileResult<()> {
        let src_guards = self
            .srcs
            .iter()
            .map(lock_view)
            .collect::<TileResult<Vec<_>>>()?;
        let mut inputs: Vec<&[f32]> = Vec::with_capacity(src_guards.len());
        let mut in_channels: Vec<usize> = Vec::with_capacity(src_guards.len());
        for guard in &src_guards {
            inputs.push(guard.as_f32_slice()?);
            in_channels.push(guard.desc().channels());
        }
        let in_c_total: usize = in_channels.iter().sum();

        let weight_guard = lock_view(&self.weight_view)?;
        let weight = weight_guard.as_f32_slice()?;
        let bias_guard = lock_view(&self.bias_view)?;
        let bias = bias_guard.as_f32_slice()?;

        let mut dst_guard = lock_view(&self.dst)?;
        let desc = dst_guard.desc().clone();
        let (height, width) = (desc.height(), desc.width());
        let dst = dst_guard.as_f32_slice_mut()?;

        let relu = self.relu;
        let in_channels = &in_channels;
        let inputs = &inputs;

        dst.par_chunks_mut(height * width)
            .enumerate()
            .for_each(|(oc, plane)| {
                let input_at = |ic: usize, y: usize, x: usize| -> f32 {
                    let mut rem = ic;
                    let mut si = 0;
                    while rem >= in_channels[si] {
                        rem -= in_channels[si];
                        si += 1;
                    }
                    inputs[si][(rem * height + y) * width + x]
                };

                for y in 0..height {
                    for x in 0..width {
                        let mut acc = bias[oc];
                        for ic in 0..in_c_total {
                            for ky in 0..3usize {
                                let iy = y as isize + ky as isize - 1;
                                if iy < 0 || iy >= height as isize {
                                    continue;
                                }
                                for kx in 0..3usize {
                                    let ix = x as isize + kx as isize - 1;
                                    if ix < 0 || ix >= width as isize {
                                        continue;
                                    }
                                    let w = weight[((oc * in_c_total + ic) * 3 + ky) * 3 + kx];
                                    acc += w * input_at(ic, iy as usize, ix as usize);
                                }
                            }
                        }
                        plane[y * width + x] = if relu { acc.max(0.0) } else { acc };
                    }
                }
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, Storage, TensorView};
    use crate::engine::{CpuEngine, Engine};
    use crate::op::shared_view;
    use std::sync::Arc;

    fn backed_view(buffer: &Buffer, byte_offset: usize, desc: TensorDesc) -> SharedView {
        shared_view(TensorView::new(buffer, byte_offset, desc).unwrap())
    }

    /// Identity kernel: center tap 1 on the matching channel, 0 elsewhere.
    fn identity_weight(channels: usize) -> HostTensor {
        let mut values = vec![0.0f32; channels * channels * 9];
        for c in 0..channels {
            values[((c * channels + c) * 3 + 1) * 3 + 1] = 1.0;
        }
        HostTensor::from_f32(vec![channels, channels, 3, 3], &values).unwrap()
    }

    #[test]
    fn test_identity_conv() {
        let engine: Arc<dyn Engine> = Arc::new(CpuEngine::new());
        let buffer = Buffer::new(engine, 4096, Storage::Managed).unwrap();

        let src = backed_view(&buffer, 0, TensorDesc::chw(2, 3, 3));
        let dst = backed_view(&buffer, 256, TensorDesc::chw(2, 3, 3));
        let weight = identity_weight(2);
        let bias = HostTensor::from_f32(vec![2], &[0.0, 0.0]).unwrap();
        let weight_view = backed_view(
            &buffer,
            1024,
            TensorDesc::new(vec![2, 2, 3, 3], DataType::F32),
        );
        let bias_view = backed_view(&buffer, 2048, TensorDesc::new(vec![2], DataType::F32));

        let input: Vec<f32> = (0..18).map(|v| v as f32).collect();
        src.lock()
            .unwrap()
            .as_f32_slice_mut()
            .unwrap()
            .copy_from_slice(&input);

        let mut conv = Conv::new(
            "conv1",
            vec![src],
            dst.clone(),
            weight,
            bias,
            weight_view,
            bias_view,
            false,
            1.0,
        );
        assert!(conv.is_supported());
        conv.finalize_layout().unwrap();
        conv.execute().unwrap();

        assert_eq!(dst.lock().unwrap().as_f32_slice().unwrap(), &input[..]);
    }

    #[test]
    fn test_relu_and_bias() {
        let engine: Arc<dyn Engine> = Arc::new(CpuEngine::new());
        let buffer = Buffer::new(engine, 4096, Storage::Managed).unwrap();

        let src = backed_view(&buffer, 0, TensorDesc::chw(1, 2, 2));
        let dst = backed_view(&buffer, 256, TensorDesc::chw(1, 2, 2));
        let weight = identity_weight(1);
        let bias = HostTensor::from_f32(vec![1], &[-2.0]).unwrap();
        let weight_view =
            backed_view(&buffer, 1024, TensorDesc::new(vec![1, 1, 3, 3], DataType::F32));
        let bias_view = backed_view(&buffer, 2048, TensorDesc::new(vec![1], DataType::F32));

        src.lock()
            .unwrap()
            .as_f32_slice_mut()
            .unwrap()
            .copy_from_slice(&[1.0, 3.0, 0.5, 2.0]);

        let mut conv = Conv::new(
            "conv_relu",
            vec![src],
            dst.clone(),
            weight,
            bias,
            weight_view,
            bias_view,
            true,
            1.0,
        );
        conv.finalize_layout().unwrap();
        conv.execute().unwrap();

        // identity + bias(-2), then ReLU
        assert_eq!(
            dst.lock().unwrap().as_f32_slice().unwrap(),
            &[0.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_concat_sources() {
        let engine: Arc<dyn Engine> = Arc::new(CpuEngine::new());
        let buffer = Buffer::new(engine, 8192, Storage::Managed).unwrap();

        let src1 = backed_view(&buffer, 0, TensorDesc::chw(1, 2, 2));
        let src2 = backed_view(&buffer, 256, TensorDesc::chw(1, 2, 2));
        let dst = backed_view(&buffer, 512, TensorDesc::chw(2, 2, 2));
        let weight = identity_weight(2);
        let bias = HostTensor::from_f32(vec![2], &[0.0, 0.0]).unwrap();
        let weight_view = backed_view(
            &buffer,
            4096,
            TensorDesc::new(vec![2, 2, 3, 3], DataType::F32),
        );
        let bias_view = backed_view(&buffer, 6144, TensorDesc::new(vec![2], DataType::F32));

        src1.lock()
            .unwrap()
            .as_f32_slice_mut()
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        src2.lock()
            .unwrap()
            .as_f32_slice_mut()
            .unwrap()
            .copy_from_slice(&[5.0, 6.0, 7.0, 8.0]);

        let mut conv = Conv::new(
            "concat_conv",
            vec![src1, src2],
            dst.clone(),
            weight,
            bias,
            weight_view,
            bias_view,
            false,
            1.0,
        );
        conv.finalize_layout().unwrap();
        conv.execute().unwrap();

        // Identity kernel routes channel 0 from src1 and channel 1 from src2.
        assert_eq!(
            dst.lock().unwrap().as_f32_slice().unwrap(),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
    }

    #[test]
    fn test_bad_kernel_shape_unsupported() {
        let weight = HostTensor::from_f32(vec![1, 1, 5, 5], &vec![0.0; 25]).unwrap();
        let bias = HostTensor::from_f32(vec![1], &[0.0]).unwrap();
        let dst = shared_view(TensorView::unbacked(TensorDesc::chw(1, 2, 2)));
        let conv = Conv::new(
            "bad",
            vec![],
            dst,
            weight,
            bias,
            shared_view(TensorView::unbacked(TensorDesc::new(
                vec![1, 1, 5, 5],
                DataType::F32,
            ))),
            shared_view(TensorView::unbacked(TensorDesc::new(vec![1], DataType::F32))),
            false,
            1.0,
        );
        assert!(!conv.is_supported());
    }
}
