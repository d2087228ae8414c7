//! Tensor descriptors and host-resident tensors.
//!
//! Descriptors are CHW-ordered: `dims = [channels, height, width]`.
//! Host tensors hold constant data (convolution weights and biases) supplied
//! to the graph at construction time.

use half::f16;

use crate::error::{TileForgeError, TileResult};

/// Byte alignment for every planned tensor range.
pub const MEM_ALIGNMENT: usize = 64;

/// Round `offset` up to the next multiple of [`MEM_ALIGNMENT`].
pub fn align_up(offset: usize) -> usize {
    (offset + MEM_ALIGNMENT - 1) & !(MEM_ALIGNMENT - 1)
}

/// Element data type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    F16,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
        }
    }
}

/// Shape and type descriptor of a tensor region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub dims: Vec<usize>,
    pub data_type: DataType,
}

impl TensorDesc {
    pub fn new(dims: Vec<usize>, data_type: DataType) -> Self {
        Self { dims, data_type }
    }

    /// CHW descriptor shorthand.
    pub fn chw(channels: usize, height: usize, width: usize) -> Self {
        Self::new(vec![channels, height, width], DataType::F32)
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Unpadded byte size of the described data.
    pub fn byte_size(&self) -> usize {
        self.element_count() * self.data_type.size()
    }

    /// Byte size rounded up to the planner alignment.
    pub fn aligned_byte_size(&self) -> usize {
        align_up(self.byte_size())
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn channels(&self) -> usize {
        self.dims[0]
    }

    pub fn height(&self) -> usize {
        self.dims[self.dims.len() - 2]
    }

    pub fn width(&self) -> usize {
        self.dims[self.dims.len() - 1]
    }
}

/// Constant tensor resident in host memory.
///
/// The graph receives these at construction (weights, biases) and copies them
/// into the private region of the scratch buffer during finalize.
#[derive(Debug, Clone)]
pub struct HostTensor {
    pub desc: TensorDesc,
    pub data: Vec<u8>,
}

impl HostTensor {
    pub fn from_f32(dims: Vec<usize>, values: &[f32]) -> TileResult<Self> {
        let desc = TensorDesc::new(dims, DataType::F32);
        if values.len() != desc.element_count() {
            return Err(TileForgeError::Usage(format!(
                "tensor data length {} does not match shape {:?}",
                values.len(),
                desc.dims
            )));
        }
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_ne_bytes());
        }
        Ok(Self { desc, data })
    }

    pub fn from_f16(dims: Vec<usize>, values: &[f16]) -> TileResult<Self> {
        let desc = TensorDesc::new(dims, DataType::F16);
        if values.len() != desc.element_count() {
            return Err(TileForgeError::Usage(format!(
                "tensor data length {} does not match shape {:?}",
                values.len(),
                desc.dims
            )));
        }
        let mut data = Vec::with_capacity(values.len() * 2);
        for v in values {
            data.extend_from_slice(&v.to_ne_bytes());
        }
        Ok(Self { desc, data })
    }

    /// Decode the tensor contents to f32, widening f16 where needed.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.desc.data_type {
            DataType::F32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_ne_bytes([c[0], c[1]]).to_f32())
                .collect(),
        }
    }
}

/// A simple host image used at the graph boundary.
///
/// Pixels are stored channel-interleaved: `data[(y * width + x) * channels + c]`.
#[derive(Debug, Clone)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl Image {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; width * height * channels],
        }
    }

    pub fn from_data(width: usize, height: usize, channels: usize, data: Vec<f32>) -> TileResult<Self> {
        if data.len() != width * height * channels {
            return Err(TileForgeError::Usage(format!(
                "image data length {} does not match {}x{}x{}",
                data.len(),
                width,
                height,
                channels
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }

    pub fn set(&mut self, c: usize, y: usize, x: usize, value: f32) {
        self.data[(y * self.width + x) * self.channels + c] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 64);
        assert_eq!(align_up(63), 64);
        assert_eq!(align_up(64), 64);
        assert_eq!(align_up(65), 128);
    }

    #[test]
    fn test_desc_sizes() {
        let desc = TensorDesc::chw(3, 8, 8);
        assert_eq!(desc.element_count(), 192);
        assert_eq!(desc.byte_size(), 768);
        assert_eq!(desc.aligned_byte_size(), 768);

        let desc = TensorDesc::new(vec![5], DataType::F16);
        assert_eq!(desc.byte_size(), 10);
        assert_eq!(desc.aligned_byte_size(), 64);
    }

    #[test]
    fn test_host_tensor_shape_mismatch() {
        assert!(HostTensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_host_tensor_f16_roundtrip() {
        let values: Vec<f16> = [0.5f32, -1.0, 2.0, 0.0]
            .iter()
            .map(|&v| f16::from_f32(v))
            .collect();
        let tensor = HostTensor::from_f16(vec![4], &values).unwrap();
        assert_eq!(tensor.to_f32_vec(), vec![0.5, -1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_image_indexing() {
        let mut img = Image::new(4, 2, 3);
        img.set(2, 1, 3, 7.5);
        assert_eq!(img.get(2, 1, 3), 7.5);
        assert_eq!(img.get(0, 0, 0), 0.0);
    }
}
