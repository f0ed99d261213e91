use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel sample type of an acquired frame.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    U16,
    I8,
    I16,
    F32,
    /// 10-bit samples stored in 16 bits.
    U10,
    /// 12-bit samples stored in 16 bits.
    U12,
    /// 14-bit samples stored in 16 bits.
    U14,
}

impl SampleType {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleType::U8 | SampleType::I8 => 1,
            SampleType::U16
            | SampleType::I16
            | SampleType::U10
            | SampleType::U12
            | SampleType::U14 => 2,
            SampleType::F32 => 4,
        }
    }
}

/// Pixel extent and sample type of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub width: u32,
    pub height: u32,
    pub sample_type: SampleType,
}

impl ImageShape {
    pub fn new(width: u32, height: u32, sample_type: SampleType) -> Self {
        Self {
            width,
            height,
            sample_type,
        }
    }

    pub fn bytes_per_row(&self) -> usize {
        self.width as usize * self.sample_type.bytes_per_sample()
    }

    pub fn bytes_of_image(&self) -> usize {
        self.bytes_per_row() * self.height as usize
    }
}

/// One image from the acquisition stream, row-major with no padding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub shape: ImageShape,
    pub frame_id: u64,
    pub data: Bytes,
}

impl Frame {
    pub fn new(shape: ImageShape, frame_id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            shape,
            frame_id,
            data: data.into(),
        }
    }
}
