//! Multiscale pyramid policy and frame reduction.
//!
//! Each level halves y and x of the previous one, rounding odd extents up.
//! Chunk and shard shapes and all non-spatial dimensions are kept. The pyramid
//! stops once a level fits in a single chunk along both spatial axes.

use crate::config::ArrayConfig;
use crate::frame::{Frame, ImageShape, SampleType};

fn halve(extent: u32) -> u32 {
    extent.div_ceil(2).max(1)
}

/// Derive the next coarser level from `config`.
///
/// Returns `None` if `config` already fits in one chunk along y and x.
/// The returned config keeps the input's `data_root`; the caller relocates it.
pub fn downsample(config: &ArrayConfig) -> Option<ArrayConfig> {
    let y = config.y_dimension();
    let x = config.x_dimension();
    if y.array_size_px <= y.chunk_size_px && x.array_size_px <= x.chunk_size_px {
        return None;
    }

    let mut next = config.clone();
    let n = next.dimensions.len();
    for dim in &mut next.dimensions[n - 2..] {
        dim.array_size_px = halve(dim.array_size_px);
    }
    next.image_shape.height = next.dimensions[n - 2].array_size_px;
    next.image_shape.width = next.dimensions[n - 1].array_size_px;
    Some(next)
}

trait Sample: Copy {
    const SIZE: usize;

    fn read(bytes: &[u8]) -> Self;
    fn extend(self, out: &mut Vec<u8>);
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_sample {
    ($t:ty, $from:expr) => {
        impl Sample for $t {
            const SIZE: usize = size_of::<$t>();

            fn read(bytes: &[u8]) -> Self {
                <$t>::from_ne_bytes(bytes.try_into().expect("sample-sized slice"))
            }

            fn extend(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            fn to_f64(self) -> f64 {
                f64::from(self)
            }

            fn from_f64(value: f64) -> Self {
                let convert = $from;
                convert(value)
            }
        }
    };
}

impl_sample!(u8, |v: f64| v.round() as u8);
impl_sample!(i8, |v: f64| v.round() as i8);
impl_sample!(u16, |v: f64| v.round() as u16);
impl_sample!(i16, |v: f64| v.round() as i16);
impl_sample!(f32, |v: f64| v as f32);

/// Average each 2x2 block; blocks cut by an odd edge average what they contain.
fn halve_samples<T: Sample>(data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let out_w = width.div_ceil(2);
    let out_h = height.div_ceil(2);
    let sample = |x: usize, y: usize| {
        let at = (y * width + x) * T::SIZE;
        T::read(&data[at..at + T::SIZE]).to_f64()
    };

    let mut out = Vec::with_capacity(out_w * out_h * T::SIZE);
    for oy in 0..out_h {
        for ox in 0..out_w {
            let mut sum = 0.0;
            let mut count = 0.0;
            for y in (2 * oy)..(2 * oy + 2).min(height) {
                for x in (2 * ox)..(2 * ox + 2).min(width) {
                    sum += sample(x, y);
                    count += 1.0;
                }
            }
            T::from_f64(sum / count).extend(&mut out);
        }
    }
    out
}

/// Reduce a frame to the next pyramid level.
pub fn halve_frame(frame: &Frame) -> crate::Result<Frame> {
    let shape = frame.shape;
    if frame.data.len() != shape.bytes_of_image() {
        return Err(crate::Error::InvalidFrame(format!(
            "expected {} bytes for a {}x{} {:?} frame, got {}",
            shape.bytes_of_image(),
            shape.width,
            shape.height,
            shape.sample_type,
            frame.data.len()
        )));
    }

    let (w, h) = (shape.width as usize, shape.height as usize);
    let data = match shape.sample_type {
        SampleType::U8 => halve_samples::<u8>(&frame.data, w, h),
        SampleType::I8 => halve_samples::<i8>(&frame.data, w, h),
        SampleType::I16 => halve_samples::<i16>(&frame.data, w, h),
        SampleType::F32 => halve_samples::<f32>(&frame.data, w, h),
        SampleType::U16 | SampleType::U10 | SampleType::U12 | SampleType::U14 => {
            halve_samples::<u16>(&frame.data, w, h)
        }
    };
    let halved = ImageShape::new(halve(shape.width), halve(shape.height), shape.sample_type);
    Ok(Frame::new(halved, frame.frame_id, data))
}
