//! Streaming writer for sharded, optionally multiscale, Zarr v3 datasets.
pub mod chunk;
pub mod chunk_key_encoding;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod downsample;
mod error;
pub mod frame;
pub mod metadata;
pub mod storage;
pub mod writer;

pub use zarrs;

pub use codec::BloscCompressionParams;
pub use config::{ArrayConfig, DatasetConfig, Dimension};
pub use dataset::{StorageCapabilities, ZarrV3};
pub use error::{Error, Result};
pub use frame::{Frame, ImageShape, SampleType};
pub use writer::Writer;
