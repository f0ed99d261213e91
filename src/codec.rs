use std::borrow::Cow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zarrs::array::codec::BloscCodec;
use zarrs::metadata_ext::codec::blosc::{BloscCompressionLevel, BloscCompressor, BloscShuffleMode};
use zarrs_codec::{BytesToBytesCodecTraits, CodecOptions};

/// Blosc inner compressors offered by the compressed storage variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloscCodecId {
    Zstd,
    Lz4,
}

impl BloscCodecId {
    pub fn as_str(&self) -> &'static str {
        match self {
            BloscCodecId::Zstd => "zstd",
            BloscCodecId::Lz4 => "lz4",
        }
    }
}

/// Blosc parameters shared by every array of a dataset.
///
/// `codec_id` is written verbatim as `cname` in the array metadata.
/// `shuffle` follows blosc: 0 no shuffle, 1 byte shuffle, 2 bit shuffle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloscCompressionParams {
    pub codec_id: String,
    pub clevel: u8,
    pub shuffle: u8,
}

impl BloscCompressionParams {
    pub fn new(codec_id: impl Into<String>, clevel: u8, shuffle: u8) -> Self {
        Self {
            codec_id: codec_id.into(),
            clevel,
            shuffle,
        }
    }

    pub fn zstd() -> Self {
        Self::new(BloscCodecId::Zstd.as_str(), 1, 1)
    }

    pub fn lz4() -> Self {
        Self::new(BloscCodecId::Lz4.as_str(), 1, 1)
    }
}

fn compressor_from_id(codec_id: &str) -> crate::Result<BloscCompressor> {
    let cname = match codec_id {
        "blosclz" => BloscCompressor::BloscLZ,
        "lz4" => BloscCompressor::LZ4,
        "lz4hc" => BloscCompressor::LZ4HC,
        "snappy" => BloscCompressor::Snappy,
        "zlib" => BloscCompressor::Zlib,
        "zstd" => BloscCompressor::Zstd,
        s => {
            return Err(crate::Error::InvalidConfig(format!(
                "unsupported blosc codec: {s}"
            )));
        }
    };
    Ok(cname)
}

fn shuffle_from_int(shuffle: u8) -> crate::Result<BloscShuffleMode> {
    match shuffle {
        0 => Ok(BloscShuffleMode::NoShuffle),
        1 => Ok(BloscShuffleMode::Shuffle),
        2 => Ok(BloscShuffleMode::BitShuffle),
        n => Err(crate::Error::InvalidConfig(format!(
            "invalid blosc shuffle mode {n}"
        ))),
    }
}

fn params_to_codec(
    params: &BloscCompressionParams,
    typesize: usize,
) -> crate::Result<BloscCodec> {
    let cname = compressor_from_id(&params.codec_id)?;
    let clevel = BloscCompressionLevel::try_from(params.clevel).map_err(|_| {
        crate::Error::InvalidConfig(format!("invalid blosc compression level {}", params.clevel))
    })?;
    let shuffle = shuffle_from_int(params.shuffle)?;
    BloscCodec::new(cname, clevel, None, shuffle, Some(typesize))
        .map_err(|e| crate::Error::InvalidConfig(format!("could not create blosc codec: {e}")))
}

/// Turns raw chunk bytes into the bytes stored in a shard.
///
/// Without parameters chunks pass through untouched.
#[derive(Debug, Clone)]
pub struct Compressor {
    codec: Option<Arc<BloscCodec>>,
}

impl Compressor {
    pub fn new(params: Option<&BloscCompressionParams>, typesize: usize) -> crate::Result<Self> {
        let codec = params
            .map(|p| params_to_codec(p, typesize).map(Arc::new))
            .transpose()?;
        Ok(Self { codec })
    }

    pub fn is_enabled(&self) -> bool {
        self.codec.is_some()
    }

    pub fn compress<'a>(&self, bytes: &'a [u8]) -> crate::Result<Cow<'a, [u8]>> {
        let Some(codec) = &self.codec else {
            return Ok(Cow::Borrowed(bytes));
        };
        codec
            .encode(Cow::Borrowed(bytes), &CodecOptions::default())
            .map_err(|e| crate::Error::general(format!("blosc compression failed: {e}")))
    }
}
