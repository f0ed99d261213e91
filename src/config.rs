use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::BloscCompressionParams;
use crate::frame::ImageShape;

/// One axis of an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    /// Extent in pixels. Zero on the append axis means unbounded.
    pub array_size_px: u32,
    pub chunk_size_px: u32,
    pub shard_size_chunks: u32,
}

impl Dimension {
    pub fn new(
        name: impl Into<String>,
        array_size_px: u32,
        chunk_size_px: u32,
        shard_size_chunks: u32,
    ) -> Self {
        Self {
            name: name.into(),
            array_size_px,
            chunk_size_px,
            shard_size_chunks,
        }
    }

    /// Number of chunks needed to cover the extent.
    pub fn chunk_count(&self) -> u64 {
        u64::from(self.array_size_px).div_ceil(u64::from(self.chunk_size_px))
    }

    /// Number of shards needed to cover the extent.
    pub fn shard_count(&self) -> u64 {
        self.chunk_count().div_ceil(u64::from(self.shard_size_chunks))
    }
}

/// Everything needed to build the writer for one resolution level.
///
/// Dimensions are ordered outer-to-inner. The first is the append axis,
/// the last two are y and x.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayConfig {
    pub image_shape: ImageShape,
    pub dimensions: Vec<Dimension>,
    pub data_root: PathBuf,
    pub compression_params: Option<BloscCompressionParams>,
}

impl ArrayConfig {
    pub fn append_dimension(&self) -> &Dimension {
        &self.dimensions[0]
    }

    /// Dimensions between the append axis and y.
    pub fn middle_dimensions(&self) -> &[Dimension] {
        let n = self.dimensions.len();
        &self.dimensions[1..n - 2]
    }

    pub fn y_dimension(&self) -> &Dimension {
        &self.dimensions[self.dimensions.len() - 2]
    }

    pub fn x_dimension(&self) -> &Dimension {
        &self.dimensions[self.dimensions.len() - 1]
    }

    /// Frames needed to advance the append axis by one position.
    pub fn frames_per_append_position(&self) -> u64 {
        self.middle_dimensions()
            .iter()
            .map(|d| u64::from(d.array_size_px))
            .product()
    }

    pub fn validate(&self) -> crate::Result<()> {
        validate_dimensions(&self.image_shape, &self.dimensions)
    }
}

pub(crate) fn validate_dimensions(
    image_shape: &ImageShape,
    dimensions: &[Dimension],
) -> crate::Result<()> {
    if dimensions.len() < 3 {
        return Err(crate::Error::InvalidConfig(format!(
            "expected at least 3 dimensions, got {}",
            dimensions.len()
        )));
    }
    for (i, dim) in dimensions.iter().enumerate() {
        if dim.chunk_size_px == 0 || dim.shard_size_chunks == 0 {
            return Err(crate::Error::InvalidConfig(format!(
                "dimension {:?} needs positive chunk and shard sizes",
                dim.name
            )));
        }
        if i > 0 && dim.array_size_px == 0 {
            return Err(crate::Error::InvalidConfig(format!(
                "only the append dimension may be unbounded, not {:?}",
                dim.name
            )));
        }
    }
    let n = dimensions.len();
    if dimensions[n - 2].array_size_px != image_shape.height
        || dimensions[n - 1].array_size_px != image_shape.width
    {
        return Err(crate::Error::InvalidConfig(format!(
            "spatial dimensions {}x{} do not match image {}x{}",
            dimensions[n - 1].array_size_px,
            dimensions[n - 2].array_size_px,
            image_shape.width,
            image_shape.height
        )));
    }
    Ok(())
}

fn default_backpressure_timeout_ms() -> u64 {
    5000
}

/// Dataset-level settings, loadable from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub dataset_root: PathBuf,
    pub image_shape: ImageShape,
    /// Outer-to-inner.
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub enable_multiscale: bool,
    /// Free-form JSON (comments allowed) stored in the group attributes.
    #[serde(default)]
    pub external_metadata: String,
    #[serde(default)]
    pub compression: Option<BloscCompressionParams>,
    /// Worker threads for compression and I/O; 0 lets rayon decide.
    #[serde(default)]
    pub num_threads: usize,
    /// How long `append` waits for an in-flight chunk buffer.
    #[serde(default = "default_backpressure_timeout_ms")]
    pub backpressure_timeout_ms: u64,
}

impl DatasetConfig {
    pub fn new(
        dataset_root: impl AsRef<Path>,
        image_shape: ImageShape,
        dimensions: Vec<Dimension>,
    ) -> Self {
        Self {
            dataset_root: dataset_root.as_ref().to_path_buf(),
            image_shape,
            dimensions,
            enable_multiscale: false,
            external_metadata: String::new(),
            compression: None,
            num_threads: 0,
            backpressure_timeout_ms: default_backpressure_timeout_ms(),
        }
    }

    pub fn from_json_str(s: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_multiscale(mut self, enable: bool) -> Self {
        self.enable_multiscale = enable;
        self
    }

    pub fn with_compression(mut self, params: BloscCompressionParams) -> Self {
        self.compression = Some(params);
        self
    }

    pub fn with_external_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.external_metadata = metadata.into();
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        validate_dimensions(&self.image_shape, &self.dimensions)
    }
}
