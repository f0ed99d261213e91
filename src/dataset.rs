use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::{ArrayConfig, DatasetConfig};
use crate::downsample::{downsample, halve_frame};
use crate::frame::Frame;
use crate::metadata::{ArrayMetadata, BaseMetadata, GroupMetadata, to_json_bytes};
use crate::storage::{FileCreator, FileSink, Sink};
use crate::writer::Writer;

/// Capabilities reported to the host.
///
/// Multiscale output is produced internally when enabled in the
/// [`DatasetConfig`] but is not advertised here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCapabilities {
    pub chunking_is_supported: bool,
    pub sharding_is_supported: bool,
    pub multiscale_is_supported: bool,
}

/// A Zarr v3 (core protocol 3.0 draft) dataset written from a frame stream.
///
/// Owns one [`Writer`] per pyramid level, level 0 being full resolution.
///
/// ```text
/// <root>/zarr.json
/// <root>/meta/root.group.json
/// <root>/meta/root/<level>.array.json
/// <root>/data/root/<level>/c<i>/.../<k>
/// ```
pub struct ZarrV3 {
    config: DatasetConfig,
    pool: Arc<ThreadPool>,
    writers: Vec<Writer>,
    metadata_sinks: Vec<FileSink>,
    finalized: bool,
    failed: bool,
}

impl ZarrV3 {
    pub fn new(config: DatasetConfig) -> crate::Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("zarr-writer-{i}"))
            .build()
            .map_err(crate::Error::wrap)?;
        std::fs::create_dir_all(&config.dataset_root)?;

        let mut zarr = Self {
            config,
            pool: Arc::new(pool),
            writers: Vec::new(),
            metadata_sinks: Vec::new(),
            finalized: false,
            failed: false,
        };
        zarr.allocate_writers()?;
        Ok(zarr)
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn get_meta(&self) -> StorageCapabilities {
        StorageCapabilities {
            chunking_is_supported: true,
            sharding_is_supported: true,
            multiscale_is_supported: false,
        }
    }

    /// Number of pyramid levels, at least one.
    pub fn level_count(&self) -> usize {
        self.writers.len()
    }

    pub fn writer(&self, level: usize) -> Option<&Writer> {
        self.writers.get(level)
    }

    fn level_data_root(&self, level: usize) -> PathBuf {
        self.config
            .dataset_root
            .join("data")
            .join("root")
            .join(level.to_string())
    }

    fn allocate_writers(&mut self) -> crate::Result<()> {
        self.writers.clear();
        let timeout = self.config.backpressure_timeout();

        let mut config = ArrayConfig {
            image_shape: self.config.image_shape,
            dimensions: self.config.dimensions.clone(),
            data_root: self.level_data_root(0),
            compression_params: self.config.compression.clone(),
        };
        self.writers
            .push(Writer::new(config.clone(), Arc::clone(&self.pool), timeout)?);

        if self.config.enable_multiscale {
            while let Some(mut next) = downsample(&config) {
                next.data_root = self.level_data_root(self.writers.len());
                debug!(
                    "level {} is {}x{}",
                    self.writers.len(),
                    next.image_shape.width,
                    next.image_shape.height
                );
                self.writers
                    .push(Writer::new(next.clone(), Arc::clone(&self.pool), timeout)?);
                config = next;
            }
        }

        info!(
            "allocated {} level(s) under {:?}",
            self.writers.len(),
            self.config.dataset_root
        );
        Ok(())
    }

    /// Document paths, in sink order: top level, group, then one per level.
    pub fn make_metadata_sink_paths(&self) -> Vec<PathBuf> {
        let root = &self.config.dataset_root;
        let meta = root.join("meta");
        let mut paths = vec![root.join("zarr.json"), meta.join("root.group.json")];
        paths.extend(
            (0..self.writers.len()).map(|level| meta.join("root").join(format!("{level}.array.json"))),
        );
        paths
    }

    /// Write a frame to every level, reducing it on the way down the pyramid.
    ///
    /// Every level is checked before any is written, so a rejected frame is
    /// stored nowhere and can be retried.
    pub fn append(&mut self, frame: &Frame) -> crate::Result<()> {
        if self.finalized {
            return Err(crate::Error::general("dataset is finalized"));
        }

        let mut frames = Vec::with_capacity(self.writers.len());
        frames.push(frame.clone());
        for _ in 1..self.writers.len() {
            let next = halve_frame(&frames[frames.len() - 1])?;
            frames.push(next);
        }

        for (writer, frame) in self.writers.iter_mut().zip(&frames) {
            writer.prepare(frame)?;
        }
        for (writer, frame) in self.writers.iter_mut().zip(&frames) {
            writer.write(frame)?;
        }
        Ok(())
    }

    /// Finalize every writer, then write all metadata documents.
    ///
    /// If any writer fails, the others are still finalized but no metadata is
    /// written. Later calls return [`crate::Error::Aborted`] after a failure
    /// and do nothing after a success.
    pub fn finalize(&mut self) -> crate::Result<()> {
        if self.finalized {
            if self.failed {
                return Err(crate::Error::Aborted(self.config.dataset_root.clone()));
            }
            return Ok(());
        }
        self.finalized = true;

        let result = self.finalize_levels_and_metadata();
        match &result {
            Ok(()) => info!("finalized dataset {:?}", self.config.dataset_root),
            Err(e) => {
                self.failed = true;
                error!("failed to finalize dataset {:?}: {e}", self.config.dataset_root);
            }
        }
        result
    }

    fn finalize_levels_and_metadata(&mut self) -> crate::Result<()> {
        let mut first_error = None;
        for (level, writer) in self.writers.iter_mut().enumerate() {
            if let Err(e) = writer.finalize() {
                error!("level {level} failed to finalize: {e}");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // Fail on malformed external metadata before any document is written.
        self.group_metadata()?;
        self.write_base_metadata()?;
        self.write_group_metadata()?;
        for level in 0..self.writers.len() {
            self.write_array_metadata(level)?;
        }
        Ok(())
    }

    pub fn base_metadata(&self) -> BaseMetadata {
        BaseMetadata::default()
    }

    pub fn group_metadata(&self) -> crate::Result<GroupMetadata> {
        GroupMetadata::new(&self.config.external_metadata)
    }

    /// # Panics
    ///
    /// If `level` is not an allocated level.
    pub fn array_metadata(&self, level: usize) -> ArrayMetadata {
        let writer = &self.writers[level];
        ArrayMetadata::new(writer.config(), writer.frames_written())
    }

    pub fn write_base_metadata(&mut self) -> crate::Result<()> {
        let bytes = to_json_bytes(&self.base_metadata())?;
        self.write_metadata(0, &bytes)
    }

    pub fn write_group_metadata(&mut self) -> crate::Result<()> {
        let bytes = to_json_bytes(&self.group_metadata()?)?;
        self.write_metadata(1, &bytes)
    }

    /// Write the document of `level`, whose writer must be finalized.
    ///
    /// # Panics
    ///
    /// If `level` is not an allocated level.
    pub fn write_array_metadata(&mut self, level: usize) -> crate::Result<()> {
        assert!(
            level < self.writers.len(),
            "level {level} out of range for {} levels",
            self.writers.len()
        );
        if !self.writers[level].is_finalized() {
            return Err(crate::Error::general(format!(
                "level {level} must be finalized before its metadata is written"
            )));
        }
        let bytes = to_json_bytes(&self.array_metadata(level))?;
        self.write_metadata(2 + level, &bytes)
    }

    fn write_metadata(&mut self, sink_index: usize, bytes: &[u8]) -> crate::Result<()> {
        if self.metadata_sinks.is_empty() {
            self.metadata_sinks =
                FileCreator::create_metadata_sinks(&self.make_metadata_sink_paths())?;
        }
        assert!(
            sink_index < self.metadata_sinks.len(),
            "metadata sink {sink_index} out of range for {} sinks",
            self.metadata_sinks.len()
        );
        let sink = &mut self.metadata_sinks[sink_index];
        sink.write(0, bytes)?;
        sink.flush()?;
        debug!("wrote {} bytes to {:?}", bytes.len(), sink.path());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Dimension;
    use crate::frame::{ImageShape, SampleType};

    fn config(root: &std::path::Path, multiscale: bool) -> DatasetConfig {
        DatasetConfig::new(
            root,
            ImageShape::new(512, 512, SampleType::U8),
            vec![
                Dimension::new("t", 0, 4, 1),
                Dimension::new("y", 512, 64, 2),
                Dimension::new("x", 512, 64, 2),
            ],
        )
        .with_multiscale(multiscale)
        .with_num_threads(2)
    }

    #[test]
    fn single_level_without_multiscale() {
        let dir = tempfile::TempDir::new().unwrap();
        let zarr = ZarrV3::new(config(dir.path(), false)).unwrap();
        assert_eq!(zarr.level_count(), 1);
        assert_eq!(zarr.make_metadata_sink_paths().len(), 3);
    }

    #[test]
    fn pyramid_down_to_one_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let zarr = ZarrV3::new(config(dir.path(), true)).unwrap();
        assert_eq!(zarr.level_count(), 4);
        let widths: Vec<u32> = (0..4)
            .map(|l| zarr.writer(l).unwrap().config().image_shape.width)
            .collect();
        assert_eq!(widths, vec![512, 256, 128, 64]);
        assert_eq!(
            zarr.writer(3).unwrap().data_root(),
            dir.path().join("data/root/3")
        );
    }

    #[test]
    fn sink_paths_follow_level_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let zarr = ZarrV3::new(config(dir.path(), true)).unwrap();
        let paths = zarr.make_metadata_sink_paths();
        assert_eq!(paths[0], dir.path().join("zarr.json"));
        assert_eq!(paths[1], dir.path().join("meta/root.group.json"));
        for level in 0..zarr.level_count() {
            assert_eq!(
                paths[2 + level],
                dir.path().join(format!("meta/root/{level}.array.json"))
            );
        }
    }

    #[test]
    fn capabilities() {
        let dir = tempfile::TempDir::new().unwrap();
        let zarr = ZarrV3::new(config(dir.path(), true)).unwrap();
        let meta = zarr.get_meta();
        assert!(meta.sharding_is_supported);
        assert!(!meta.multiscale_is_supported);
    }

    #[test]
    fn array_metadata_requires_finalized_writer() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut zarr = ZarrV3::new(config(dir.path(), false)).unwrap();
        assert!(zarr.write_array_metadata(0).is_err());
        zarr.finalize().unwrap();
    }

    #[test]
    fn stalled_level_rejects_frame_everywhere() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(dir.path(), true).with_backpressure_timeout(Duration::from_millis(20));
        let mut zarr = ZarrV3::new(config).unwrap();
        let release = zarr.writers[2].stall_slot(0);
        let frame = Frame::new(zarr.config().image_shape, 0, vec![7u8; 512 * 512]);

        let err = zarr.append(&frame).unwrap_err();
        assert!(matches!(err, crate::Error::Backpressure { .. }));
        for level in 0..zarr.level_count() {
            assert_eq!(zarr.writer(level).unwrap().frames_written(), 0);
        }

        release();
        zarr.append(&frame).unwrap();
        for level in 0..zarr.level_count() {
            assert_eq!(zarr.writer(level).unwrap().frames_written(), 1);
        }
        zarr.finalize().unwrap();
    }

    #[test]
    fn failed_finalize_stays_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = config(dir.path(), false).with_external_metadata("{\"objective\": ");
        let mut zarr = ZarrV3::new(config).unwrap();
        let frame = Frame::new(zarr.config().image_shape, 0, vec![1u8; 512 * 512]);
        zarr.append(&frame).unwrap();

        assert!(matches!(
            zarr.finalize(),
            Err(crate::Error::ExternalMetadata(_))
        ));
        assert!(matches!(zarr.finalize(), Err(crate::Error::Aborted(_))));
        for path in zarr.make_metadata_sink_paths() {
            assert!(!path.exists());
        }
    }
}
