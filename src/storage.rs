use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::chunk::unravel;
use crate::chunk_key_encoding::ShardKeyEncoding;

/// Byte-range write target.
pub trait Sink: Send {
    /// Write `bytes` starting at `offset`, extending the target if needed.
    fn write(&mut self, offset: u64, bytes: &[u8]) -> crate::Result<()>;

    fn flush(&mut self) -> crate::Result<()>;
}

/// A [`Sink`] backed by a file on disk.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    /// Create (or truncate) the file at `path`. The parent directory must exist.
    pub fn create(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .inspect_err(|e| error!("failed to create {path:?}: {e}"))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn write(&mut self, offset: u64, bytes: &[u8]) -> crate::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Materializes the shard files of one array.
///
/// Files for a rollover segment live under `<base>/c<segment>/...`, one
/// directory level per non-append dimension, so no directory holds more
/// entries than the shard grid has along one axis.
#[derive(Debug, Clone)]
pub struct FileCreator {
    base_dir: PathBuf,
    key_encoding: ShardKeyEncoding,
}

impl FileCreator {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            key_encoding: ShardKeyEncoding,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the shard at `grid_indices` (segment first) in this array.
    pub fn shard_path(&self, segment: u64, grid_indices: &[u64]) -> PathBuf {
        let mut key = Vec::with_capacity(grid_indices.len() + 1);
        key.push(segment);
        key.extend_from_slice(grid_indices);
        self.key_encoding.to_path(&self.base_dir, &key)
    }

    /// Create the file set for `segment` over a shard grid of extents `grid`.
    ///
    /// Files are returned in row-major order of their grid coordinates.
    /// Re-invoking for the same segment truncates its files.
    pub fn create(&self, segment: u64, grid: &[u64]) -> crate::Result<Vec<FileSink>> {
        let n_files: u64 = grid.iter().product();
        let mut files = Vec::with_capacity(n_files as usize);
        for i in 0..n_files {
            let path = self.shard_path(segment, &unravel(i, grid));
            if let Some(parent) = path.parent() {
                Self::create_dir(parent)?;
            }
            files.push(FileSink::create(path)?);
        }
        debug!(
            "created {} shard files for segment {segment} under {:?}",
            files.len(),
            self.base_dir
        );
        Ok(files)
    }

    /// Create one file per path, making parent directories as needed.
    pub fn create_metadata_sinks(paths: &[PathBuf]) -> crate::Result<Vec<FileSink>> {
        paths
            .iter()
            .map(|path| {
                if let Some(parent) = path.parent() {
                    Self::create_dir(parent)?;
                }
                FileSink::create(path.clone())
            })
            .collect()
    }

    fn create_dir(dir: &Path) -> crate::Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| {
            error!("failed to create directory {dir:?}: {e}");
            crate::Error::from(e)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory sink for exercising byte-range writes.
    #[derive(Debug, Default)]
    pub(crate) struct MemorySink(pub Vec<u8>);

    impl Sink for MemorySink {
        fn write(&mut self, offset: u64, bytes: &[u8]) -> crate::Result<()> {
            let end = offset as usize + bytes.len();
            if self.0.len() < end {
                self.0.resize(end, 0);
            }
            self.0[offset as usize..end].copy_from_slice(bytes);
            Ok(())
        }

        fn flush(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn creates_one_file_per_shard() {
        let dir = tempfile::TempDir::new().unwrap();
        let creator = FileCreator::new(dir.path().join("data/root/0"));
        let files = creator.create(2, &[3, 2, 2]).unwrap();
        assert_eq!(files.len(), 12);
        assert_eq!(files[0].path(), dir.path().join("data/root/0/c2/0/0/0"));
        assert_eq!(files[11].path(), dir.path().join("data/root/0/c2/2/1/1"));
        for f in &files {
            assert!(f.path().is_file());
        }
    }

    #[test]
    fn shard_count_follows_grid() {
        let dir = tempfile::TempDir::new().unwrap();
        let creator = FileCreator::new(dir.path());
        // 10 chunks along x in shards of 4
        let files = creator.create(0, &[1, 10_u64.div_ceil(4)]).unwrap();
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn recreating_segment_truncates() {
        let dir = tempfile::TempDir::new().unwrap();
        let creator = FileCreator::new(dir.path());
        let mut files = creator.create(0, &[1, 1]).unwrap();
        files[0].write(0, b"hello").unwrap();
        files[0].flush().unwrap();
        drop(files);
        let files = creator.create(0, &[1, 1]).unwrap();
        assert_eq!(std::fs::metadata(files[0].path()).unwrap().len(), 0);
    }

    #[test]
    fn file_sink_writes_at_offset() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sink");
        let mut sink = FileSink::create(&path).unwrap();
        sink.write(4, b"tail").unwrap();
        sink.write(0, b"head").unwrap();
        sink.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"headtail");
    }

    #[test]
    fn creation_fails_under_a_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let creator = FileCreator::new(blocker.join("root"));
        assert!(matches!(creator.create(0, &[1, 1]), Err(crate::Error::Io(_))));
    }
}
