use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rayon::ThreadPool;
use rayon::prelude::*;

use crate::chunk::{ChunkLayout, ShardIndex, ShardLocation};
use crate::codec::Compressor;
use crate::config::ArrayConfig;
use crate::frame::Frame;
use crate::storage::{FileCreator, FileSink, Sink};

/// A shard file being appended to; the index is written on close.
struct ShardFile<S: Sink = FileSink> {
    sink: S,
    offset: u64,
    index: ShardIndex,
}

impl<S: Sink> ShardFile<S> {
    fn new(sink: S, chunks_per_shard: usize) -> Self {
        Self {
            sink,
            offset: 0,
            index: ShardIndex::new(chunks_per_shard),
        }
    }

    fn append(&mut self, chunk_in_shard: usize, payload: &[u8]) -> crate::Result<()> {
        self.sink.write(self.offset, payload)?;
        self.index.set(chunk_in_shard, self.offset, payload.len() as u64);
        self.offset += payload.len() as u64;
        Ok(())
    }

    fn close(mut self) -> crate::Result<S> {
        let index = self.index.to_bytes();
        self.sink.write(self.offset, &index)?;
        self.sink.flush()?;
        Ok(self.sink)
    }
}

/// The open file set of the current rollover segment.
struct ShardSet {
    file_creator: FileCreator,
    grid: Vec<u64>,
    chunks_per_shard: usize,
    segment: Option<u64>,
    files: Vec<ShardFile>,
}

impl ShardSet {
    fn files_for(&mut self, segment: u64) -> crate::Result<&mut [ShardFile]> {
        if self.segment != Some(segment) {
            self.close()?;
            if segment > 0 {
                debug!(
                    "rolling over {:?} to segment {segment}",
                    self.file_creator.base_dir()
                );
            }
            self.files = self
                .file_creator
                .create(segment, &self.grid)?
                .into_iter()
                .map(|sink| ShardFile::new(sink, self.chunks_per_shard))
                .collect();
            self.segment = Some(segment);
        }
        Ok(&mut self.files)
    }

    fn append(&mut self, location: &ShardLocation, payload: &[u8]) -> crate::Result<()> {
        let files = self.files_for(location.segment)?;
        files[location.file].append(location.chunk_in_shard, payload)
    }

    fn close(&mut self) -> crate::Result<()> {
        let mut result = Ok(());
        for file in self.files.drain(..) {
            if let Err(e) = file.close() {
                error!("failed to close shard: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.segment = None;
        result
    }
}

/// What a flush task hands back for one slot.
struct Returned {
    /// The slot's buffer, zeroed for the next layer.
    buffer: Vec<u8>,
    status: crate::Result<()>,
}

/// One chunk buffer and its readiness.
///
/// While a flush task holds the buffer, `in_flight` receives it back.
struct ChunkSlot {
    buffer: Vec<u8>,
    /// Tile planes copied in during the current layer.
    frames: u32,
    in_flight: Option<Receiver<Returned>>,
}

struct FlushJob {
    location: ShardLocation,
    buffer: Vec<u8>,
    done: Sender<Returned>,
}

/// Compress a layer's chunks in parallel, then append them in slot order.
fn flush_chunks(jobs: Vec<FlushJob>, compressor: &Compressor, shards: &Mutex<ShardSet>) {
    let compressed: Vec<_> = jobs
        .par_iter()
        .map(|job| compressor.compress(&job.buffer))
        .collect();

    let mut statuses = Vec::with_capacity(jobs.len());
    {
        let mut shards = shards.lock();
        let mut failed = false;
        for (job, payload) in jobs.iter().zip(compressed) {
            if failed {
                statuses.push(Err(crate::Error::general(
                    "chunk skipped after an earlier failure",
                )));
                continue;
            }
            let status = payload.and_then(|p| shards.append(&job.location, &p));
            failed = status.is_err();
            statuses.push(status);
        }
    }

    for (job, status) in jobs.into_iter().zip(statuses) {
        if let Err(e) = &status {
            error!("failed to write chunk at {:?}: {e}", job.location);
        }
        let mut buffer = job.buffer;
        buffer.fill(0);
        // The writer may have been dropped without finalizing.
        let _ = job.done.send(Returned { buffer, status });
    }
}

/// Streams frames of one array into chunked, sharded storage.
///
/// Frames are tiled into chunk buffers. When a layer (one chunk along the
/// append axis) is complete, its buffers are handed to the worker pool for
/// compression and writing. A buffer cannot be refilled until its task hands
/// it back, which is where [`Writer::write`] applies backpressure.
pub struct Writer {
    config: ArrayConfig,
    layout: ChunkLayout,
    compressor: Compressor,
    pool: Arc<ThreadPool>,
    backpressure_timeout: Duration,
    slots: Vec<ChunkSlot>,
    shards: Arc<Mutex<ShardSet>>,
    frames_written: u64,
    frames_in_layer: u64,
    current_chunk: u64,
    failed: bool,
    finalized: bool,
}

impl Writer {
    pub fn new(
        config: ArrayConfig,
        pool: Arc<ThreadPool>,
        backpressure_timeout: Duration,
    ) -> crate::Result<Self> {
        config.validate()?;
        let layout = ChunkLayout::new(&config);
        let compressor = Compressor::new(
            config.compression_params.as_ref(),
            config.image_shape.sample_type.bytes_per_sample(),
        )?;

        let mut shards = ShardSet {
            file_creator: FileCreator::new(&config.data_root),
            grid: layout.shard_grid(),
            chunks_per_shard: layout.chunks_per_shard(),
            segment: None,
            files: Vec::new(),
        };
        shards.files_for(0)?;

        let slots = (0..layout.slot_count())
            .map(|_| ChunkSlot {
                buffer: vec![0; layout.bytes_per_chunk()],
                frames: 0,
                in_flight: None,
            })
            .collect();

        debug!(
            "writer for {:?}: {} buffers of {} bytes, {} frames per layer, {} shards per segment",
            config.data_root,
            layout.slot_count(),
            layout.bytes_per_chunk(),
            layout.frames_per_layer(),
            layout.shards_per_segment()
        );

        Ok(Self {
            config,
            layout,
            compressor,
            pool,
            backpressure_timeout,
            slots,
            shards: Arc::new(Mutex::new(shards)),
            frames_written: 0,
            frames_in_layer: 0,
            current_chunk: 0,
            failed: false,
            finalized: false,
        })
    }

    pub fn config(&self) -> &ArrayConfig {
        &self.config
    }

    pub fn data_root(&self) -> &Path {
        &self.config.data_root
    }

    /// Frames accepted so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Check that `frame` can be written without waiting on in-flight buffers.
    ///
    /// Takes back the buffers of the previous layer if a new one is about to
    /// start. Never changes `frames_written`.
    pub fn prepare(&mut self, frame: &Frame) -> crate::Result<()> {
        if self.finalized {
            return Err(crate::Error::general(format!(
                "writer for {:?} is finalized",
                self.config.data_root
            )));
        }
        if self.failed {
            return Err(crate::Error::Aborted(self.config.data_root.clone()));
        }
        self.validate_frame(frame)?;
        if self.frames_in_layer == 0 {
            self.reclaim(Some(self.backpressure_timeout))?;
        }
        Ok(())
    }

    /// Accept one frame.
    ///
    /// Validation and backpressure failures leave the writer unchanged and
    /// usable. A failed chunk write aborts the array: this and later calls
    /// return an error.
    pub fn write(&mut self, frame: &Frame) -> crate::Result<()> {
        self.prepare(frame)?;

        let placement = self.layout.place_frame(self.frames_in_layer);
        let plane = self.layout.bytes_per_tile_plane();
        let tiles_x = self.layout.tiles_x();
        for ty in 0..self.layout.tiles_y() {
            for tx in 0..tiles_x {
                let slot = &mut self.slots[placement.first_slot + ty * tiles_x + tx];
                let dst = &mut slot.buffer[placement.plane_offset..placement.plane_offset + plane];
                self.layout.copy_tile(&frame.data, ty, tx, dst);
                slot.frames += 1;
            }
        }

        self.frames_written += 1;
        self.frames_in_layer += 1;
        if self.frames_in_layer == self.layout.frames_per_layer() {
            self.flush_layer();
        }
        Ok(())
    }

    /// Flush the partial layer, wait for all writes, and close the shard files.
    ///
    /// Calling again does nothing after a successful call, and returns
    /// [`crate::Error::Aborted`] after a failed one.
    pub fn finalize(&mut self) -> crate::Result<()> {
        if self.finalized {
            if self.failed {
                return Err(crate::Error::Aborted(self.config.data_root.clone()));
            }
            return Ok(());
        }
        self.finalized = true;

        if !self.failed && self.frames_in_layer > 0 {
            debug!(
                "flushing partial layer of {} frames for {:?}",
                self.frames_in_layer, self.config.data_root
            );
            self.flush_layer();
        }

        let mut result = self.reclaim(None);
        let closed = self.shards.lock().close();
        if result.is_ok() {
            result = closed;
        }
        if result.is_ok() && self.failed {
            result = Err(crate::Error::Aborted(self.config.data_root.clone()));
        }

        match &result {
            Ok(()) => info!(
                "finalized {:?} after {} frames",
                self.config.data_root, self.frames_written
            ),
            Err(e) => {
                self.failed = true;
                error!("failed to finalize {:?}: {e}", self.config.data_root);
            }
        }
        result
    }

    fn validate_frame(&self, frame: &Frame) -> crate::Result<()> {
        let expected = &self.config.image_shape;
        if frame.shape.sample_type != expected.sample_type {
            return Err(crate::Error::InvalidFrame(format!(
                "expected sample type {:?}, got {:?}",
                expected.sample_type, frame.shape.sample_type
            )));
        }
        if frame.shape.width != expected.width || frame.shape.height != expected.height {
            return Err(crate::Error::InvalidFrame(format!(
                "expected {}x{} frame, got {}x{}",
                expected.width, expected.height, frame.shape.width, frame.shape.height
            )));
        }
        if frame.data.len() != expected.bytes_of_image() {
            return Err(crate::Error::InvalidFrame(format!(
                "expected {} bytes of frame data, got {}",
                expected.bytes_of_image(),
                frame.data.len()
            )));
        }
        Ok(())
    }

    /// Hand the current layer's filled buffers to the pool and start the next layer.
    fn flush_layer(&mut self) {
        let layer = self.current_chunk;
        let mut jobs = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.frames == 0 {
                continue;
            }
            let (done, returned) = crossbeam_channel::bounded(1);
            jobs.push(FlushJob {
                location: self.layout.locate(layer, i),
                buffer: std::mem::take(&mut slot.buffer),
                done,
            });
            slot.frames = 0;
            slot.in_flight = Some(returned);
        }

        self.frames_in_layer = 0;
        self.current_chunk += 1;
        if jobs.is_empty() {
            return;
        }

        debug!(
            "scheduling {} chunks of layer {layer} for {:?}",
            jobs.len(),
            self.config.data_root
        );
        let compressor = self.compressor.clone();
        let shards = Arc::clone(&self.shards);
        self.pool.spawn(move || flush_chunks(jobs, &compressor, &shards));
    }

    /// Take back buffers from finished flush tasks.
    ///
    /// With a timeout, gives up once it elapses and reports backpressure;
    /// without one, blocks until every task is done.
    fn reclaim(&mut self, timeout: Option<Duration>) -> crate::Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let bytes_per_chunk = self.layout.bytes_per_chunk();
        let mut first_error = None;
        let mut pending = false;

        for slot in &mut self.slots {
            let Some(returned) = slot.in_flight.take() else {
                continue;
            };
            let received = match deadline {
                Some(deadline) => returned.recv_deadline(deadline),
                None => returned.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Returned { buffer, status }) => {
                    slot.buffer = buffer;
                    if let Err(e) = status {
                        first_error.get_or_insert(e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    slot.in_flight = Some(returned);
                    pending = true;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    slot.buffer = vec![0; bytes_per_chunk];
                    first_error.get_or_insert(crate::Error::general(
                        "flush task ended without returning its buffer",
                    ));
                }
            }
        }

        if let Some(e) = first_error {
            self.failed = true;
            return Err(e);
        }
        if pending {
            warn!(
                "chunk buffers for {:?} still in flight",
                self.config.data_root
            );
            return Err(crate::Error::Backpressure {
                data_root: self.config.data_root.clone(),
                waited: timeout.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                "writer for {:?} dropped without finalize",
                self.config.data_root
            );
            if let Err(e) = self.finalize() {
                error!("finalize on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
impl Writer {
    /// Hold the buffer of `slot` as if a flush task had it, until the returned closure runs.
    pub(crate) fn stall_slot(&mut self, slot: usize) -> Box<dyn FnOnce() + Send> {
        let (done, returned) = crossbeam_channel::bounded(1);
        let buffer = std::mem::take(&mut self.slots[slot].buffer);
        self.slots[slot].in_flight = Some(returned);
        Box::new(move || {
            done.send(Returned {
                buffer,
                status: Ok(()),
            })
            .unwrap();
        })
    }
}
