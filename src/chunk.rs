use crate::config::ArrayConfig;

/// Index entry marking a chunk that was never written to its shard.
pub const MISSING_CHUNK: u64 = u64::MAX;

/// Row-major index of `coords` in a grid of `extents`.
pub(crate) fn ravel(coords: &[u64], extents: &[u64]) -> u64 {
    coords
        .iter()
        .zip(extents)
        .fold(0, |acc, (&c, &e)| acc * e + c)
}

/// Inverse of [`ravel`].
pub(crate) fn unravel(mut index: u64, extents: &[u64]) -> Vec<u64> {
    let mut coords = vec![0; extents.len()];
    for (c, &e) in coords.iter_mut().zip(extents).rev() {
        *c = index % e;
        index /= e;
    }
    coords
}

/// Where one frame lands inside the buffers of the current layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlacement {
    /// Slot of the tile at (0, 0); tile (ty, tx) is at `first_slot + ty * tiles_x + tx`.
    pub first_slot: usize,
    /// Byte offset of this frame's tile plane within each chunk buffer.
    pub plane_offset: usize,
}

/// Where one chunk buffer is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLocation {
    /// Rollover segment, i.e. the shard index along the append axis.
    pub segment: u64,
    /// Shard file within the segment's file set.
    pub file: usize,
    /// Entry in that shard's index.
    pub chunk_in_shard: usize,
}

/// Tile, chunk and shard geometry of one array.
///
/// A layer is the set of frames spanning one chunk along the append axis.
/// Every layer has one buffer per (middle chunk, tile row, tile column),
/// ordered row-major.
#[derive(Debug, Clone)]
pub struct ChunkLayout {
    bytes_per_sample: usize,
    frame_width: usize,
    frame_height: usize,
    tile_width: usize,
    tile_height: usize,
    tiles_x: usize,
    tiles_y: usize,
    append_chunk: u64,
    append_shard: u64,
    middle_sizes: Vec<u64>,
    middle_chunks: Vec<u64>,
    /// Chunks per non-append dimension.
    chunk_counts: Vec<u64>,
    /// Shard size in chunks per non-append dimension.
    shard_sizes: Vec<u64>,
}

impl ChunkLayout {
    pub fn new(config: &ArrayConfig) -> Self {
        let y = config.y_dimension();
        let x = config.x_dimension();
        let append = config.append_dimension();
        let middle = config.middle_dimensions();

        let non_append = &config.dimensions[1..];
        Self {
            bytes_per_sample: config.image_shape.sample_type.bytes_per_sample(),
            frame_width: config.image_shape.width as usize,
            frame_height: config.image_shape.height as usize,
            tile_width: x.chunk_size_px as usize,
            tile_height: y.chunk_size_px as usize,
            tiles_x: x.chunk_count() as usize,
            tiles_y: y.chunk_count() as usize,
            append_chunk: u64::from(append.chunk_size_px),
            append_shard: u64::from(append.shard_size_chunks),
            middle_sizes: middle.iter().map(|d| u64::from(d.array_size_px)).collect(),
            middle_chunks: middle.iter().map(|d| u64::from(d.chunk_size_px)).collect(),
            chunk_counts: non_append.iter().map(|d| d.chunk_count()).collect(),
            shard_sizes: non_append
                .iter()
                .map(|d| u64::from(d.shard_size_chunks))
                .collect(),
        }
    }

    pub fn tiles_x(&self) -> usize {
        self.tiles_x
    }

    pub fn tiles_y(&self) -> usize {
        self.tiles_y
    }

    pub fn tiles_per_frame(&self) -> usize {
        self.tiles_x * self.tiles_y
    }

    /// Number of chunk buffers held at once.
    pub fn slot_count(&self) -> usize {
        let middle: u64 = self.chunk_counts[..self.middle_sizes.len()].iter().product();
        middle as usize * self.tiles_per_frame()
    }

    pub fn frames_per_layer(&self) -> u64 {
        self.append_chunk * self.middle_sizes.iter().product::<u64>()
    }

    pub fn bytes_per_tile_plane(&self) -> usize {
        self.tile_width * self.tile_height * self.bytes_per_sample
    }

    pub fn bytes_per_chunk(&self) -> usize {
        let planes = self.append_chunk * self.middle_chunks.iter().product::<u64>();
        planes as usize * self.bytes_per_tile_plane()
    }

    /// Append chunks per shard, i.e. layers per rollover segment.
    pub fn layers_per_segment(&self) -> u64 {
        self.append_shard
    }

    /// Shard grid of one segment, one entry per non-append dimension.
    pub fn shard_grid(&self) -> Vec<u64> {
        self.chunk_counts
            .iter()
            .zip(&self.shard_sizes)
            .map(|(&n, &s)| n.div_ceil(s))
            .collect()
    }

    pub fn shards_per_segment(&self) -> usize {
        self.shard_grid().iter().product::<u64>() as usize
    }

    pub fn chunks_per_shard(&self) -> usize {
        (self.append_shard * self.shard_sizes.iter().product::<u64>()) as usize
    }

    pub fn place_frame(&self, frame_in_layer: u64) -> FramePlacement {
        let mut extents = Vec::with_capacity(self.middle_sizes.len() + 1);
        extents.push(self.append_chunk);
        extents.extend_from_slice(&self.middle_sizes);
        let coords = unravel(frame_in_layer, &extents);

        let mut chunk_coords = Vec::with_capacity(self.middle_sizes.len());
        let mut plane_coords = Vec::with_capacity(extents.len());
        plane_coords.push(coords[0]);
        for (&m, &chunk) in coords[1..].iter().zip(&self.middle_chunks) {
            chunk_coords.push(m / chunk);
            plane_coords.push(m % chunk);
        }

        let middle_counts = &self.chunk_counts[..self.middle_sizes.len()];
        let mut plane_extents = Vec::with_capacity(extents.len());
        plane_extents.push(self.append_chunk);
        plane_extents.extend_from_slice(&self.middle_chunks);

        let middle_slot = ravel(&chunk_coords, middle_counts) as usize;
        let plane = ravel(&plane_coords, &plane_extents) as usize;
        FramePlacement {
            first_slot: middle_slot * self.tiles_per_frame(),
            plane_offset: plane * self.bytes_per_tile_plane(),
        }
    }

    /// Copy tile (`ty`, `tx`) of a row-major frame into `dst`.
    ///
    /// Edge tiles only fill their valid region; the rest of `dst` is left untouched.
    pub fn copy_tile(&self, frame: &[u8], ty: usize, tx: usize, dst: &mut [u8]) {
        let bps = self.bytes_per_sample;
        let y0 = ty * self.tile_height;
        let x0 = tx * self.tile_width;
        let rows = self.tile_height.min(self.frame_height - y0);
        let row_bytes = self.tile_width.min(self.frame_width - x0) * bps;
        let frame_stride = self.frame_width * bps;
        let tile_stride = self.tile_width * bps;

        for r in 0..rows {
            let src = (y0 + r) * frame_stride + x0 * bps;
            let out = r * tile_stride;
            dst[out..out + row_bytes].copy_from_slice(&frame[src..src + row_bytes]);
        }
    }

    /// Storage location of `slot` in append chunk `layer`.
    pub fn locate(&self, layer: u64, slot: usize) -> ShardLocation {
        // slots are ordered like the chunk grid of the non-append dimensions
        let chunk_coords = unravel(slot as u64, &self.chunk_counts);

        let shard_coords: Vec<u64> = chunk_coords
            .iter()
            .zip(&self.shard_sizes)
            .map(|(&c, &s)| c / s)
            .collect();
        let file = ravel(&shard_coords, &self.shard_grid()) as usize;

        let mut within = Vec::with_capacity(chunk_coords.len() + 1);
        within.push(layer % self.append_shard);
        within.extend(
            chunk_coords
                .iter()
                .zip(&self.shard_sizes)
                .map(|(&c, &s)| c % s),
        );
        let mut extents = Vec::with_capacity(within.len());
        extents.push(self.append_shard);
        extents.extend_from_slice(&self.shard_sizes);

        ShardLocation {
            segment: layer / self.layers_per_segment(),
            file,
            chunk_in_shard: ravel(&within, &extents) as usize,
        }
    }
}

/// Trailing index of an indexed shard: `(offset, nbytes)` per chunk, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIndex {
    entries: Vec<(u64, u64)>,
}

impl ShardIndex {
    pub fn new(chunks_per_shard: usize) -> Self {
        Self {
            entries: vec![(MISSING_CHUNK, MISSING_CHUNK); chunks_per_shard],
        }
    }

    pub fn set(&mut self, chunk_in_shard: usize, offset: u64, nbytes: u64) {
        self.entries[chunk_in_shard] = (offset, nbytes);
    }

    pub fn get(&self, chunk_in_shard: usize) -> Option<(u64, u64)> {
        self.entries
            .get(chunk_in_shard)
            .copied()
            .filter(|&(offset, _)| offset != MISSING_CHUNK)
    }

    pub fn encoded_size(&self) -> usize {
        self.entries.len() * 2 * size_of::<u64>()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        for (offset, nbytes) in &self.entries {
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&nbytes.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() % 16 != 0 {
            return Err(crate::Error::general(format!(
                "shard index length {} is not a multiple of 16",
                bytes.len()
            )));
        }
        let entries = bytes
            .chunks_exact(16)
            .map(|e| {
                let offset = u64::from_le_bytes(e[..8].try_into().expect("8 bytes"));
                let nbytes = u64::from_le_bytes(e[8..].try_into().expect("8 bytes"));
                (offset, nbytes)
            })
            .collect();
        Ok(Self { entries })
    }
}
