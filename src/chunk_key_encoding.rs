use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Draft Zarr v3 key encoding: `c` prefix on the first index, `/` between indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardKeyEncoding;

impl ShardKeyEncoding {
    pub fn encode(&self, grid_indices: &[u64]) -> String {
        let mut s = String::with_capacity(grid_indices.len() * 2 + 1);
        s.push('c');
        for (i, idx) in grid_indices.iter().enumerate() {
            if i > 0 {
                s.push('/');
            }
            write!(s, "{idx}").expect("writing to a String cannot fail");
        }
        s
    }

    /// Filesystem path of the shard at `grid_indices` below `data_root`.
    pub fn to_path(&self, data_root: &Path, grid_indices: &[u64]) -> PathBuf {
        data_root.join(self.encode(grid_indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_with_prefix() {
        assert_eq!(ShardKeyEncoding.encode(&[3, 0, 1, 2]), "c3/0/1/2");
        assert_eq!(ShardKeyEncoding.encode(&[0]), "c0");
    }

    #[test]
    fn joins_data_root() {
        let path = ShardKeyEncoding.to_path(Path::new("/data/root/0"), &[1, 2, 3]);
        assert_eq!(path, Path::new("/data/root/0/c1/2/3"));
    }
}
