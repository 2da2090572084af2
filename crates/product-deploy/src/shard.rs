//! Splitting of the weight buffer into fixed-size shard files.

use std::fs;
use std::path::Path;

use product_core::{Error, Result};

/// `group1-shard<i>of<n>.bin`, 1-based.
pub fn shard_file_name(index: usize, total: usize) -> String {
    format!("group1-shard{index}of{total}.bin")
}

/// Writes `bytes` as consecutive shards of at most `shard_size` bytes and
/// returns the file names in order. An empty buffer writes no shards.
pub fn write_shards(bytes: &[u8], shard_size: usize, dir: &Path) -> Result<Vec<String>> {
    if shard_size == 0 {
        return Err(Error::InvalidArgument("shard size must be positive".to_string()));
    }
    fs::create_dir_all(dir)?;

    let total = bytes.len().div_ceil(shard_size);
    let mut names = Vec::with_capacity(total);
    for (i, chunk) in bytes.chunks(shard_size).enumerate() {
        let name = shard_file_name(i + 1, total);
        fs::write(dir.join(&name), chunk)?;
        names.push(name);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shard_sizes_and_names() {
        let dir = TempDir::new().unwrap();
        let bytes: Vec<u8> = (0..10).collect();
        let names = write_shards(&bytes, 4, dir.path()).unwrap();
        assert_eq!(
            names,
            vec!["group1-shard1of3.bin", "group1-shard2of3.bin", "group1-shard3of3.bin"]
        );
        assert_eq!(fs::read(dir.path().join(&names[0])).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(fs::read(dir.path().join(&names[2])).unwrap(), vec![8, 9]);

        let joined: Vec<u8> = names
            .iter()
            .flat_map(|n| fs::read(dir.path().join(n)).unwrap())
            .collect();
        assert_eq!(joined, bytes);
    }

    #[test]
    fn test_exact_multiple_and_empty() {
        let dir = TempDir::new().unwrap();
        assert_eq!(write_shards(&[1; 8], 4, dir.path()).unwrap().len(), 2);
        assert!(write_shards(&[], 4, dir.path()).unwrap().is_empty());
        assert!(write_shards(&[1], 0, dir.path()).is_err());
    }
}
