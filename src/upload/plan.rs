use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::ShardRange;

/// Split `file_size` bytes into contiguous shards
///
/// Each shard is at least `min_stream_size` bytes, except when the whole file
/// is smaller than that, and at most `max_stream_size` bytes. The shard count
/// stays within `max_streams` unless the file needs more shards than that to
/// respect `max_stream_size`; see [`required_streams`]. An empty file still
/// yields one (empty) shard so the destination object gets created.
pub fn plan_shards(
    file_size: u64,
    max_streams: usize,
    min_stream_size: u64,
    max_stream_size: u64,
) -> Vec<ShardRange> {
    let max_streams = max_streams.max(1) as u64;
    let min_stream_size = min_stream_size.max(1);

    let wanted = (file_size / min_stream_size)
        .clamp(1, max_streams)
        .max(required_streams(file_size, max_stream_size));
    let shard_size = file_size.div_ceil(wanted);
    if shard_size == 0 {
        return vec![ShardRange {
            index: 0,
            offset: 0,
            length: 0,
        }];
    }

    // rounding up the shard size may leave fewer shards than requested
    let count = file_size.div_ceil(shard_size);
    (0..count)
        .map(|i| {
            let offset = i * shard_size;
            ShardRange {
                index: i as usize,
                offset,
                length: shard_size.min(file_size - offset),
            }
        })
        .collect()
}

/// Smallest number of shards that keeps each one within `max_stream_size`
pub fn required_streams(file_size: u64, max_stream_size: u64) -> u64 {
    file_size.div_ceil(max_stream_size.max(1)).max(1)
}

/// Name of the temporary object holding shard `index`
pub fn shard_object_name(destination: &str, tag: &str, index: usize) -> String {
    format!("{}.{}.upload_shard_{}", destination, tag, index)
}

/// Short random-looking tag that keeps concurrent uploads of the same
/// destination from sharing temporary object names
pub fn upload_tag(path: &Path, destination: &str, file_size: u64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = blake3::Hasher::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(destination.as_bytes());
    hasher.update(&file_size.to_le_bytes());
    hasher.update(&now.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    format!("{:.12}", hasher.finalize().to_hex())
}
