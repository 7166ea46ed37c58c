//! Compression capability consumed by the bulk-data path.

use std::fmt;

#[derive(Debug, Eq, PartialEq)]
pub enum CompressionError {
    /// The input could not be compressed.
    Compress,
    /// The input could not be decompressed or did not match the expected size.
    Decompress,
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompressionError::Compress => f.write_str("compression failed"),
            CompressionError::Decompress => f.write_str("decompression failed"),
        }
    }
}

/// LZ4-equivalent compressor capability.
pub trait Compressor: Send + Sync {
    /// Compresses the data with the given acceleration level (higher is
    /// faster and less dense).
    fn compress(&self, data: &[u8], acceleration: i32) -> Result<Vec<u8>, CompressionError>;

    /// Decompresses the data; `uncompressed_size` is used to size the output
    /// buffer and the result must match it exactly.
    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, CompressionError>;
}
