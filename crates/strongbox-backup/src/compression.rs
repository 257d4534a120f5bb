//! Streaming gzip stage

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub use strongbox_core::types::DEFAULT_COMPRESSION_LEVEL;

/// Wrap `out` with a gzip encoder at `level` (clamped to 1-9).
///
/// Call `finish()` on the encoder to write the gzip trailer.
pub fn compressor<W: Write>(out: W, level: u32) -> GzEncoder<W> {
    GzEncoder::new(out, Compression::new(level.clamp(1, 9)))
}

/// Inverse of [`compressor`]
pub fn decompressor<R: Read>(input: R) -> GzDecoder<R> {
    GzDecoder::new(input)
}
