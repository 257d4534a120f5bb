//! Run-local spool of the sealed stream
//!
//! The pipeline writes the stream once; every backend then reads it back
//! through its own [`Chunker`] at its own chunk size.

use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use strongbox_core::{Error, Result};
use strongbox_storage::ChunkStream;

use crate::chunker::Chunker;

/// Writer that hashes and counts everything passing through it
pub struct ChecksumWriter<W: Write> {
    writer: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Hex digest of the bytes written so far
    pub fn checksum(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// A finished spool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolFile {
    pub path: PathBuf,
    pub bytes: u64,
    /// sha256 of the whole stream, lowercase hex
    pub checksum: String,
}

impl SpoolFile {
    /// Independent chunk stream over the spool
    pub fn chunks(&self, chunk_size: u64) -> Result<ChunkStream> {
        chunk_stream(&self.path, chunk_size)
    }
}

pub struct SpoolWriter {
    path: PathBuf,
    inner: ChecksumWriter<BufWriter<File>>,
}

impl SpoolWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: ChecksumWriter::new(BufWriter::new(file)),
        })
    }

    /// Flush and sync the spool to disk
    pub fn finish(mut self) -> Result<SpoolFile> {
        self.inner.flush()?;
        let checksum = self.inner.checksum();
        let bytes = self.inner.bytes_written();
        let file = self
            .inner
            .into_inner()
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(SpoolFile {
            path: self.path,
            bytes,
            checksum,
        })
    }
}

impl Write for SpoolWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read a file as a stream of chunks; file reads run on the blocking pool
pub fn chunk_stream(path: &Path, chunk_size: u64) -> Result<ChunkStream> {
    let file = File::open(path)?;
    let chunker = Chunker::new(BufReader::new(file), chunk_size)?;

    let stream = futures::stream::unfold(Some(chunker), |state| async move {
        let mut chunker = state?;
        let joined = tokio::task::spawn_blocking(move || {
            let next = chunker.next();
            (next, chunker)
        })
        .await;
        match joined {
            Ok((Some(Ok(chunk)), chunker)) => Some((Ok(chunk), Some(chunker))),
            Ok((Some(Err(e)), _)) => Some((Err(e), None)),
            Ok((None, _)) => None,
            Err(e) => Some((Err(Error::pipeline(format!("chunk reader failed: {}", e))), None)),
        }
    });
    Ok(stream.boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn test_checksum_matches_direct_digest() {
        let mut writer = ChecksumWriter::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        assert_eq!(writer.bytes_written(), 11);
        assert_eq!(
            writer.checksum(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_each_reader_gets_its_own_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpoolWriter::create(&dir.path().join("stream")).unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        writer.write_all(&data).unwrap();
        let spool = writer.finish().unwrap();
        assert_eq!(spool.bytes, 1000);

        let small: Vec<_> = spool.chunks(100).unwrap().try_collect().await.unwrap();
        let large: Vec<_> = spool.chunks(300).unwrap().try_collect().await.unwrap();
        assert_eq!(small.len(), 11);
        assert_eq!(large.len(), 4);

        let joined: Vec<u8> = large.into_iter().flat_map(|c| c.payload).collect();
        assert_eq!(joined, data);
    }
}
