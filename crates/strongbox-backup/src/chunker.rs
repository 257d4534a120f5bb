//! Fixed-size chunking of the sealed stream

use std::io::{ErrorKind, Read};

use strongbox_core::types::Chunk;
use strongbox_core::{Error, Result};

/// Lazily splits a reader into sequential chunks.
///
/// A chunk shorter than `chunk_size` is final. A stream whose length is an
/// exact multiple of the chunk size (including an empty stream) ends with an
/// empty final chunk.
pub struct Chunker<R: Read> {
    reader: R,
    chunk_size: usize,
    next_sequence: u64,
    done: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R, chunk_size: u64) -> Result<Self> {
        let chunk_size = usize::try_from(chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| Error::pipeline(format!("invalid chunk size {}", chunk_size)))?;
        Ok(Self {
            reader,
            chunk_size,
            next_sequence: 0,
            done: false,
        })
    }

    /// Read until the buffer is full or the stream ends
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut payload = vec![0u8; self.chunk_size];
        let filled = match self.fill(&mut payload) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };
        payload.truncate(filled);

        let is_final = filled < self.chunk_size;
        self.done = is_final;
        let chunk = Chunk {
            sequence_number: self.next_sequence,
            payload,
            is_final,
        };
        self.next_sequence += 1;
        Some(Ok(chunk))
    }
}
