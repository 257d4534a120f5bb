//! Bounded in-memory byte pipe between pipeline threads
//!
//! The writer batches bytes into blocks and blocks once `capacity` blocks are
//! queued, so a slow consumer throttles its producer. Dropping the reader
//! makes writes fail with `BrokenPipe`; dropping the writer ends the stream.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};

/// Default block size handed between stages
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Create a connected writer/reader pair holding at most `capacity` blocks
pub fn bounded(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (
        PipeWriter {
            tx,
            buf: Vec::with_capacity(BLOCK_SIZE),
        },
        PipeReader {
            rx,
            block: Vec::new(),
            pos: 0,
        },
    )
}

pub struct PipeWriter {
    tx: SyncSender<Vec<u8>>,
    buf: Vec<u8>,
}

impl PipeWriter {
    fn send_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.buf, Vec::with_capacity(BLOCK_SIZE));
        self.tx
            .send(block)
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "pipe reader closed"))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = BLOCK_SIZE - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= BLOCK_SIZE {
            self.send_block()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_block()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let _ = self.send_block();
    }
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    block: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos == self.block.len() {
            match self.rx.recv() {
                Ok(block) => {
                    self.block = block;
                    self.pos = 0;
                }
                // Writer dropped: end of stream
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.block.len() - self.pos);
        out[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
