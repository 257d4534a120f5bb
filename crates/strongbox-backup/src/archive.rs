//! Archive container
//!
//! A single ordered stream of entries, written into any [`Write`] so it can
//! feed the compression stage directly.
//!
//! Layout (little-endian):
//!
//! ```text
//! "SBOXARC1"                                   stream preamble
//! header(32) | path | body                     per entry
//! header(kind = END)                           trailer
//!
//! header: "SBXE" kind:u8 flags:u8 reserved:u16 mode:u32 mtime:i64 size:u64 path_len:u32
//! ```
//!
//! Bodies of known size (`SIZED` flag) are `size` raw bytes. Command output is
//! written as `u32 len | bytes` frames ending with a zero-length frame. The
//! trailer makes truncation detectable.

use std::io::{self, ErrorKind, Read, Write};
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

use strongbox_core::{AbortSignal, Error, Result};

use crate::entry::{ArchiveEntry, ByteSource, EntryKind};

pub const ARCHIVE_MAGIC: &[u8; 8] = b"SBOXARC1";
const ENTRY_MAGIC: &[u8; 4] = b"SBXE";
const HEADER_LEN: usize = 32;
const KIND_END: u8 = 0xFF;
const FLAG_SIZED: u8 = 0b0000_0001;
const MAX_PATH_LEN: u32 = 64 * 1024;

/// Largest frame written for command output
pub const FRAME_SIZE: usize = 64 * 1024;

/// Entry metadata as stored in the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    pub path: String,
    pub mode: u32,
    pub mtime: i64,
    /// `None` for framed bodies
    pub size: Option<u64>,
}

/// An entry that was left out of the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: String,
    pub reason: String,
}

/// What a finished archive contains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub entries: u64,
    /// Body bytes, excluding headers and framing
    pub bytes: u64,
    pub skipped: Vec<SkippedEntry>,
}

fn encode_header(out: &mut impl Write, kind: u8, header: Option<&EntryHeader>) -> io::Result<()> {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(ENTRY_MAGIC);
    buf[4] = kind;
    if let Some(h) = header {
        let path_len = u32::try_from(h.path.len())
            .ok()
            .filter(|len| *len <= MAX_PATH_LEN)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "entry path too long"))?;
        buf[5] = if h.size.is_some() { FLAG_SIZED } else { 0 };
        buf[8..12].copy_from_slice(&h.mode.to_le_bytes());
        buf[12..20].copy_from_slice(&h.mtime.to_le_bytes());
        buf[20..28].copy_from_slice(&h.size.unwrap_or(0).to_le_bytes());
        buf[28..32].copy_from_slice(&path_len.to_le_bytes());
        out.write_all(&buf)?;
        out.write_all(h.path.as_bytes())
    } else {
        out.write_all(&buf)
    }
}

/// Writes entries into the container format
pub struct ArchiveBuilder<W: Write> {
    out: W,
    abort: Option<AbortSignal>,
    summary: BuildSummary,
}

impl<W: Write> ArchiveBuilder<W> {
    /// Start an archive; the preamble is written immediately
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(ARCHIVE_MAGIC)?;
        Ok(Self {
            out,
            abort: None,
            summary: BuildSummary::default(),
        })
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }

    fn check_abort(&self) -> Result<()> {
        match &self.abort {
            Some(abort) => abort.check(),
            None => Ok(()),
        }
    }

    fn skip(&mut self, entry: &ArchiveEntry, reason: String) -> Result<()> {
        if entry.mandatory {
            return Err(Error::mandatory_source_missing(&entry.logical_path));
        }
        warn!("Skipping {}: {}", entry.logical_path, reason);
        self.summary.skipped.push(SkippedEntry {
            path: entry.logical_path.clone(),
            reason,
        });
        Ok(())
    }

    fn write_header(&mut self, entry: &ArchiveEntry, size: Option<u64>) -> Result<()> {
        let header = EntryHeader {
            kind: entry.kind,
            path: entry.logical_path.clone(),
            mode: entry.mode,
            mtime: entry.mtime,
            size,
        };
        encode_header(&mut self.out, entry.kind.code(), Some(&header))?;
        Ok(())
    }

    /// Append one entry, reading its bytes now
    pub fn append(&mut self, entry: ArchiveEntry) -> Result<()> {
        self.check_abort()?;
        debug!("Archiving {} ({})", entry.logical_path, entry.kind);

        match &entry.source {
            ByteSource::File(path) => {
                let file = match std::fs::File::open(path) {
                    Ok(file) => file,
                    Err(e) => return self.skip(&entry, format!("{}: {}", path.display(), e)),
                };
                // Size is fixed at open; later growth is not archived.
                let size = file.metadata()?.len();
                self.write_header(&entry, Some(size))?;
                let copied = self.copy_sized(file, size)?;
                if copied != size {
                    return Err(Error::pipeline(format!(
                        "{} shrank while being archived ({} of {} bytes)",
                        path.display(),
                        copied,
                        size
                    )));
                }
                self.summary.bytes += size;
            }
            ByteSource::Bytes(data) => {
                let size = data.len() as u64;
                self.write_header(&entry, Some(size))?;
                self.out.write_all(data)?;
                self.summary.bytes += size;
            }
            ByteSource::Empty => {
                self.write_header(&entry, Some(0))?;
            }
            ByteSource::Command { program, args, cwd } => {
                let mut command = Command::new(program);
                command
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                if let Some(cwd) = cwd {
                    command.current_dir(cwd);
                }
                let child = match command.spawn() {
                    Ok(child) => child,
                    Err(e) => return self.skip(&entry, format!("cannot run {}: {}", program, e)),
                };
                self.write_header(&entry, None)?;
                self.capture(&entry, program, child)?;
            }
        }

        self.summary.entries += 1;
        Ok(())
    }

    /// Copy exactly `size` bytes, checking the abort signal between blocks
    fn copy_sized(&mut self, file: std::fs::File, size: u64) -> Result<u64> {
        let mut reader = file.take(size);
        let mut buf = vec![0u8; FRAME_SIZE];
        let mut copied = 0u64;
        loop {
            self.check_abort()?;
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.out.write_all(&buf[..n])?;
            copied += n as u64;
        }
        Ok(copied)
    }

    /// Frame a child's stdout into the archive
    fn capture(&mut self, entry: &ArchiveEntry, program: &str, mut child: Child) -> Result<()> {
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::pipeline(format!("no stdout for {}", program)))?;

        if let Err(e) = self.frame_output(&mut stdout) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        let status = child.wait()?;
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if !status.success() {
            let message = format!("{} exited with {}: {}", program, status, stderr.trim());
            if entry.mandatory {
                return Err(Error::pipeline(message));
            }
            warn!("Captured partial output of {}: {}", entry.logical_path, message);
        }
        Ok(())
    }

    fn frame_output(&mut self, stdout: &mut impl Read) -> Result<()> {
        let mut buf = vec![0u8; FRAME_SIZE];
        loop {
            self.check_abort()?;
            let n = match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.out.write_all(&(n as u32).to_le_bytes())?;
            self.out.write_all(&buf[..n])?;
            self.summary.bytes += n as u64;
        }
        self.out.write_all(&0u32.to_le_bytes())?;
        Ok(())
    }

    /// Write the trailer and hand back the writer
    pub fn finish(mut self) -> Result<(W, BuildSummary)> {
        encode_header(&mut self.out, KIND_END, None)?;
        self.out.flush()?;
        Ok((self.out, self.summary))
    }
}

enum PendingBody {
    Sized(u64),
    Framed,
}

/// Reads entries back out of the container format
pub struct ArchiveReader<R: Read> {
    inner: R,
    pending: Option<PendingBody>,
    finished: bool,
}

fn truncated(e: io::Error) -> Error {
    if e.kind() == ErrorKind::UnexpectedEof {
        Error::corrupt("archive is truncated")
    } else {
        Error::Io(e)
    }
}

impl<R: Read> ArchiveReader<R> {
    /// Open a stream, checking the preamble
    pub fn new(mut inner: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        inner.read_exact(&mut magic).map_err(truncated)?;
        if &magic != ARCHIVE_MAGIC {
            return Err(Error::corrupt("not a strongbox archive"));
        }
        Ok(Self {
            inner,
            pending: None,
            finished: false,
        })
    }

    /// Next entry header; the previous entry's unread body is skipped.
    /// Returns `None` at the trailer.
    pub fn next_header(&mut self) -> Result<Option<EntryHeader>> {
        if self.finished {
            return Ok(None);
        }
        if self.pending.is_some() {
            self.copy_body(&mut io::sink())?;
        }

        let mut buf = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut buf).map_err(truncated)?;
        if &buf[0..4] != ENTRY_MAGIC {
            return Err(Error::corrupt("bad entry header magic"));
        }
        if buf[4] == KIND_END {
            self.finished = true;
            return Ok(None);
        }

        let kind = EntryKind::from_code(buf[4])
            .ok_or_else(|| Error::corrupt(format!("unknown entry kind {:#x}", buf[4])))?;
        let sized = buf[5] & FLAG_SIZED != 0;
        let le_u32 = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[r]);
            u32::from_le_bytes(b)
        };
        let le_u64 = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[r]);
            u64::from_le_bytes(b)
        };
        let mode = le_u32(8..12);
        let mtime = le_u64(12..20) as i64;
        let size = le_u64(20..28);
        let path_len = le_u32(28..32);
        if path_len > MAX_PATH_LEN {
            return Err(Error::corrupt(format!("entry path length {}", path_len)));
        }

        let mut path = vec![0u8; path_len as usize];
        self.inner.read_exact(&mut path).map_err(truncated)?;
        let path = String::from_utf8(path)
            .map_err(|_| Error::corrupt("entry path is not valid UTF-8"))?;

        self.pending = Some(if sized {
            PendingBody::Sized(size)
        } else {
            PendingBody::Framed
        });

        Ok(Some(EntryHeader {
            kind,
            path,
            mode,
            mtime,
            size: sized.then_some(size),
        }))
    }

    /// Copy the current entry's body into `out`
    pub fn copy_body(&mut self, out: &mut impl Write) -> Result<u64> {
        match self.pending.take() {
            None => Ok(0),
            Some(PendingBody::Sized(size)) => self.copy_exact(size, out),
            Some(PendingBody::Framed) => {
                let mut total = 0;
                loop {
                    let mut len = [0u8; 4];
                    self.inner.read_exact(&mut len).map_err(truncated)?;
                    let len = u32::from_le_bytes(len) as u64;
                    if len == 0 {
                        break;
                    }
                    total += self.copy_exact(len, out)?;
                }
                Ok(total)
            }
        }
    }

    /// The current entry's body in memory
    pub fn read_body(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        self.copy_body(&mut body)?;
        Ok(body)
    }

    fn copy_exact(&mut self, len: u64, out: &mut impl Write) -> Result<u64> {
        let copied = io::copy(&mut (&mut self.inner).take(len), out)?;
        if copied != len {
            return Err(Error::corrupt("archive is truncated"));
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn build(entries: Vec<ArchiveEntry>) -> (Vec<u8>, BuildSummary) {
        let mut builder = ArchiveBuilder::new(Vec::new()).unwrap();
        for entry in entries {
            builder.append(entry).unwrap();
        }
        builder.finish().unwrap()
    }

    fn read_all(data: &[u8]) -> Vec<(EntryHeader, Vec<u8>)> {
        let mut reader = ArchiveReader::new(data).unwrap();
        let mut out = Vec::new();
        while let Some(header) = reader.next_header().unwrap() {
            let body = reader.read_body().unwrap();
            out.push((header, body));
        }
        out
    }

    #[test]
    fn test_round_trip_preserves_order_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"alpha").unwrap();
        let metadata = std::fs::metadata(&path).unwrap();

        let (data, summary) = build(vec![
            ArchiveEntry::directory("docs", &std::fs::metadata(dir.path()).unwrap()),
            ArchiveEntry::file("docs/a.txt", &path, &metadata, false),
            ArchiveEntry::bytes("docs/empty", Vec::new()),
            ArchiveEntry::bytes("docs/b.bin", vec![7u8; 3000]),
        ]);
        assert_eq!(summary.entries, 4);
        assert_eq!(summary.bytes, 5 + 3000);

        let entries = read_all(&data);
        let paths: Vec<_> = entries.iter().map(|(h, _)| h.path.as_str()).collect();
        assert_eq!(paths, ["docs", "docs/a.txt", "docs/empty", "docs/b.bin"]);
        assert_eq!(entries[0].0.kind, EntryKind::Directory);
        assert_eq!(entries[1].0.size, Some(5));
        assert_eq!(entries[1].0.mtime, ArchiveEntry::file("x", &path, &metadata, false).mtime);
        assert_eq!(entries[1].1, b"alpha");
        assert!(entries[2].1.is_empty());
        assert_eq!(entries[3].1, vec![7u8; 3000]);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_output_is_framed() {
        let (data, summary) = build(vec![ArchiveEntry::command(
            "listing.txt",
            "sh",
            vec!["-c".into(), "printf 'one\\ntwo\\n'".into()],
            None,
            true,
        )]);
        assert_eq!(summary.entries, 1);

        let entries = read_all(&data);
        assert_eq!(entries[0].0.kind, EntryKind::CommandOutput);
        assert_eq!(entries[0].0.size, None);
        assert_eq!(entries[0].1, b"one\ntwo\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_mandatory_command_is_an_error() {
        let mut builder = ArchiveBuilder::new(Vec::new()).unwrap();
        let entry = ArchiveEntry::command("x", "sh", vec!["-c".into(), "exit 4".into()], None, true);
        let err = builder.append(entry).unwrap_err();
        assert!(matches!(err, Error::Pipeline { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_optional_command_keeps_output() {
        let (data, _) = build(vec![ArchiveEntry::command(
            "partial.txt",
            "sh",
            vec!["-c".into(), "echo some; exit 1".into()],
            None,
            false,
        )]);
        assert_eq!(read_all(&data)[0].1, b"some\n");
    }

    #[test]
    fn test_missing_optional_file_is_skipped() {
        let missing = ArchiveEntry {
            logical_path: "gone.txt".into(),
            kind: EntryKind::File,
            size_hint: Some(1),
            mode: 0o644,
            mtime: 0,
            mandatory: false,
            source: ByteSource::File(PathBuf::from("/nonexistent/strongbox/gone.txt")),
        };
        let (data, summary) = build(vec![missing, ArchiveEntry::bytes("kept", b"k".to_vec())]);
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].path, "gone.txt");
        assert_eq!(read_all(&data).len(), 1);
    }

    #[test]
    fn test_missing_mandatory_file_fails() {
        let mut builder = ArchiveBuilder::new(Vec::new()).unwrap();
        let entry = ArchiveEntry {
            logical_path: "vault.kdbx".into(),
            kind: EntryKind::File,
            size_hint: None,
            mode: 0o600,
            mtime: 0,
            mandatory: true,
            source: ByteSource::File(PathBuf::from("/nonexistent/vault.kdbx")),
        };
        let err = builder.append(entry).unwrap_err();
        assert!(matches!(err, Error::MandatorySourceMissing { .. }));
    }

    #[test]
    fn test_abort_stops_append() {
        let abort = AbortSignal::new();
        let mut builder = ArchiveBuilder::new(Vec::new()).unwrap().with_abort(abort.clone());
        abort.abort();
        let err = builder.append(ArchiveEntry::bytes("x", vec![1])).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_truncation_is_detected() {
        let (data, _) = build(vec![ArchiveEntry::bytes("a", vec![1u8; 100])]);

        // Without the trailer
        let cut = &data[..data.len() - HEADER_LEN];
        let mut reader = ArchiveReader::new(cut).unwrap();
        assert!(reader.next_header().unwrap().is_some());
        assert!(matches!(reader.next_header(), Err(Error::Corrupt { .. })));

        // Inside a body
        let cut = &data[..ARCHIVE_MAGIC.len() + HEADER_LEN + 1 + 10];
        let mut reader = ArchiveReader::new(cut).unwrap();
        reader.next_header().unwrap();
        assert!(matches!(reader.read_body(), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_unread_bodies_are_skipped() {
        let (data, _) = build(vec![
            ArchiveEntry::bytes("first", vec![1u8; 10]),
            ArchiveEntry::bytes("second", vec![2u8; 4]),
        ]);
        let mut reader = ArchiveReader::new(&data[..]).unwrap();
        reader.next_header().unwrap();
        let second = reader.next_header().unwrap().unwrap();
        assert_eq!(second.path, "second");
        assert_eq!(reader.read_body().unwrap(), vec![2u8; 4]);
        assert!(reader.next_header().unwrap().is_none());
    }

    #[test]
    fn test_rejects_foreign_stream() {
        assert!(matches!(
            ArchiveReader::new(&b"PK\x03\x04not-ours"[..]),
            Err(Error::Corrupt { .. })
        ));
    }
}
