//! Incremental reader for one append-only transcript.
//!
//! The tailer remembers how many bytes it has consumed and any unterminated
//! trailing bytes from the last read. Each call reads only what was appended
//! since, so notification and poll triggers can both call it freely.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl FileTailer {
    /// Start tailing at an explicit byte offset.
    pub fn new(path: PathBuf, offset: u64) -> Self {
        Self {
            path,
            offset,
            partial: Vec::new(),
        }
    }

    /// Start tailing at the current end of file (no backlog replay).
    ///
    /// A file that cannot be stat'ed starts at offset zero.
    pub fn at_end(path: PathBuf) -> Self {
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self::new(path, offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes of an unterminated trailing line held from the previous read
    pub fn partial_line(&self) -> &[u8] {
        &self.partial
    }

    /// Read everything appended since the last call and return the complete,
    /// non-blank lines in file order.
    ///
    /// On error the offset and buffer are untouched, so the next call retries
    /// from the same point. A file that shrank is left alone.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let len = std::fs::metadata(&self.path)
            .map_err(|e| Error::io(&self.path, e))?
            .len();
        if len <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| Error::io(&self.path, e))?;

        let want = len - self.offset;
        let mut buf = Vec::with_capacity(usize::try_from(want).unwrap_or(0));
        file.take(want)
            .read_to_end(&mut buf)
            .map_err(|e| Error::io(&self.path, e))?;

        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);
        Ok(drain_lines(&mut self.partial))
    }
}

/// Split complete lines off the front of `buffer`, leaving any unterminated
/// tail in place. Blank lines are skipped and a trailing `\r` is dropped.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buffer.iter().rposition(|b| *b == b'\n') else {
        return Vec::new();
    };

    let rest = buffer.split_off(last_newline + 1);
    let complete = std::mem::replace(buffer, rest);

    complete
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}
