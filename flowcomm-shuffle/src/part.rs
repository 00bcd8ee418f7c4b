//! On-disk part files.
//!
//! A part is an immutable file holding a sequence of length-prefixed
//! frames. Unkeyed parts store `[len:u32][value]` per record, keyed parts
//! store `[key_len:u32][key][value_len:u32][value]`. All integers are
//! little-endian.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, ShuffleError};

/// Metadata recorded for each flushed part.
#[derive(Debug, Clone)]
pub struct PartFile {
    pub path: PathBuf,
    /// Total serialized extent of the file in bytes.
    pub bytes: u64,
    pub records: u64,
}

pub(crate) fn part_path(dir: &Path, name: &str, index: usize) -> PathBuf {
    dir.join(format!("{name}.part-{index}"))
}

/// Streams frames into a new part file.
pub(crate) struct PartWriter {
    path: PathBuf,
    out: BufWriter<File>,
    bytes: u64,
    records: u64,
}

impl PartWriter {
    pub(crate) fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path).map_err(|e| ShuffleError::io(&path, e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            bytes: 0,
            records: 0,
        })
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| ShuffleError::CorruptPart {
            path: self.path.clone(),
            reason: format!("frame of {} bytes exceeds u32 length prefix", bytes.len()),
        })?;
        self.out
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.out.write_all(bytes))
            .map_err(|e| ShuffleError::io(&self.path, e))?;
        self.bytes += 4 + bytes.len() as u64;
        Ok(())
    }

    pub(crate) fn write_value(&mut self, value: &[u8]) -> Result<()> {
        self.write_frame(value)?;
        self.records += 1;
        Ok(())
    }

    pub(crate) fn write_keyed(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_frame(key)?;
        self.write_frame(value)?;
        self.records += 1;
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<PartFile> {
        self.out
            .flush()
            .map_err(|e| ShuffleError::io(&self.path, e))?;
        Ok(PartFile {
            path: self.path,
            bytes: self.bytes,
            records: self.records,
        })
    }
}

/// Reads a part file back in bounded windows.
pub(crate) struct PartReader {
    path: PathBuf,
    input: Option<BufReader<File>>,
    remaining: u64,
}

impl PartReader {
    /// The file is not opened until the first window is requested.
    pub(crate) fn new(part: &PartFile) -> Self {
        Self {
            path: part.path.clone(),
            input: None,
            remaining: part.records,
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    fn input(&mut self) -> Result<&mut BufReader<File>> {
        let input = match self.input.take() {
            Some(input) => input,
            None => {
                let file = File::open(&self.path).map_err(|e| ShuffleError::io(&self.path, e))?;
                BufReader::new(file)
            }
        };
        Ok(self.input.insert(input))
    }

    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let path = self.path.clone();
        let input = self.input()?;
        let mut len = [0u8; 4];
        input.read_exact(&mut len).map_err(|e| eof_as_corrupt(&path, e))?;
        let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
        input.read_exact(&mut buf).map_err(|e| eof_as_corrupt(&path, e))?;
        Ok(buf)
    }

    fn after_record(&mut self) {
        self.remaining -= 1;
        if self.remaining == 0 {
            self.input = None;
        }
    }

    /// Load up to `window` unkeyed records.
    pub(crate) fn read_values(&mut self, window: usize, into: &mut VecDeque<Vec<u8>>) -> Result<()> {
        let mut n = 0;
        while n < window && self.remaining > 0 {
            let value = self.read_frame()?;
            into.push_back(value);
            self.after_record();
            n += 1;
        }
        Ok(())
    }

    /// Load up to `window` keyed records as raw `(key, value)` frames.
    pub(crate) fn read_keyed(
        &mut self,
        window: usize,
        mut push: impl FnMut(Vec<u8>, Vec<u8>) -> Result<()>,
    ) -> Result<()> {
        let mut n = 0;
        while n < window && self.remaining > 0 {
            let key = self.read_frame()?;
            let value = self.read_frame()?;
            push(key, value)?;
            self.after_record();
            n += 1;
        }
        Ok(())
    }
}

fn eof_as_corrupt(path: &Path, e: std::io::Error) -> ShuffleError {
    if e.kind() == ErrorKind::UnexpectedEof {
        tracing::warn!(path = %path.display(), "part file ends inside a frame");
        ShuffleError::CorruptPart {
            path: path.to_path_buf(),
            reason: "truncated frame".into(),
        }
    } else {
        ShuffleError::io(path, e)
    }
}

/// Remove part files, ignoring ones that are already gone.
pub(crate) fn remove_parts(parts: &[PartFile]) -> Result<()> {
    for part in parts {
        match std::fs::remove_file(&part.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ShuffleError::io(&part.path, e)),
        }
    }
    Ok(())
}
