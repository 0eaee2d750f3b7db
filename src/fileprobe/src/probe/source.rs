use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("range 0x{start:08x}..0x{end:08x} is outside the input (length 0x{len:08x})")]
    OutOfRange { start: u64, end: u64, len: u64 },
    #[error("i/o error reading input: {0}")]
    Io(#[from] std::io::Error),
}

/// A seekable view over an input of known length.
///
/// Slices are owned snapshots: the underlying bytes must not change for the
/// lifetime of a parse. Analyzers do all their numeric decoding through a
/// [`Reader`](super::Reader) laid over a slice.
pub trait ByteSource: Sync {
    fn len(&self) -> u64;

    /// Returns the bytes in `start..end` or [`SourceError::OutOfRange`] when
    /// `end > len` or `start > end`.
    fn slice(&self, start: u64, end: u64) -> Result<Vec<u8>, SourceError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> MemorySource {
        MemorySource { data }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn slice(&self, start: u64, end: u64) -> Result<Vec<u8>, SourceError> {
        if start > end || end > self.data.len() as u64 {
            return Err(SourceError::OutOfRange { start, end, len: self.len() });
        }
        Ok(self.data[start as usize..end as usize].to_vec())
    }
}

/// File-backed source. The handle is behind a mutex so independent parses on
/// worker threads can share one open file.
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileSource, SourceError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(FileSource { file: Mutex::new(file), len })
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn slice(&self, start: u64, end: u64) -> Result<Vec<u8>, SourceError> {
        if start > end || end > self.len {
            return Err(SourceError::OutOfRange { start, end, len: self.len });
        }
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.seek(SeekFrom::Start(start))?;
        let mut data = vec![0u8; (end - start) as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_slice_bounds() {
        let source = MemorySource::new(vec![1, 2, 3, 4]);
        assert_eq!(source.len(), 4);
        assert_eq!(source.slice(1, 3).unwrap(), vec![2, 3]);
        assert!(source.slice(2, 5).is_err());
        assert!(source.slice(3, 2).is_err());
    }
}
