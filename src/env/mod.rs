//! Environment abstraction.
//!
//! All file I/O and clock reads flow through [`Env`] so tests and benchmarks
//! can inject in-memory or rate-limited files. The handle is passed in via
//! `DirOptions`; there is no global default instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Append-only output file.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// Forward-only input file.
pub trait SequentialFile: Send {
    /// Read up to `buf.len()` bytes; returns 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// Positioned input file; shared by concurrent readers.
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `len` bytes at `offset`; short reads happen at EOF.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

pub trait Env: Send + Sync {
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;
    fn new_random_access_file(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>>;
    fn get_file_size(&self, path: &Path) -> Result<u64>;
    fn create_dir(&self, path: &Path) -> Result<()>;
    fn now_micros(&self) -> u64;
}

pub fn now_wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Read a sequential file to the end.
pub fn read_file_to_vec(file: &mut dyn SequentialFile) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 64 << 10];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

/// `Env` backed by the local filesystem.
#[derive(Debug, Default)]
pub struct PosixEnv;

impl PosixEnv {
    pub fn new() -> Self {
        Self
    }
}

struct PosixWritableFile {
    file: std::io::BufWriter<std::fs::File>,
}

impl WritableFile for PosixWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        use std::io::Write;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        use std::io::Write;
        self.file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        use std::io::Write;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}

struct PosixSequentialFile {
    file: std::fs::File,
}

impl SequentialFile for PosixSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        Ok(self.file.read(buf)?)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        use std::io::Seek;
        self.file.seek(std::io::SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

struct PosixRandomAccessFile {
    #[cfg(unix)]
    file: std::fs::File,
    #[cfg(not(unix))]
    file: Mutex<std::fs::File>,
}

impl RandomAccessFile for PosixRandomAccessFile {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        let mut buf = vec![0u8; len];
        let mut read = 0;
        while read < len {
            let n = self.file.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl Env for PosixEnv {
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        Ok(Box::new(PosixWritableFile {
            file: std::io::BufWriter::new(file),
        }))
    }

    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let file = std::fs::File::open(path).map_err(map_open_err)?;
        Ok(Box::new(PosixSequentialFile { file }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>> {
        let file = std::fs::File::open(path).map_err(map_open_err)?;
        #[cfg(not(unix))]
        let file = Mutex::new(file);
        Ok(Arc::new(PosixRandomAccessFile { file }))
    }

    fn get_file_size(&self, path: &Path) -> Result<u64> {
        let meta = std::fs::metadata(path).map_err(map_open_err)?;
        Ok(meta.len())
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn now_micros(&self) -> u64 {
        now_wall_micros()
    }
}

fn map_open_err(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound
    } else {
        Error::from(err)
    }
}

// ---------------------------------------------------------------------------
// In-memory filesystem
// ---------------------------------------------------------------------------

/// `Env` keeping every file in memory. Used by tests and the filter bench.
#[derive(Default)]
pub struct MemEnv {
    files: Mutex<HashMap<PathBuf, Arc<RwLock<Vec<u8>>>>>,
}

impl MemEnv {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, path: &Path) -> Option<Arc<RwLock<Vec<u8>>>> {
        self.files.lock().get(path).cloned()
    }
}

struct MemWritableFile {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl WritableFile for MemWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.buf.write().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemSequentialFile {
    buf: Arc<RwLock<Vec<u8>>>,
    offset: usize,
}

impl SequentialFile for MemSequentialFile {
    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        let buf = self.buf.read();
        let remaining = buf.len().saturating_sub(self.offset);
        let n = remaining.min(out.len());
        out[..n].copy_from_slice(&buf[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        let len = self.buf.read().len();
        self.offset = (self.offset + n as usize).min(len);
        Ok(())
    }
}

struct MemRandomAccessFile {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl RandomAccessFile for MemRandomAccessFile {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let buf = self.buf.read();
        let start = (offset as usize).min(buf.len());
        let end = (start + len).min(buf.len());
        Ok(buf[start..end].to_vec())
    }
}

impl Env for MemEnv {
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let buf = Arc::new(RwLock::new(Vec::new()));
        self.files.lock().insert(path.to_path_buf(), buf.clone());
        Ok(Box::new(MemWritableFile { buf }))
    }

    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let buf = self.find(path).ok_or(Error::NotFound)?;
        Ok(Box::new(MemSequentialFile { buf, offset: 0 }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>> {
        let buf = self.find(path).ok_or(Error::NotFound)?;
        Ok(Arc::new(MemRandomAccessFile { buf }))
    }

    fn get_file_size(&self, path: &Path) -> Result<u64> {
        let buf = self.find(path).ok_or(Error::NotFound)?;
        let len = buf.read().len();
        Ok(len as u64)
    }

    fn create_dir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn now_micros(&self) -> u64 {
        now_wall_micros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_env_roundtrip() {
        let env = MemEnv::new();
        let path = Path::new("/mem/test.dat");
        {
            let mut file = env.new_writable_file(path).unwrap();
            file.append(b"hello ").unwrap();
            file.append(b"world").unwrap();
            file.sync().unwrap();
        }
        assert_eq!(env.get_file_size(path).unwrap(), 11);

        let ra = env.new_random_access_file(path).unwrap();
        assert_eq!(ra.read_at(6, 5).unwrap(), b"world");
        assert_eq!(ra.read_at(6, 100).unwrap(), b"world");
        assert_eq!(ra.read_at(100, 5).unwrap(), b"");

        let mut seq = env.new_sequential_file(path).unwrap();
        let data = read_file_to_vec(seq.as_mut()).unwrap();
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn missing_file_is_not_found() {
        let env = MemEnv::new();
        let err = env
            .new_sequential_file(Path::new("/nope"))
            .err()
            .expect("missing file");
        assert!(err.is_not_found());
    }
}
