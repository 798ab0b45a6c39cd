//! Append-only log sinks and random-access log sources.
//!
//! A `LogSink` serialises appends behind its own lock so the foreground
//! writer and an in-flight flush can share it. Appends stage in memory and
//! reach the file once `min_buffer` bytes accumulate; `ltell` reports the
//! logical offset (staged bytes included), which is what block handles
//! reference. The data log can rotate at epoch boundaries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::env::{read_file_to_vec, Env, RandomAccessFile, WritableFile};
use crate::error::{Error, Result};

/// Cumulative write-side counters for one directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub data_bytes: u64,
    pub data_ops: u64,
    pub index_bytes: u64,
    pub index_ops: u64,
}

pub(crate) fn index_log_name(part: usize) -> String {
    format!("p{part:02}.idx")
}

pub(crate) fn data_log_name(part: usize, rotation_epoch: Option<u32>) -> String {
    match rotation_epoch {
        None => format!("p{part:02}.dat"),
        Some(epoch) => format!("p{part:02}-e{epoch}.dat"),
    }
}

struct SinkInner {
    file: Box<dyn WritableFile>,
    staged: Vec<u8>,
    offset: u64,
}

pub(crate) struct LogSink {
    env: Arc<dyn Env>,
    dir: PathBuf,
    part: usize,
    /// `Some(next_epoch)` when epoch rotation is on.
    rotation: Mutex<Option<u32>>,
    min_buffer: usize,
    inner: Mutex<SinkInner>,
    bytes: AtomicU64,
    ops: AtomicU64,
}

impl LogSink {
    pub fn open(
        env: Arc<dyn Env>,
        dir: &Path,
        part: usize,
        name: String,
        min_buffer: usize,
        max_buffer: usize,
        rotating: bool,
    ) -> Result<Arc<Self>> {
        let file = env.new_writable_file(&dir.join(&name))?;
        let mut staged = Vec::new();
        staged.reserve(max_buffer.max(min_buffer));
        Ok(Arc::new(Self {
            env,
            dir: dir.to_path_buf(),
            part,
            rotation: Mutex::new(if rotating { Some(1) } else { None }),
            min_buffer,
            inner: Mutex::new(SinkInner {
                file,
                staged,
                offset: 0,
            }),
            bytes: AtomicU64::new(0),
            ops: AtomicU64::new(0),
        }))
    }

    /// Append and return the logical offset the data begins at.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let at = inner.offset;
        inner.staged.extend_from_slice(data);
        inner.offset += data.len() as u64;
        if inner.staged.len() >= self.min_buffer {
            self.write_staged(&mut inner)?;
        }
        Ok(at)
    }

    /// Logical end offset: file bytes plus staged bytes.
    pub fn ltell(&self) -> u64 {
        self.inner.lock().offset
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_staged(&mut inner)?;
        inner.file.flush()
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.write_staged(&mut inner)?;
        inner.file.sync()
    }

    /// Start a fresh log file for the next epoch. No-op unless the sink was
    /// opened with rotation.
    pub fn rotate(&self) -> Result<()> {
        let mut rotation = self.rotation.lock();
        let Some(next_epoch) = *rotation else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        self.write_staged(&mut inner)?;
        inner.file.sync()?;
        let name = data_log_name(self.part, Some(next_epoch));
        inner.file = self.env.new_writable_file(&self.dir.join(name))?;
        inner.offset = 0;
        *rotation = Some(next_epoch + 1);
        Ok(())
    }

    pub fn io_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn io_ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    fn write_staged(&self, inner: &mut SinkInner) -> Result<()> {
        if inner.staged.is_empty() {
            return Ok(());
        }
        let n = inner.staged.len() as u64;
        let SinkInner { file, staged, .. } = inner;
        file.append(staged)?;
        staged.clear();
        self.bytes.fetch_add(n, Ordering::Relaxed);
        self.ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Random-access view over a finished log file.
pub(crate) struct LogSource {
    file: Arc<dyn RandomAccessFile>,
    size: u64,
    bytes: AtomicU64,
    ops: AtomicU64,
}

impl LogSource {
    pub fn open(env: &dyn Env, path: &Path) -> Result<Self> {
        let size = env.get_file_size(path)?;
        let file = env.new_random_access_file(path)?;
        Ok(Self {
            file,
            size,
            bytes: AtomicU64::new(0),
            ops: AtomicU64::new(0),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read exactly `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.size {
            return Err(Error::Corruption("handle past end of log"));
        }
        let data = self.file.read_at(offset, len)?;
        if data.len() != len {
            return Err(Error::Corruption("short log read"));
        }
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.ops.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    pub fn io_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn io_ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}

/// Slurp a whole log through the sequential-file interface.
pub(crate) fn load_log(env: &dyn Env, path: &Path) -> Result<Vec<u8>> {
    let mut file = env.new_sequential_file(path)?;
    read_file_to_vec(file.as_mut())
}
