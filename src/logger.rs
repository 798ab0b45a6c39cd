//! Directory logger: one memtable partition's write path.
//!
//! Foreground `add` fills the active write buffer and the active filter.
//! When the buffer fills (or an epoch/finalize flush arrives) the pair is
//! swapped out as an immutable job and compacted in the background: sort,
//! feed the table logger, `end_table`, then optionally `make_epoch` /
//! `finish`. The compactor never shares mutable state with the foreground;
//! it owns the swapped-out pair and hands it back reset.
//!
//! Backpressure: with both buffers busy, `add` blocks on the partition's
//! condvar, or returns `TryAgain` in non-blocking mode.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::buffer::WriteBuffer;
use crate::error::{Error, Result};
use crate::events::{CompactionEvent, Event};
use crate::filter::FilterBuilder;
use crate::log::LogSink;
use crate::options::{DirMode, DirOptions};
use crate::table::{OutputStats, TableLogger};

/// Flush control, mirrored by `DirWriter`'s public calls.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlushOptions {
    /// Do not wait for the compaction to finish.
    pub no_wait: bool,
    /// Status check only; no flush is scheduled.
    pub dry_run: bool,
    /// Seal the current epoch after draining.
    pub epoch_flush: bool,
    /// Finalize the directory after draining.
    pub finalize: bool,
}

struct ImmJob {
    buf: WriteBuffer,
    filter: FilterBuilder,
    is_epoch_flush: bool,
    is_final: bool,
}

struct LoggerState {
    mem_buf: WriteBuffer,
    mem_filter: FilterBuilder,
    /// Swapped-out pair waiting for the compactor.
    imm: Option<ImmJob>,
    /// A swap happened and its compaction has not completed yet.
    imm_active: bool,
    /// Idle pair ready for the next swap; `None` while a compaction holds it.
    spare: Option<(WriteBuffer, FilterBuilder)>,
    has_bg_compaction: bool,
    num_flush_requested: u64,
    num_flush_completed: u64,
    status: Option<Error>,
}

pub(crate) struct DirLogger {
    shared: Arc<LoggerShared>,
}

pub(crate) struct LoggerShared {
    part: u32,
    mode: DirMode,
    skip_sort: bool,
    non_blocking: bool,
    /// Per-buffer byte budget; the buffer is "full" at this size.
    buf_threshold: usize,
    /// Entry estimate used to size buffers and filters.
    entries_per_buf: u32,
    pool: Option<Arc<rayon::ThreadPool>>,
    listener: Option<Arc<dyn crate::events::EventListener>>,
    env: Arc<dyn crate::env::Env>,
    data_sink: Arc<LogSink>,
    indx_sink: Arc<LogSink>,
    state: Mutex<LoggerState>,
    cv: Condvar,
    /// Touched only by the (single) in-flight compaction.
    tb: Mutex<TableLogger>,
}

impl DirLogger {
    pub fn new(
        options: &DirOptions,
        part: u32,
        data_sink: Arc<LogSink>,
        indx_sink: Arc<LogSink>,
    ) -> Self {
        // Budget half the per-partition share per buffer, and derive the
        // entry estimate from the benchmark-mode record shape.
        let per_part = options.total_memtable_budget >> options.lg_parts;
        let buf_threshold = (per_part / 2).max(1 << 10);
        let entry_footprint = options.key_size + options.value_size + 8;
        let entries_per_buf = (buf_threshold / entry_footprint).max(16) as u32;

        let mut mem_buf = WriteBuffer::new();
        mem_buf.reserve(entries_per_buf, buf_threshold);
        let mut mem_filter = FilterBuilder::from_options(options);
        mem_filter.reset(entries_per_buf);
        let mut spare_buf = WriteBuffer::new();
        spare_buf.reserve(entries_per_buf, buf_threshold);
        let mut spare_filter = FilterBuilder::from_options(options);
        spare_filter.reset(entries_per_buf);

        let tb = TableLogger::new(options, data_sink.clone(), indx_sink.clone());
        Self {
            shared: Arc::new(LoggerShared {
                part,
                mode: options.mode,
                skip_sort: options.skip_sort,
                non_blocking: options.non_blocking,
                buf_threshold,
                entries_per_buf,
                pool: options.compaction_pool.clone(),
                listener: options.listener.clone(),
                env: options.env.clone(),
                data_sink,
                indx_sink,
                state: Mutex::new(LoggerState {
                    mem_buf,
                    mem_filter,
                    imm: None,
                    imm_active: false,
                    spare: Some((spare_buf, spare_filter)),
                    has_bg_compaction: false,
                    num_flush_requested: 0,
                    num_flush_completed: 0,
                    status: None,
                }),
                cv: Condvar::new(),
                tb: Mutex::new(tb),
            }),
        }
    }

    /// Route one record into the active buffer, swapping and scheduling a
    /// compaction when it is full.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        loop {
            if state.status.is_some() {
                // A background failure is latched; the directory is dead.
                return Err(Error::Busy);
            }
            if state.mem_buf.current_buffer_size() < shared.buf_threshold {
                state.mem_buf.add(key, value);
                state.mem_filter.add_key(key);
                return Ok(());
            }
            if state.imm_active {
                if shared.non_blocking {
                    return Err(Error::TryAgain);
                }
                shared.cv.wait(&mut state);
                continue;
            }
            LoggerShared::swap_and_schedule(shared, &mut state, false, false);
        }
    }

    /// Force a compaction; see [`FlushOptions`].
    pub fn flush(&self, options: FlushOptions) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if options.dry_run {
            return match &state.status {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
        }
        while state.imm_active {
            if let Some(err) = &state.status {
                return Err(err.clone());
            }
            if shared.non_blocking {
                return Err(Error::TryAgain);
            }
            shared.cv.wait(&mut state);
        }
        if let Some(err) = &state.status {
            return Err(err.clone());
        }
        LoggerShared::swap_and_schedule(shared, &mut state, options.epoch_flush, options.finalize);
        if !options.no_wait {
            let target = state.num_flush_requested;
            while state.num_flush_completed < target {
                shared.cv.wait(&mut state);
            }
            if let Some(err) = &state.status {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    /// Block until every requested flush has completed.
    pub fn wait(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        while state.num_flush_completed < state.num_flush_requested
            || state.imm_active
            || state.has_bg_compaction
        {
            shared.cv.wait(&mut state);
        }
        match &state.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Drain, then push all buffered log bytes down to the files.
    pub fn sync_and_close(&self) -> Result<()> {
        self.wait()?;
        self.shared.data_sink.sync()?;
        self.shared.indx_sink.sync()?;
        Ok(())
    }

    pub fn memory_usage(&self) -> usize {
        let state = self.shared.state.lock();
        let mut total = state.mem_buf.memory_usage();
        if let Some(job) = &state.imm {
            total += job.buf.memory_usage();
        }
        if let Some((buf, _)) = &state.spare {
            total += buf.memory_usage();
        }
        total
    }

    pub fn output_stats(&self) -> OutputStats {
        self.shared.tb.lock().output_stats()
    }

    pub fn io_stats(&self) -> crate::log::IoStats {
        crate::log::IoStats {
            data_bytes: self.shared.data_sink.io_bytes(),
            data_ops: self.shared.data_sink.io_ops(),
            index_bytes: self.shared.indx_sink.io_bytes(),
            index_ops: self.shared.indx_sink.io_ops(),
        }
    }
}

impl LoggerShared {
    /// Swap the active pair into the immutable slot and make sure a
    /// background task will pick it up. Lock must be held.
    fn swap_and_schedule(
        this: &Arc<Self>,
        state: &mut parking_lot::MutexGuard<'_, LoggerState>,
        epoch_flush: bool,
        finalize: bool,
    ) {
        debug_assert!(!state.imm_active);
        let (mut next_buf, mut next_filter) =
            state.spare.take().expect("spare pair exists while imm is idle");
        next_buf.reset();
        next_buf.reserve(this.entries_per_buf, this.buf_threshold);
        next_filter.reset(this.entries_per_buf);
        let buf = std::mem::replace(&mut state.mem_buf, next_buf);
        let filter = std::mem::replace(&mut state.mem_filter, next_filter);
        state.imm = Some(ImmJob {
            buf,
            filter,
            is_epoch_flush: epoch_flush,
            is_final: finalize,
        });
        state.imm_active = true;
        state.num_flush_requested += 1;
        Self::schedule(this, state);
    }

    fn schedule(this: &Arc<Self>, state: &mut parking_lot::MutexGuard<'_, LoggerState>) {
        if state.has_bg_compaction {
            return; // the running task drains the slot before exiting
        }
        state.has_bg_compaction = true;
        match &this.pool {
            Some(pool) => {
                let shared = this.clone();
                pool.spawn(move || Self::background_work(&shared));
            }
            None => {
                // No pool configured: compact on the calling thread.
                parking_lot::MutexGuard::unlocked(state, || Self::background_work(this));
            }
        }
    }

    fn background_work(this: &Arc<Self>) {
        loop {
            let job = {
                let mut state = this.state.lock();
                match state.imm.take() {
                    Some(job) => job,
                    None => {
                        state.has_bg_compaction = false;
                        this.cv.notify_all();
                        return;
                    }
                }
            };
            let (buf, filter, status) = this.compact(job);
            let mut state = this.state.lock();
            if let Err(err) = status {
                if state.status.is_none() {
                    log::warn!("part {}: compaction failed: {err}", this.part);
                    state.status = Some(err);
                }
            }
            state.spare = Some((buf, filter));
            state.imm_active = false;
            state.num_flush_completed += 1;
            this.cv.notify_all();
        }
    }

    /// Drain one immutable pair into the table logger. Runs without the
    /// state lock; `tb` is only ever touched by the single in-flight task.
    fn compact(&self, job: ImmJob) -> (WriteBuffer, FilterBuilder, Result<()>) {
        let ImmJob {
            mut buf,
            mut filter,
            is_epoch_flush,
            is_final,
        } = job;
        self.emit(|micros| {
            Event::CompactionStart(CompactionEvent {
                micros,
                part: self.part,
            })
        });
        log::debug!(
            "part {}: compacting {} entries ({} bytes){}{}",
            self.part,
            buf.num_entries(),
            buf.current_buffer_size(),
            if is_epoch_flush { ", epoch flush" } else { "" },
            if is_final { ", final" } else { "" },
        );

        if self.skip_sort {
            buf.finish();
        } else {
            buf.finish_and_sort();
        }

        let mut tb = self.tb.lock();
        let mut prev_key: Option<Vec<u8>> = None;
        for (key, value) in buf.iter() {
            if self.mode == DirMode::UniqueDrop {
                if prev_key.as_deref() == Some(key) {
                    tb.record_dropped_key();
                    continue;
                }
                prev_key = Some(key.to_vec());
            }
            tb.add(key, value);
        }
        let filter_type = filter.filter_type();
        if filter.is_enabled() && buf.num_entries() > 0 {
            let bytes = filter.finish().to_vec();
            tb.end_table(Some(&bytes), filter_type);
        } else {
            tb.end_table(None, filter_type);
        }
        if is_epoch_flush {
            tb.make_epoch();
        }
        let mut status = tb.status();
        if is_final {
            status = tb.finish();
        }
        drop(tb);

        self.emit(|micros| {
            Event::CompactionEnd(CompactionEvent {
                micros,
                part: self.part,
            })
        });

        buf.reset();
        (buf, filter, status)
    }

    fn emit(&self, make: impl FnOnce(u64) -> Event) {
        if let Some(listener) = &self.listener {
            listener.on_event(make(self.env.now_micros()));
        }
    }
}
