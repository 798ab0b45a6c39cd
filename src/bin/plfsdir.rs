//! Benchmark driver for the directory engine.
//!
//! `plfsdir --bench=io` replays a bulk insertion against rate-limited log
//! sinks (emulating a burst-buffer link); `plfsdir --bench=bf` builds a
//! directory in memory and replays point lookups to measure filter
//! effectiveness. Tunables come from environment variables, matching the
//! historical harness: `FT_TYPE`, `LINK_SPEED`, `NUM_FILES`, `NUM_THREADS`,
//! `BATCH_SIZE`, `BATCHED_INSERTION`, `LG_PARTS`, `BF_BITS`, `FT_BITS`,
//! `BM_KEY_BITS`, `VALUE_SIZE`, `KEY_SIZE`, `MEMTABLE_SIZE`, `BLOCK_SIZE`,
//! `BLOCK_BATCH_SIZE`, `BLOCK_UTIL` (per-mille), `DATA_BUFFER`,
//! `MIN_DATA_BUFFER`, `INDEX_BUFFER`, `MIN_INDEX_BUFFER`, `ORDERED_KEYS`,
//! `SNAPPY`, `FORCE_FIFO` (accepted, no effect off Linux FIFO schedulers),
//! `PRINT_EVENTS`, `FALSE_KEYS`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use xxhash_rust::xxh64::xxh64;

use plfsdir::env::{Env, MemEnv, RandomAccessFile, SequentialFile, WritableFile};
use plfsdir::{
    BitmapFormat, Compression, DirMode, DirOptions, DirReader, DirWriter, Error, Event,
    EventListener, FilterChoice,
};

#[derive(Debug, Parser)]
#[command(name = "plfsdir")]
#[command(about = "PLFS directory engine benchmarks", long_about = None)]
struct Cli {
    #[arg(long, value_enum)]
    bench: Bench,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Bench {
    /// Bulk insertion against an emulated storage link.
    Io,
    /// Filter build + point-lookup replay, fully in memory.
    Bf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.bench {
        Bench::Io => IoBench::from_env().run(),
        Bench::Bf => BfBench::from_env().run(),
    }
}

// ---------------------------------------------------------------------------
// Env-var tunables
// ---------------------------------------------------------------------------

fn get_option(key: &str, default: i64) -> i64 {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v.parse().unwrap_or(default),
        _ => default,
    }
}

fn filter_from_env(default_filter: FilterChoice) -> (FilterChoice, BitmapFormat) {
    let format = BitmapFormat::Uncompressed;
    match std::env::var("FT_TYPE").ok().as_deref() {
        None | Some("") => (default_filter, format),
        Some("bf") => (FilterChoice::Bloom, format),
        Some("bmp") => (FilterChoice::Bitmap, BitmapFormat::Uncompressed),
        Some("vb") => (FilterChoice::Bitmap, BitmapFormat::Varint),
        Some("vbp") => (FilterChoice::Bitmap, BitmapFormat::VarintPlus),
        Some("r") => (FilterChoice::Bitmap, BitmapFormat::Roaring),
        Some("pr") => (FilterChoice::Bitmap, BitmapFormat::PartitionedRoaring),
        Some("pfdelta") => (FilterChoice::Bitmap, BitmapFormat::PForDelta),
        Some(other) => {
            log::warn!("unknown FT_TYPE {other:?}, keeping {default_filter:?}");
            (default_filter, format)
        }
    }
}

fn options_from_env() -> DirOptions {
    let (filter, bitmap_format) = filter_from_env(FilterChoice::Bloom);
    DirOptions {
        lg_parts: get_option("LG_PARTS", 2) as usize,
        non_blocking: get_option("BATCHED_INSERTION", 0) != 0,
        skip_sort: get_option("ORDERED_KEYS", 0) != 0,
        compression: if get_option("SNAPPY", 0) != 0 {
            Compression::Snappy
        } else {
            Compression::None
        },
        force_compression: true,
        total_memtable_budget: (get_option("MEMTABLE_SIZE", 48) as usize) << 20,
        block_size: (get_option("BLOCK_SIZE", 32) as usize) << 10,
        block_batch_size: (get_option("BLOCK_BATCH_SIZE", 4) as usize) << 20,
        block_util: get_option("BLOCK_UTIL", 996) as f64 / 1000.0,
        bf_bits_per_key: get_option("BF_BITS", 14) as usize,
        filter_bits_per_key: get_option("FT_BITS", 16) as usize,
        bm_key_bits: get_option("BM_KEY_BITS", 24) as usize,
        bitmap_format,
        filter,
        value_size: get_option("VALUE_SIZE", 40) as usize,
        key_size: get_option("KEY_SIZE", 8) as usize,
        data_buffer: (get_option("DATA_BUFFER", 8) as usize) << 20,
        min_data_buffer: (get_option("MIN_DATA_BUFFER", 6) as usize) << 20,
        index_buffer: (get_option("INDEX_BUFFER", 2) as usize) << 20,
        min_index_buffer: (get_option("MIN_INDEX_BUFFER", 2) as usize) << 20,
        mode: DirMode::UniqueDrop,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Event printer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EventPrinter {
    events: Mutex<Vec<Event>>,
}

impl EventListener for EventPrinter {
    fn on_event(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl EventPrinter {
    fn print(&self, base_micros: u64) {
        println!("!!! background events !!!");
        for event in self.events.lock().iter() {
            match event {
                Event::CompactionStart(e) => {
                    println!("{:.3},{},START", secs(e.micros.saturating_sub(base_micros)), e.part)
                }
                Event::CompactionEnd(e) => {
                    println!("{:.3},{},END", secs(e.micros.saturating_sub(base_micros)), e.part)
                }
                Event::IoStart(e) => {
                    println!("{:.3},io,START", secs(e.micros.saturating_sub(base_micros)))
                }
                Event::IoEnd(e) => {
                    println!("{:.3},io,END", secs(e.micros.saturating_sub(base_micros)))
                }
            }
        }
    }
}

fn secs(micros: u64) -> f64 {
    micros as f64 / 1e6
}

// ---------------------------------------------------------------------------
// Rate-limited environment (bench io)
// ---------------------------------------------------------------------------

/// Discards writes after sleeping for the emulated link; data-log files
/// also report io events.
struct LinkEnv {
    bytes_per_sec: u64,
    listener: Option<Arc<EventPrinter>>,
}

struct LinkFile {
    bytes_per_sec: u64,
    listener: Option<Arc<EventPrinter>>,
}

impl WritableFile for LinkFile {
    fn append(&mut self, data: &[u8]) -> plfsdir::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(listener) = &self.listener {
            listener.on_event(Event::IoStart(plfsdir::IoEvent {
                micros: plfsdir::env::now_wall_micros(),
            }));
        }
        let delay = Duration::from_micros(1_000_000 * data.len() as u64 / self.bytes_per_sec);
        std::thread::sleep(delay);
        if let Some(listener) = &self.listener {
            listener.on_event(Event::IoEnd(plfsdir::IoEvent {
                micros: plfsdir::env::now_wall_micros(),
            }));
        }
        Ok(())
    }

    fn flush(&mut self) -> plfsdir::Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> plfsdir::Result<()> {
        Ok(())
    }
}

impl Env for LinkEnv {
    fn new_writable_file(&self, path: &Path) -> plfsdir::Result<Box<dyn WritableFile>> {
        let is_data_log = path.extension().is_some_and(|e| e == "dat");
        Ok(Box::new(LinkFile {
            bytes_per_sec: self.bytes_per_sec,
            listener: if is_data_log {
                self.listener.clone()
            } else {
                None
            },
        }))
    }

    fn new_sequential_file(&self, _path: &Path) -> plfsdir::Result<Box<dyn SequentialFile>> {
        Err(Error::InvalidArgument("link env is write-only".to_string()))
    }

    fn new_random_access_file(&self, _path: &Path) -> plfsdir::Result<Arc<dyn RandomAccessFile>> {
        Err(Error::InvalidArgument("link env is write-only".to_string()))
    }

    fn get_file_size(&self, _path: &Path) -> plfsdir::Result<u64> {
        Ok(0)
    }

    fn create_dir(&self, _path: &Path) -> plfsdir::Result<()> {
        Ok(())
    }

    fn now_micros(&self) -> u64 {
        plfsdir::env::now_wall_micros()
    }
}

// ---------------------------------------------------------------------------
// Key generation
// ---------------------------------------------------------------------------

struct KeyMaker {
    key_size: usize,
    ordered: bool,
    /// Pre-shuffled 32-bit keys; required by bitmap filters so every key
    /// stays inside the filter domain.
    pregenerated: Vec<u32>,
}

impl KeyMaker {
    fn new(options: &DirOptions, num_files: usize, ordered: bool) -> anyhow::Result<Self> {
        let mut pregenerated = Vec::new();
        if options.filter == FilterChoice::Bitmap {
            anyhow::ensure!(
                num_files as u64 <= 1u64 << options.bm_key_bits,
                "NUM_FILES must honor the bitmap key space"
            );
            anyhow::ensure!(options.key_size >= 4, "bitmap keys need >= 4 bytes");
            log::info!("generating {num_files} keys");
            pregenerated = (0..num_files as u32).collect();
            let mut rng = rand::rngs::SmallRng::seed_from_u64(301);
            pregenerated.shuffle(&mut rng);
        } else {
            anyhow::ensure!(options.key_size >= 8, "hashed keys need >= 8 bytes");
        }
        Ok(Self {
            key_size: options.key_size,
            ordered,
            pregenerated,
        })
    }

    fn fill(&self, index: usize, key: &mut Vec<u8>) {
        key.clear();
        key.resize(self.key_size, 0);
        if !self.pregenerated.is_empty() {
            key[..4].copy_from_slice(&self.pregenerated[index].to_le_bytes());
        } else if self.ordered {
            key[..8].copy_from_slice(&(index as u64).to_be_bytes());
        } else {
            // Collisions are possible but vanishingly unlikely.
            let h = xxh64(&(index as u64).to_le_bytes(), 0);
            key[..8].copy_from_slice(&h.to_le_bytes());
        }
    }
}

fn make_pool(num_threads: usize) -> anyhow::Result<Option<Arc<rayon::ThreadPool>>> {
    if num_threads == 0 {
        return Ok(None);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("plfsdir-compact-{i}"))
        .build()
        .context("build compaction pool")?;
    Ok(Some(Arc::new(pool)))
}

// ---------------------------------------------------------------------------
// bench io
// ---------------------------------------------------------------------------

struct IoBench {
    options: DirOptions,
    num_files: usize,
    num_threads: usize,
    batch_size: usize,
    batched: bool,
    ordered: bool,
    mbps: u64,
    print_events: bool,
    printer: Arc<EventPrinter>,
}

impl IoBench {
    fn from_env() -> Self {
        let mut options = options_from_env();
        let printer = Arc::new(EventPrinter::default());
        if get_option("PRINT_EVENTS", 0) != 0 {
            options.listener = Some(printer.clone());
        }
        if get_option("FORCE_FIFO", 0) != 0 {
            log::warn!("FORCE_FIFO is accepted but has no effect here");
        }
        Self {
            num_files: (get_option("NUM_FILES", 16) as usize) << 20,
            num_threads: get_option("NUM_THREADS", 4) as usize,
            batch_size: (get_option("BATCH_SIZE", 4) as usize) << 10,
            batched: get_option("BATCHED_INSERTION", 0) != 0,
            ordered: get_option("ORDERED_KEYS", 0) != 0,
            mbps: get_option("LINK_SPEED", 6) as u64,
            print_events: get_option("PRINT_EVENTS", 0) != 0,
            printer,
            options,
        }
    }

    fn run(mut self) -> anyhow::Result<()> {
        self.options.compaction_pool = make_pool(self.num_threads)?;
        self.options.env = Arc::new(LinkEnv {
            bytes_per_sec: self.mbps.max(1) << 20,
            listener: self.options.listener.is_some().then(|| self.printer.clone()),
        });
        let keys = KeyMaker::new(&self.options, self.num_files, self.ordered)?;

        let writer = DirWriter::open(self.options.clone(), "/plfsdir-bench")
            .context("open dir writer")?;
        let start = plfsdir::env::now_wall_micros();
        log::info!(
            "inserting {} files over a {} MiB/s link",
            self.num_files,
            self.mbps
        );

        let value = vec![b'x'; self.options.value_size];
        let mut key = Vec::new();
        let mut inserted = 0usize;
        while inserted < self.num_files {
            keys.fill(inserted, &mut key);
            match writer.append(&key, &value, 0) {
                Ok(()) => {
                    inserted += 1;
                    if inserted % (1 << 20) == 0 {
                        log::info!("{:.2}% inserted", 100.0 * inserted as f64 / self.num_files as f64);
                    }
                }
                Err(Error::TryAgain) if self.batched => {
                    // Non-blocking backpressure: give the compactor room.
                    std::thread::sleep(Duration::from_micros(50 * self.batch_size as u64 / 4096));
                }
                Err(err) => return Err(err).context("append"),
            }
        }
        writer.epoch_flush(0).context("epoch flush")?;
        writer.finish().context("finish")?;
        let dura = plfsdir::env::now_wall_micros() - start;

        self.report(&writer, dura);
        if self.print_events {
            self.printer.print(start);
        }
        Ok(())
    }

    fn report(&self, writer: &DirWriter, dura: u64) {
        let ki = 1024.0;
        let stats = writer.output_stats();
        let io = writer.io_stats();
        let user_bytes = (stats.key_size + stats.value_size) as f64;
        println!("----------------------------------------");
        println!("     Total Memory Usage: {:.3} MiB", writer.memory_usage() as f64 / ki / ki);
        println!("             Total Time: {:.3} s", secs(dura));
        println!("      Batched Insertion: {}", if self.batched { "Yes" } else { "No" });
        println!("           Ordered Keys: {}", if self.ordered { "Yes" } else { "No" });
        println!("                FT Type: {:?}", self.options.filter);
        println!("     Num Files Inserted: {}", self.num_files);
        println!("Num MemTable Partitions: {}", 1 << self.options.lg_parts);
        println!("         Num Bg Threads: {}", self.num_threads);
        println!("    Emulated Link Speed: {} MiB/s (per log)", self.mbps);
        println!(
            "            Write Speed: {:.3} MiB/s (observed by app)",
            1e6 * user_bytes / ki / ki / dura as f64
        );
        println!(
            " Aggregated SST Indexes: {:.3} KiB (raw)",
            stats.index_size as f64 / ki
        );
        println!(
            "          Aggregated FT: {:.3} MiB (+{:.2}%)",
            stats.filter_size as f64 / ki / ki,
            100.0 * stats.filter_size as f64 / user_bytes
        );
        println!(
            "     Final Phys Indexes: {:.3} MiB",
            io.index_bytes as f64 / ki / ki
        );
        println!(
            "        Total User Data: {:.3} MiB (K+V)",
            user_bytes / ki / ki
        );
        println!(
            "        Final Phys Data: {:.3} MiB (+{:.2}% due to formatting and padding)",
            io.data_bytes as f64 / ki / ki,
            100.0 * io.data_bytes as f64 / user_bytes - 100.0
        );
        if io.data_ops > 0 {
            println!(
                "           Avg I/O Size: {:.3} MiB",
                io.data_bytes as f64 / io.data_ops as f64 / ki / ki
            );
        }
        println!("              Total SST: {}", stats.num_tables);
        println!("       Total SST Blocks: {}", stats.num_data_blocks);
        println!(
            "         Total SST Keys: {:.1} M ({} dropped)",
            stats.num_keys as f64 / ki / ki,
            stats.num_dropped_keys
        );
        println!("             Value Size: {} Bytes", self.options.value_size);
        println!("               Key Size: {} Bytes", self.options.key_size);
    }
}

// ---------------------------------------------------------------------------
// bench bf
// ---------------------------------------------------------------------------

struct BfBench {
    options: DirOptions,
    num_files: usize,
    false_keys: bool,
}

impl BfBench {
    fn from_env() -> Self {
        let mut options = options_from_env();
        options.verify_checksums = false;
        options.paranoid_checks = false;
        options.env = Arc::new(MemEnv::new());
        Self {
            num_files: (get_option("NUM_FILES", 1) as usize) << 20,
            false_keys: get_option("FALSE_KEYS", 0) != 0,
            options,
        }
    }

    fn run(mut self) -> anyhow::Result<()> {
        self.options.compaction_pool = None;
        self.options.non_blocking = false;
        let keys = KeyMaker::new(&self.options, self.num_files, false)?;

        let writer = DirWriter::open(self.options.clone(), "/plfsdir-bf").context("open writer")?;
        let value = vec![b'x'; self.options.value_size];
        let mut key = Vec::new();
        log::info!("building directory with {} files", self.num_files);
        for i in 0..self.num_files {
            keys.fill(i, &mut key);
            writer.append(&key, &value, 0).context("append")?;
        }
        writer.epoch_flush(0).context("epoch flush")?;
        writer.finish().context("finish")?;

        let reader = DirReader::open(self.options.clone(), "/plfsdir-bf").context("open reader")?;
        log::info!("replaying {} point lookups", self.num_files);
        let start = plfsdir::env::now_wall_micros();
        let mut hits = 0usize;
        for i in 0..self.num_files {
            if self.false_keys {
                // Probe keys that were never inserted.
                key.clear();
                key.resize(self.options.key_size, 0xee);
                key[..8].copy_from_slice(&xxh64(&(i as u64).to_le_bytes(), 7).to_le_bytes());
            } else {
                keys.fill(i, &mut key);
            }
            let values = reader.read_all(&key).context("read")?;
            if !values.is_empty() {
                hits += 1;
            }
        }
        let dura = plfsdir::env::now_wall_micros() - start;
        anyhow::ensure!(
            self.false_keys || hits == self.num_files,
            "lost {} keys",
            self.num_files - hits
        );

        let io = reader.io_stats();
        let ki = 1024.0;
        println!("----------------------------------------");
        println!("             Total Time: {:.3} s", secs(dura));
        println!(
            "          Avg Read Time: {:.3} us (per file)",
            dura as f64 / self.num_files as f64
        );
        println!("                FT Type: {:?}", self.options.filter);
        println!("           Negative Mix: {}", if self.false_keys { "Yes" } else { "No" });
        println!("              Total Hit: {hits}");
        println!(
            " Avg Num Seeks Per Read: {:.3} (per file)",
            io.data_ops as f64 / self.num_files as f64
        );
        println!(
            "  Total Indexes Fetched: {:.3} MB",
            io.index_bytes as f64 / ki / ki
        );
        println!(
            "     Total Data Fetched: {:.3} GB",
            io.data_bytes as f64 / ki / ki / ki
        );
        if io.data_ops > 0 {
            println!(
                "           Avg I/O size: {:.3} KB",
                io.data_bytes as f64 / io.data_ops as f64 / ki
            );
        }
        Ok(())
    }
}
