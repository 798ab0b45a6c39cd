use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use plfsdir::env::MemEnv;
use plfsdir::{Compression, DirMode, DirOptions, DirReader, DirWriter, FilterChoice};

fn options() -> DirOptions {
    DirOptions {
        env: Arc::new(MemEnv::new()),
        total_memtable_budget: 1 << 20,
        block_batch_size: 256 << 10,
        block_size: 64 << 10,
        block_util: 0.998,
        verify_checksums: true,
        paranoid_checks: true,
        ..Default::default()
    }
}

/// Write/read harness mirroring the engine's intended call sequence:
/// append into the current epoch, seal epochs explicitly, finish before
/// the first read.
struct Harness {
    options: DirOptions,
    dir: String,
    writer: Option<DirWriter>,
    reader: Option<DirReader>,
    epoch: u32,
}

impl Harness {
    fn new(options: DirOptions, dir: &str) -> Self {
        Self {
            options,
            dir: dir.to_string(),
            writer: None,
            reader: None,
            epoch: 0,
        }
    }

    fn writer(&mut self) -> &DirWriter {
        if self.writer.is_none() {
            self.writer = Some(DirWriter::open(self.options.clone(), &self.dir).expect("open"));
        }
        self.writer.as_ref().unwrap()
    }

    fn write(&mut self, key: &str, value: &str) {
        let epoch = self.epoch;
        self.writer()
            .append(key.as_bytes(), value.as_bytes(), epoch)
            .expect("append");
    }

    fn make_epoch(&mut self) {
        let epoch = self.epoch;
        self.writer().epoch_flush(epoch).expect("epoch flush");
        self.epoch += 1;
    }

    fn finish(&mut self) {
        self.writer().finish().expect("finish");
        self.writer = None;
    }

    fn read(&mut self, key: &str) -> Bytes {
        if self.writer.is_some() {
            self.finish();
        }
        if self.reader.is_none() {
            self.reader = Some(DirReader::open(self.options.clone(), &self.dir).expect("open"));
        }
        self.reader
            .as_ref()
            .unwrap()
            .read_all(key.as_bytes())
            .expect("read")
    }
}

#[test]
fn empty() {
    let mut h = Harness::new(options(), "/empty");
    h.make_epoch();
    assert!(h.read("non-exists").is_empty());
}

#[test]
fn single_epoch() {
    let mut h = Harness::new(options(), "/single");
    for i in 1..=6 {
        h.write(&format!("k{i}"), &format!("v{i}"));
    }
    h.make_epoch();
    for i in 1..=6 {
        assert_eq!(h.read(&format!("k{i}")), format!("v{i}"));
        assert!(h.read(&format!("k{i}.1")).is_empty());
    }
}

#[test]
fn multi_epoch() {
    let mut h = Harness::new(options(), "/multi");
    h.write("k1", "v1");
    h.write("k2", "v2");
    h.make_epoch();
    h.write("k1", "v3");
    h.write("k2", "v4");
    h.make_epoch();
    h.write("k1", "v5");
    h.write("k2", "v6");
    h.make_epoch();
    assert_eq!(h.read("k1"), "v1v3v5");
    assert!(h.read("k1.1").is_empty());
    assert_eq!(h.read("k2"), "v2v4v6");
}

#[test]
fn snappy() {
    let mut opts = options();
    opts.compression = Compression::Snappy;
    opts.force_compression = true;
    let mut h = Harness::new(opts, "/snappy");
    h.write("k1", "v1");
    h.write("k2", "v2");
    h.make_epoch();
    h.write("k1", "v3");
    h.write("k2", "v4");
    h.make_epoch();
    h.write("k1", "v5");
    h.write("k2", "v6");
    h.make_epoch();
    assert_eq!(h.read("k1"), "v1v3v5");
    assert!(h.read("k1.1").is_empty());
    assert_eq!(h.read("k2"), "v2v4v6");
}

#[test]
fn large_batch() {
    let dummy_val = "x".repeat(32);
    let batch_size = 64 << 10;
    let mut h = Harness::new(options(), "/large");
    for i in 0..batch_size {
        h.write(&format!("k{i:07}"), &dummy_val);
    }
    h.make_epoch();
    for i in 0..batch_size {
        h.write(&format!("k{i:07}"), &dummy_val);
    }
    h.make_epoch();
    for i in 0..batch_size {
        let value = h.read(&format!("k{i:07}"));
        assert_eq!(value.len(), dummy_val.len() * 2, "key k{i:07}");
    }
    assert!(h.read("kx").is_empty());
}

#[test]
fn no_filter() {
    let mut opts = options();
    opts.filter = FilterChoice::Bloom;
    opts.bf_bits_per_key = 0;
    let mut h = Harness::new(opts, "/nofilter");
    h.write("k1", "v1");
    h.write("k2", "v2");
    h.make_epoch();
    h.write("k3", "v3");
    h.write("k4", "v4");
    h.make_epoch();
    h.write("k5", "v5");
    h.write("k6", "v6");
    h.make_epoch();

    // Filter blocks must be absent from the output.
    h.writer().wait().expect("wait");
    let stats = h.writer().output_stats();
    assert_eq!(stats.filter_size, 0);
    assert_eq!(stats.final_filter_size, 0);
    h.finish();

    for i in 1..=6 {
        assert_eq!(h.read(&format!("k{i}")), format!("v{i}"));
        assert!(h.read(&format!("k{i}.1")).is_empty());
    }
}

#[test]
fn log_rotation() {
    let mut opts = options();
    opts.epoch_log_rotation = true;
    let mut h = Harness::new(opts, "/rotation");
    h.write("k1", "v1");
    h.make_epoch();
    h.write("k1", "v2");
    h.make_epoch();
    h.write("k1", "v3");
    h.make_epoch();
    h.finish();
    // Rotated data logs read back per epoch.
    assert_eq!(h.read("k1"), "v1v2v3");
}

#[test]
fn multi_map() {
    let mut opts = options();
    opts.mode = DirMode::MultiMap;
    let mut h = Harness::new(opts, "/multimap");
    h.write("k1", "v1");
    h.write("k1", "v2");
    h.make_epoch();
    h.write("k0", "v3");
    h.write("k1", "v4");
    h.write("k1", "v5");
    h.make_epoch();
    h.write("k1", "v6");
    h.write("k1", "v7");
    h.write("k5", "v8");
    h.make_epoch();
    h.write("k1", "v9");
    h.make_epoch();
    assert_eq!(h.read("k1"), "v1v2v4v5v6v7v9");
    assert_eq!(h.read("k0"), "v3");
    assert_eq!(h.read("k5"), "v8");
}

#[test]
fn unique_drop_discards_duplicates() {
    let mut opts = options();
    opts.mode = DirMode::UniqueDrop;
    let mut h = Harness::new(opts, "/uniquedrop");
    h.write("k1", "v1");
    h.write("k1", "v2");
    h.write("k2", "v3");
    h.make_epoch();
    h.writer().wait().expect("wait");
    let stats = h.writer().output_stats();
    assert_eq!(stats.num_dropped_keys, 1);
    assert_eq!(stats.num_keys, 2);
    assert_eq!(h.read("k1"), "v1");
    assert_eq!(h.read("k2"), "v3");
}

#[test]
fn every_filter_family_roundtrips() {
    let cases = [
        (FilterChoice::Bloom, "bloom"),
        (FilterChoice::Bitmap, "bitmap"),
        (FilterChoice::Cuckoo, "cuckoo"),
        (FilterChoice::NoFilter, "none"),
    ];
    for (filter, name) in cases {
        let mut opts = options();
        opts.filter = filter;
        opts.bm_key_bits = 24;
        // Bitmap filters require keys inside the 4-byte LE domain.
        let mut h = Harness::new(opts, &format!("/family-{name}"));
        for i in 0..512u32 {
            let epoch = h.epoch;
            h.writer()
                .append(&i.to_le_bytes(), format!("v{i}").as_bytes(), epoch)
                .expect("append");
        }
        h.make_epoch();
        h.finish();
        let reader = DirReader::open(h.options.clone(), &h.dir).expect("open");
        for i in 0..512u32 {
            assert_eq!(
                reader.read_all(&i.to_le_bytes()).expect("read"),
                format!("v{i}").as_bytes(),
                "{name}: key {i}"
            );
        }
        for i in 10_000..10_064u32 {
            assert!(
                reader.read_all(&i.to_le_bytes()).expect("read").is_empty(),
                "{name}: ghost key {i}"
            );
        }
    }
}

#[test]
fn sharded_directory_roundtrips() {
    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .expect("pool"),
    );
    let mut opts = options();
    opts.lg_parts = 2;
    opts.compaction_pool = Some(pool);
    let mut h = Harness::new(opts, "/sharded");
    for i in 0..4096 {
        h.write(&format!("key{i:06}"), &format!("value{i:06}"));
    }
    h.make_epoch();
    for i in 0..4096 {
        assert_eq!(h.read(&format!("key{i:06}")), format!("value{i:06}"));
    }
    assert!(h.read("keyx").is_empty());
}

#[test]
fn on_disk_roundtrip() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let opts = DirOptions {
        total_memtable_budget: 1 << 20,
        block_size: 4 << 10,
        verify_checksums: true,
        paranoid_checks: true,
        ..Default::default()
    };
    let path = dir.path().join("plfs");
    let writer = DirWriter::open(opts.clone(), &path)?;
    for i in 0..2048u32 {
        writer.append(format!("k{i:05}").as_bytes(), format!("v{i}").as_bytes(), 0)?;
    }
    writer.epoch_flush(0)?;
    writer.finish()?;
    drop(writer);

    let reader = DirReader::open(opts, &path)?;
    for i in 0..2048u32 {
        assert_eq!(
            reader.read_all(format!("k{i:05}").as_bytes())?,
            format!("v{i}").as_bytes()
        );
    }
    assert!(reader.read_all(b"missing")?.is_empty());
    Ok(())
}

#[test]
fn finish_twice_yields_identical_bytes() {
    let opts = options();
    let writer = DirWriter::open(opts.clone(), "/idem").expect("open");
    writer.append(b"k1", b"v1", 0).expect("append");
    writer.epoch_flush(0).expect("epoch flush");
    writer.finish().expect("finish");
    let io_after_first = writer.io_stats();
    writer.finish().expect("finish again");
    assert_eq!(writer.io_stats(), io_after_first);

    let reader = DirReader::open(opts, "/idem").expect("open");
    assert_eq!(reader.read_all(b"k1").expect("read"), "v1");
}
