//! The request-execution backend: an embedded key-value store with point-lookup.

use rocksdb::{DB, Options, PlainTableFactoryOptions, SliceTransform};

use crate::error::{AppError, fatal};

/// Fixed database path — this is an external collaborator's persisted state, not
/// something this crate configures at runtime.
pub const DB_PATH: &str = "/tmpfs/experiments/my_db";

/// The value every populated key must map to; a lookup returning anything else is a
/// backend contract violation.
const EXPECTED_VALUE: &[u8] = b"value";

/// The operation a coroutine invokes against the backend. Only point-get is
/// implemented — range-scan is a recognized [`crate::wire::JobKind`] with no backend
/// counterpart, and is a fatal "unknown request kind" the moment the scheduler tries
/// to dispatch it.
pub trait KvBackend: Send + Sync {
    /// Point-get `key`, writing the raw value bytes into `out` and returning the
    /// number of bytes written. A lookup that errors or returns an unexpected value
    /// is fatal: the backend's contract guarantees a hit for every key ever
    /// dispatched, so any other outcome means the backend was populated wrong or
    /// corrupted, not a condition the scheduler can recover from per-request.
    fn point_get(&self, key: u32, out: &mut [u8]) -> usize;
}

/// A `rocksdb`-backed [`KvBackend`]: 8-byte fixed-prefix extraction, a plain-table
/// factory (bloom bits=10, hash ratio=0.75, index sparseness=3), and auto-compactions
/// disabled (this is a read-mostly, pre-populated store; compaction would only cost
/// cycles the dispatch path can't spare).
pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    pub fn open(path: &str) -> Result<Self, AppError> {
        let mut opts = Options::default();
        opts.create_if_missing(false);
        opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(8));
        opts.set_plain_table_factory(&PlainTableFactoryOptions {
            user_key_length: 0,
            bloom_bits_per_key: 10,
            hash_table_ratio: 0.75,
            index_sparseness: 3,
            huge_page_tlb_size: 0,
            encoding_type: rocksdb::KeyEncodingType::Plain,
            full_scan_mode: false,
            store_index_in_file: false,
        });
        opts.set_disable_auto_compactions(true);

        let db = DB::open(&opts, path)?;
        Ok(RocksBackend { db })
    }
}

impl KvBackend for RocksBackend {
    fn point_get(&self, key: u32, out: &mut [u8]) -> usize {
        let formatted = format!("key{key}");

        let value = match self.db.get(formatted.as_bytes()) {
            Ok(Some(v)) => v,
            Ok(None) => fatal(format!("backend point-get miss for {formatted}")),
            Err(e) => fatal(format!("backend point-get error for {formatted}: {e}")),
        };

        if value != EXPECTED_VALUE {
            fatal(format!(
                "backend point-get for {formatted} returned unexpected value {value:?}"
            ));
        }

        let n = value.len().min(out.len());
        out[..n].copy_from_slice(&value[..n]);
        n
    }
}

/// An in-memory stand-in for [`RocksBackend`], used by this crate's own tests and
/// available to integration tests so a real RocksDB directory isn't needed to
/// exercise the scheduler end to end.
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::{EXPECTED_VALUE, KvBackend, fatal};

    pub struct MemBackend(Mutex<HashMap<u32, Vec<u8>>>);

    impl MemBackend {
        pub fn populated(keys: impl IntoIterator<Item = u32>) -> Self {
            let mut map = HashMap::new();
            for k in keys {
                map.insert(k, EXPECTED_VALUE.to_vec());
            }
            MemBackend(Mutex::new(map))
        }
    }

    impl KvBackend for MemBackend {
        fn point_get(&self, key: u32, out: &mut [u8]) -> usize {
            let map = self.0.lock().unwrap();
            let value = map
                .get(&key)
                .unwrap_or_else(|| fatal(format!("backend point-get miss for key{key}")));
            let n = value.len().min(out.len());
            out[..n].copy_from_slice(&value[..n]);
            n
        }
    }
}
