#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use cdxdb::{load_cdx, BadLines, Canonicalizer, Config, DataStore, Index, ParamMap, QueryExecutor};

static TRACING: Once = Once::new();

/// Installs a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn temp_store() -> (tempfile::TempDir, DataStore) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    let store = DataStore::open(config).expect("open data store");
    (dir, store)
}

pub fn temp_index(name: &str) -> (tempfile::TempDir, Index) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path: PathBuf = dir.path().join(format!("{name}.db"));
    let index = Index::open(name, &path, true).expect("open index");
    (dir, index)
}

/// Builds a CDX11 line for `url` at `timestamp`, digest and WARC locator
/// chosen per call so primary keys stay distinct.
pub fn cdx_line(url: &str, timestamp: u64, digest: &str, offset: u64) -> String {
    format!("- {timestamp} {url} text/html 200 {digest} - - 100 {offset} test.warc.gz")
}

/// Ingests CDX lines through the normal write path.
pub fn ingest(index: &Index, lines: &[String]) {
    let body = lines.join("\n");
    load_cdx(index, &Canonicalizer::default(), &body, BadLines::Error).expect("ingest cdx");
}

/// Runs a query and returns `(timestamp, urlkey)` pairs in result order.
pub fn run_query(index: &Index, config: &Config, pairs: &[(&str, &str)]) -> Vec<(u64, String)> {
    let canonicalizer = Canonicalizer::new(config.canon.clone());
    let executor = QueryExecutor::new(index, &canonicalizer, config, &[]);
    let outcome = executor
        .execute(&ParamMap::from_pairs(pairs.iter().copied()))
        .expect("execute query");
    outcome
        .map(|c| c.expect("capture"))
        .map(|c| (c.timestamp, c.urlkey))
        .collect()
}
