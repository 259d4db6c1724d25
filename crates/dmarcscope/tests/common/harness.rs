//! Isolated environment for ingestion tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use dmarcscope::db::Database;
use dmarcscope::ingest::{import_files, ImportSummary, IngestOutcome, Ingestor};
use dmarcscope::source::{LocalSource, SourceDocument};

pub struct TestHarness {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub db: Database,
    pub ingestor: Ingestor,
}

impl TestHarness {
    /// File-backed database in WAL mode, so reads go through the separate
    /// reader connection as in production.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let input_dir = temp_dir.path().join("input");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");

        let db = Database::open(&temp_dir.path().join("data").join("dmarcscope.db"))
            .expect("Failed to open database");
        let ingestor = Ingestor::new(db.clone());

        Self {
            temp_dir,
            input_dir,
            db,
            ingestor,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write_input(&self, filename: &str, content: impl AsRef<[u8]>) -> PathBuf {
        let path = self.input_dir.join(filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&path, content).expect("Failed to write input file");
        path
    }

    /// Ingests one file through the local adapter.
    pub fn ingest_file(&self, path: &Path) -> IngestOutcome {
        let document = LocalSource::default()
            .load(path)
            .expect("input file should be readable");
        self.ingestor.ingest(&document).expect("ledger write failed")
    }

    pub fn ingest(&self, document: &SourceDocument) -> IngestOutcome {
        self.ingestor.ingest(document).expect("ledger write failed")
    }

    /// Imports the whole input directory through the worker pool.
    pub fn import_all(&self, workers: usize) -> ImportSummary {
        let files = LocalSource::default()
            .collect(&[self.input_dir.clone()])
            .expect("Failed to collect input files");
        import_files(&self.ingestor, files, workers).expect("import failed")
    }

    pub fn count(&self, table: &str) -> u64 {
        self.db
            .with_read_conn(|conn| {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?)
            })
            .expect("count query failed")
    }
}
