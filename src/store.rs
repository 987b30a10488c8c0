use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::TimeWindow;
use crate::error::HarvestError;

pub const STATION_TABLE_FILE: &str = "station.csv";
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Output directory layout: one station table plus one archive per chunk.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_std(root: &std::path::Path) -> Result<Self, HarvestError> {
        let root = Utf8PathBuf::from_path_buf(root.to_path_buf())
            .map_err(|_| HarvestError::Filesystem("invalid output path".to_string()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn station_table_path(&self) -> Utf8PathBuf {
        self.root.join(STATION_TABLE_FILE)
    }

    pub fn archive_path(&self, window: &TimeWindow) -> Utf8PathBuf {
        self.root
            .join(format!("{}.{ARCHIVE_EXTENSION}", window.archive_stem()))
    }

    pub fn ensure_root(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn exists(&self, path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Chunk archives present in the store, sorted by name (and so by time).
    pub fn list_archives(&self) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut archives = Vec::new();
        let entries = fs::read_dir(self.root.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.is_file() && path.extension() == Some(ARCHIVE_EXTENSION) {
                archives.push(path);
            }
        }
        archives.sort();
        Ok(archives)
    }
}
