use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::{fs, result};

use snafu::{ResultExt, Snafu};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::model::HistoryRecord;

const LOG_TARGET: &str = "medpost_bot::history";

#[derive(Debug, Snafu)]
pub enum HistoryError {
    #[snafu(display("Failed to read history file {}: {source}", path.display()))]
    Read { path: PathBuf, source: io::Error },
    #[snafu(display("History file {} is corrupt: {source}", path.display()))]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to encode history: {source}"))]
    Encode { source: serde_json::Error },
    #[snafu(display("Failed to write history next to {}: {source}", path.display()))]
    Write { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to replace history file {}: {source}", path.display()))]
    Replace {
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

pub type HistoryResult<T> = result::Result<T, HistoryError>;

/// Publish history backed by a single JSON file.
///
/// The whole file is rewritten on every append. Writes go to a temporary
/// file in the same directory which is then renamed over the old one, so
/// readers see either the previous or the new history, never a partial one.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    records: Vec<HistoryRecord>,
}

impl HistoryStore {
    /// Load the history at `path`. A missing or blank file is an empty
    /// history.
    pub fn load(path: impl Into<PathBuf>) -> HistoryResult<Self> {
        let path = path.into();

        let records = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content).context(DecodeSnafu { path: &path })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(target: LOG_TARGET, path = %path.display(), "No history file yet, starting empty");
                Vec::new()
            }
            Err(source) => return Err(HistoryError::Read { path, source }),
        };

        debug!(target: LOG_TARGET, path = %path.display(), count = records.len(), "Loaded publish history");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|record| record.title.as_str())
    }

    pub fn contains_title(&self, title: &str) -> bool {
        self.titles().any(|t| t == title)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append `record` and write the whole history to disk before returning.
    ///
    /// On error the record is not kept in memory either.
    pub fn append_and_persist(&mut self, record: HistoryRecord) -> HistoryResult<()> {
        self.records.push(record);

        if let Err(err) = self.persist() {
            self.records.pop();
            return Err(err);
        }

        Ok(())
    }

    fn persist(&self) -> HistoryResult<()> {
        let json = serde_json::to_string_pretty(&self.records).context(EncodeSnafu)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).context(WriteSnafu { path: &self.path })?;

        let mut tmp = NamedTempFile::new_in(dir).context(WriteSnafu { path: &self.path })?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.write_all(b"\n"))
            .and_then(|()| tmp.as_file().sync_all())
            .context(WriteSnafu { path: &self.path })?;
        tmp.persist(&self.path)
            .context(ReplaceSnafu { path: &self.path })?;
        // The rename is only durable once the directory entry is on disk
        fs::File::open(dir)
            .and_then(|dir| dir.sync_all())
            .context(WriteSnafu { path: &self.path })?;

        debug!(target: LOG_TARGET, path = %self.path.display(), count = self.records.len(), "Persisted publish history");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn record(title: &str) -> HistoryRecord {
        HistoryRecord {
            title: title.to_string(),
            link: format!("https://example.com/{title}"),
            published_at: datetime!(2025-06-15 10:30:00 UTC),
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();

        let store = HistoryStore::load(dir.path().join("published_history.json")).unwrap();

        assert!(store.is_empty());
    }

    #[test]
    fn load_blank_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("published_history.json");
        fs::write(&path, "\n").unwrap();

        assert!(HistoryStore::load(&path).unwrap().is_empty());
    }

    #[test]
    fn load_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("published_history.json");
        fs::write(&path, "[{\"title\": ").unwrap();

        assert!(matches!(
            HistoryStore::load(&path),
            Err(HistoryError::Decode { .. })
        ));
    }

    #[test]
    fn load_accepts_timestamps_without_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("published_history.json");
        fs::write(
            &path,
            r#"[
  {
    "title": "Нові рекомендації ВООЗ",
    "link": "https://www.who.int/news/item/1",
    "published_at": "2025-06-15T10:30:00.123456"
  }
]"#,
        )
        .unwrap();

        let mut store = HistoryStore::load(&path).unwrap();
        assert!(store.contains_title("Нові рекомендації ВООЗ"));
        assert_eq!(
            store.records()[0].published_at,
            datetime!(2025-06-15 10:30:00.123456 UTC)
        );

        // Rewritten entries are normalized to RFC 3339
        store.append_and_persist(record("A")).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"published_at\": \"2025-06-15T10:30:00.123456Z\""));
    }

    #[test]
    fn appended_record_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("published_history.json");

        let mut store = HistoryStore::load(&path).unwrap();
        store.append_and_persist(record("A")).unwrap();
        store.append_and_persist(record("B")).unwrap();

        let reloaded = HistoryStore::load(&path).unwrap();
        assert_eq!(reloaded.records(), &[record("A"), record("B")]);
        assert!(reloaded.contains_title("B"));
    }

    #[test]
    fn persist_creates_parent_dirs_and_keeps_unicode_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("published_history.json");

        let mut store = HistoryStore::load(&path).unwrap();
        store.append_and_persist(record("Вплив мікропластику")).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("Вплив мікропластику"));
        assert!(content.contains("\"published_at\": \"2025-06-15T10:30:00Z\""));
    }

    #[test]
    fn persist_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("published_history.json");

        let mut store = HistoryStore::load(&path).unwrap();
        store.append_and_persist(record("A")).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn failed_persist_does_not_keep_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("published_history.json");

        let mut store = HistoryStore::load(&path).unwrap();
        // A directory in place of the history file makes the final rename fail
        fs::create_dir(&path).unwrap();

        assert!(store.append_and_persist(record("A")).is_err());
        assert!(store.is_empty());
    }
}
