//! Flat-file history store + HTTP fetch utilities for the cosmic tracker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDateTime;
use cosmic_core::{parse_file_stem, ChangeEvent, ChangeLog, NormalizedRecord};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cosmic-storage";

/// Suffix of the changelog written next to a snapshot.
pub const CHANGELOG_SUFFIX: &str = "-changes.json";

/// Older runs named changelogs `<stem>.changes.json`; still treated as changelogs.
pub const LEGACY_CHANGELOG_SUFFIX: &str = ".changes.json";

pub const SNAPSHOT_EXTENSION: &str = "json";

pub const DEFAULT_PUBLIC_SNAPSHOT_NAME: &str = "data.json";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// One artifact written to the history store together with its public copy.
#[derive(Debug, Clone)]
pub struct MirroredArtifact {
    pub history: StoredArtifact,
    pub public: StoredArtifact,
}

/// A snapshot file found in the history store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub stem: String,
    pub taken_at: NaiveDateTime,
}

pub fn is_changelog_name(name: &str) -> bool {
    name.ends_with(CHANGELOG_SUFFIX) || name.ends_with(LEGACY_CHANGELOG_SUFFIX)
}

pub fn snapshot_file_name(stem: &str) -> String {
    format!("{stem}.{SNAPSHOT_EXTENSION}")
}

pub fn changelog_file_name(stem: &str) -> String {
    format!("{stem}{CHANGELOG_SUFFIX}")
}

/// Human-readable UTF-8 JSON; non-ASCII text is kept as-is.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).context("serializing pretty JSON")
}

/// Directory of timestamped snapshots and changelogs plus the public mirror.
///
/// The `<YYYY-MM-DD-HH-MM>.json` naming scheme is private to this type;
/// callers only see [`SnapshotFile`] values.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    history_dir: PathBuf,
    public_dir: PathBuf,
    public_snapshot_name: String,
}

impl HistoryStore {
    pub fn new(
        history_dir: impl Into<PathBuf>,
        public_dir: impl Into<PathBuf>,
        public_snapshot_name: impl Into<String>,
    ) -> Self {
        Self {
            history_dir: history_dir.into(),
            public_dir: public_dir.into(),
            public_snapshot_name: public_snapshot_name.into(),
        }
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn public_dir(&self) -> &Path {
        &self.public_dir
    }

    pub fn public_snapshot_path(&self) -> PathBuf {
        self.public_dir.join(&self.public_snapshot_name)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    async fn history_file_names(&self) -> anyhow::Result<Vec<(String, PathBuf)>> {
        let mut entries = match fs::read_dir(&self.history_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading {}", self.history_dir.display()))
            }
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.history_dir.display()))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|ft| ft.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                out.push((name.to_string(), entry.path()));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Snapshot files with a parseable timestamp stem, oldest first.
    pub async fn list_snapshots(&self) -> anyhow::Result<Vec<SnapshotFile>> {
        let mut snapshots = Vec::new();
        for (name, path) in self.history_file_names().await? {
            if is_changelog_name(&name) {
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{SNAPSHOT_EXTENSION}")) else {
                continue;
            };
            let Some(taken_at) = parse_file_stem(stem) else {
                debug!(file = %name, "ignoring history file without timestamp stem");
                continue;
            };
            snapshots.push(SnapshotFile {
                path,
                stem: stem.to_string(),
                taken_at,
            });
        }
        snapshots.sort_by(|a, b| a.taken_at.cmp(&b.taken_at).then_with(|| a.stem.cmp(&b.stem)));
        Ok(snapshots)
    }

    pub async fn latest_snapshot(&self) -> anyhow::Result<Option<SnapshotFile>> {
        Ok(self.list_snapshots().await?.pop())
    }

    pub async fn read_snapshot_entries(
        &self,
        snapshot: &SnapshotFile,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let text = fs::read_to_string(&snapshot.path)
            .await
            .with_context(|| format!("reading {}", snapshot.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", snapshot.path.display()))
    }

    /// Remove every changelog from the history store. Snapshots are untouched.
    pub async fn purge_changelogs(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for (name, path) in self.history_file_names().await? {
            if !is_changelog_name(&name) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed.push(path),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("removing {}", path.display()))
                }
            }
        }
        Ok(removed)
    }

    /// Write `<stem>.json` to history and the same bytes to the public snapshot file.
    pub async fn write_snapshot(
        &self,
        stem: &str,
        records: &[NormalizedRecord],
    ) -> anyhow::Result<MirroredArtifact> {
        let bytes = to_pretty_json(records)?;
        let history = self
            .write_atomic(&self.history_dir.join(snapshot_file_name(stem)), &bytes)
            .await?;
        let public = self
            .write_atomic(&self.public_snapshot_path(), &bytes)
            .await?;
        Ok(MirroredArtifact { history, public })
    }

    /// Write `<stem>-changes.json` to history and public. Nothing is written for
    /// an empty event list.
    pub async fn write_changelog(
        &self,
        stem: &str,
        events: &[ChangeEvent],
    ) -> anyhow::Result<Option<MirroredArtifact>> {
        if events.is_empty() {
            return Ok(None);
        }
        let log = ChangeLog::from_events(events.to_vec());
        let bytes = to_pretty_json(&log)?;
        let name = changelog_file_name(stem);
        let history = self.write_atomic(&self.history_dir.join(&name), &bytes).await?;
        let public = self.write_atomic(&self.public_dir.join(&name), &bytes).await?;
        Ok(Some(MirroredArtifact { history, public }))
    }

    /// Replace `path` with `bytes` through a temp file and rename in the same directory.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        debug!(path = %path.display(), bytes = bytes.len(), "wrote file");
        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(bytes),
            path: path.to_path_buf(),
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-attempt HTTP client shared by all adapters of a run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` once. Non-2xx responses are errors; there are no retries.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .timeout(timeout)
                .send()
                .await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosmic_core::SourceKind;
    use tempfile::tempdir;

    fn store_in(root: &Path) -> HistoryStore {
        HistoryStore::new(
            root.join("data/history"),
            root.join("public"),
            DEFAULT_PUBLIC_SNAPSHOT_NAME,
        )
    }

    fn record(region: &str, server: &str, progress: f64) -> NormalizedRecord {
        NormalizedRecord {
            region: region.to_string(),
            server: server.to_string(),
            dc: Some("Mana".to_string()),
            progress,
            level: 4,
            last_update: "2025-07-14 14:00:00".to_string(),
            source: SourceKind::Na,
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        let hash = HistoryStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn changelog_names_are_recognised() {
        assert!(is_changelog_name("2025-07-14-14-17-changes.json"));
        assert!(is_changelog_name("2025-07-14-14-17.changes.json"));
        assert!(!is_changelog_name("2025-07-14-14-17.json"));
        assert_eq!(changelog_file_name("2025-07-14-14-17"), "2025-07-14-14-17-changes.json");
    }

    #[tokio::test]
    async fn missing_history_dir_lists_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        assert!(store.list_snapshots().await.expect("list").is_empty());
        assert!(store.latest_snapshot().await.expect("latest").is_none());
        assert!(store.purge_changelogs().await.expect("purge").is_empty());
    }

    #[tokio::test]
    async fn latest_snapshot_skips_changelogs_and_foreign_files() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let history = store.history_dir().to_path_buf();
        std::fs::create_dir_all(&history).unwrap();
        for name in [
            "2025-07-14-13-30.json",
            "2025-07-14-14-00.json",
            "2025-07-14-23-59-changes.json",
            "2025-07-15-00-00.changes.json",
            "notes.json",
            "2025-07-14-15-00.txt",
        ] {
            std::fs::write(history.join(name), "[]").unwrap();
        }

        let snapshots = store.list_snapshots().await.expect("list");
        let stems: Vec<_> = snapshots.iter().map(|s| s.stem.as_str()).collect();
        assert_eq!(stems, vec!["2025-07-14-13-30", "2025-07-14-14-00"]);

        let latest = store.latest_snapshot().await.expect("latest").expect("some");
        assert_eq!(latest.stem, "2025-07-14-14-00");
    }

    #[tokio::test]
    async fn purge_removes_only_changelogs() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let history = store.history_dir().to_path_buf();
        std::fs::create_dir_all(&history).unwrap();
        std::fs::write(history.join("2025-07-14-14-00.json"), "[]").unwrap();
        std::fs::write(history.join("2025-07-14-14-00-changes.json"), "{}").unwrap();
        std::fs::write(history.join("2025-07-14-13-30.changes.json"), "{}").unwrap();

        let removed = store.purge_changelogs().await.expect("purge");
        assert_eq!(removed.len(), 2);
        assert!(history.join("2025-07-14-14-00.json").exists());
        assert!(!history.join("2025-07-14-14-00-changes.json").exists());
        assert!(!history.join("2025-07-14-13-30.changes.json").exists());
    }

    #[tokio::test]
    async fn snapshot_is_mirrored_byte_for_byte_and_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let records = vec![record("国际服-日本", "Alexander", 37.5), record("国际服-日本", "Bahamut", 100.0)];

        let written = store
            .write_snapshot("2025-07-14-14-17", &records)
            .await
            .expect("write");
        assert_eq!(
            written.history.path,
            store.history_dir().join("2025-07-14-14-17.json")
        );
        assert_eq!(written.public.path, store.public_snapshot_path());
        assert_eq!(written.history.content_hash, written.public.content_hash);

        let history_bytes = std::fs::read(&written.history.path).unwrap();
        let public_bytes = std::fs::read(&written.public.path).unwrap();
        assert_eq!(history_bytes, public_bytes);

        let text = String::from_utf8(history_bytes).unwrap();
        assert!(text.contains("国际服-日本"));
        assert!(text.contains("\n  {"));
        let parsed: Vec<NormalizedRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, records);
    }

    #[tokio::test]
    async fn empty_changelog_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let written = store
            .write_changelog("2025-07-14-14-17", &[])
            .await
            .expect("write");
        assert!(written.is_none());
        assert!(!store.history_dir().exists());
        assert!(!store.public_dir().exists());
    }

    #[tokio::test]
    async fn changelog_is_written_to_history_and_public() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let events = vec![ChangeEvent {
            server_id: "国际服-日本-Alexander".into(),
            old_progress: 25.0,
            new_progress: 37.5,
            change_time: "2025-07-14 14:17:45".into(),
        }];

        let written = store
            .write_changelog("2025-07-14-14-17", &events)
            .await
            .expect("write")
            .expect("some");
        assert_eq!(
            written.public.path,
            store.public_dir().join("2025-07-14-14-17-changes.json")
        );
        let log: ChangeLog =
            serde_json::from_slice(&std::fs::read(&written.history.path).unwrap()).unwrap();
        assert_eq!(log.kind, "progress_changes");
        assert_eq!(log.count, 1);
        assert_eq!(log.changes, events);
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_file_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let target = dir.path().join("out/data.json");

        store.write_atomic(&target, b"first").await.expect("first");
        let second = store.write_atomic(&target, b"second").await.expect("second");

        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        assert_eq!(second.byte_size, 6);
        let leftovers = std::fs::read_dir(dir.path().join("out")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: Some("cosmic-test/0.1".to_string()),
        })
        .expect("client");
        let err = fetcher
            .fetch_bytes(
                Uuid::new_v4(),
                "cn",
                &format!("http://127.0.0.1:{port}/api"),
                &[("t", "1".to_string())],
                Duration::from_secs(2),
            )
            .await
            .expect_err("connection refused");
        assert!(matches!(err, FetchError::Request(_)));
    }
}
