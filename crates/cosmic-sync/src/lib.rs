//! Snapshot-diff pipeline: fetch every source, diff against the previous
//! snapshot, persist the new snapshot and its changelog.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, FixedOffset};
use cosmic_adapters::{
    collect_records, AdapterContext, CosmicApiAdapter, LodestoneReportAdapter, RegionMap,
    SourceAdapter, DEFAULT_CN_TIMEOUT, DEFAULT_CN_URL, DEFAULT_NA_TIMEOUT, DEFAULT_NA_URL,
};
use cosmic_core::{
    current_instant, format_file_stem, format_timestamp, identity_key, ChangeEvent,
    NormalizedRecord, ProgressIndex, SourceKind,
};
use cosmic_storage::{
    HistoryStore, HttpClientConfig, HttpFetcher, MirroredArtifact, DEFAULT_PUBLIC_SNAPSHOT_NAME,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cosmic-sync";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub history_dir: PathBuf,
    pub public_dir: PathBuf,
    pub public_file: String,
    pub user_agent: String,
    pub cn_url: String,
    pub na_url: String,
    pub cn_timeout_secs: u64,
    pub na_timeout_secs: u64,
    pub region_map_path: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from any variable lookup; unset or unparsable values fall back to defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = var("COSMIC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let secs = |key: &str, default: Duration| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default.as_secs())
        };
        Self {
            history_dir: workspace_root.join(
                var("COSMIC_HISTORY_DIR").unwrap_or_else(|| "data/history".to_string()),
            ),
            public_dir: workspace_root
                .join(var("COSMIC_PUBLIC_DIR").unwrap_or_else(|| "public".to_string())),
            public_file: var("COSMIC_PUBLIC_FILE")
                .unwrap_or_else(|| DEFAULT_PUBLIC_SNAPSHOT_NAME.to_string()),
            user_agent: var("COSMIC_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            cn_url: var("COSMIC_CN_URL").unwrap_or_else(|| DEFAULT_CN_URL.to_string()),
            na_url: var("COSMIC_NA_URL").unwrap_or_else(|| DEFAULT_NA_URL.to_string()),
            cn_timeout_secs: secs("COSMIC_CN_TIMEOUT_SECS", DEFAULT_CN_TIMEOUT),
            na_timeout_secs: secs("COSMIC_NA_TIMEOUT_SECS", DEFAULT_NA_TIMEOUT),
            region_map_path: var("COSMIC_REGION_MAP").map(|p| workspace_root.join(p)),
        }
    }

    pub fn history_store(&self) -> HistoryStore {
        HistoryStore::new(
            self.history_dir.clone(),
            self.public_dir.clone(),
            self.public_file.clone(),
        )
    }

    pub fn region_map(&self) -> Result<RegionMap> {
        let Some(path) = &self.region_map_path else {
            return Ok(RegionMap::builtin());
        };
        let regions = RegionMap::load_yaml(path)?;
        if regions.is_empty() {
            warn!(path = %path.display(), "region map has no entries; every data center maps to the unknown region");
        } else {
            debug!(path = %path.display(), data_centers = regions.len(), "loaded region map");
        }
        Ok(regions)
    }
}

/// Reads the progress recorded by the most recent snapshot.
#[derive(Debug, Clone)]
pub struct HistoryReader {
    store: HistoryStore,
}

impl HistoryReader {
    pub fn new(store: HistoryStore) -> Self {
        Self { store }
    }

    /// Identity key -> progress of the latest snapshot. A missing, empty or
    /// unreadable history yields an empty index.
    pub async fn load_prior_progress(&self) -> ProgressIndex {
        let latest = match self.store.latest_snapshot().await {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                debug!(dir = %self.store.history_dir().display(), "no prior snapshot");
                return ProgressIndex::new();
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "listing history failed; treating as no prior data");
                return ProgressIndex::new();
            }
        };

        match self.store.read_snapshot_entries(&latest).await {
            Ok(entries) => {
                let index = progress_index_from_entries(&entries);
                debug!(snapshot = %latest.stem, entries = index.len(), "loaded prior snapshot");
                index
            }
            Err(err) => {
                warn!(
                    snapshot = %latest.path.display(),
                    error = %format!("{err:#}"),
                    "reading prior snapshot failed; treating as no prior data"
                );
                ProgressIndex::new()
            }
        }
    }
}

/// Only entries carrying a non-empty `source` contribute.
pub fn progress_index_from_entries(entries: &[JsonValue]) -> ProgressIndex {
    entries
        .iter()
        .filter_map(|entry| {
            let source = entry.get("source")?.as_str()?;
            if source.is_empty() {
                return None;
            }
            let region = entry.get("region")?.as_str()?;
            let server = entry.get("server")?.as_str()?;
            let progress = entry.get("progress")?.as_f64()?;
            Some((identity_key(region, server), progress))
        })
        .collect()
}

/// One event per current record whose key exists in `prior` with a different value.
pub fn compute_changes(
    current: &[NormalizedRecord],
    prior: &ProgressIndex,
    change_time: &str,
) -> Vec<ChangeEvent> {
    current
        .iter()
        .filter_map(|record| {
            let key = record.identity_key();
            let old = *prior.get(&key)?;
            if old == record.progress {
                return None;
            }
            Some(ChangeEvent {
                server_id: key,
                old_progress: old,
                new_progress: record.progress,
                change_time: change_time.to_string(),
            })
        })
        .collect()
}

/// Keep one record per identity key. A later duplicate replaces the earlier
/// record in the earlier record's position. Returns the number collapsed.
pub fn collapse_duplicates(records: Vec<NormalizedRecord>) -> (Vec<NormalizedRecord>, usize) {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<NormalizedRecord> = Vec::with_capacity(records.len());
    let mut collapsed = 0usize;
    for record in records {
        let key = record.identity_key();
        if let Some(&pos) = positions.get(&key) {
            out[pos] = record;
            collapsed += 1;
        } else {
            positions.insert(key, out.len());
            out.push(record);
        }
    }
    (out, collapsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Every source came back empty; nothing was written.
    NoData,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<FixedOffset>,
    pub stem: String,
    pub status: RunStatus,
    pub total_records: usize,
    pub source_counts: BTreeMap<SourceKind, usize>,
    pub duplicates_collapsed: usize,
    pub purged_changelogs: usize,
    pub changed_keys: Vec<String>,
    pub snapshot_path: Option<String>,
    pub public_snapshot_path: Option<String>,
    pub snapshot_sha256: Option<String>,
    pub changelog_path: Option<String>,
}

impl SyncRunSummary {
    fn no_data(run_id: Uuid, started_at: DateTime<FixedOffset>, stem: String) -> Self {
        Self {
            run_id,
            started_at,
            stem,
            status: RunStatus::NoData,
            total_records: 0,
            source_counts: BTreeMap::new(),
            duplicates_collapsed: 0,
            purged_changelogs: 0,
            changed_keys: Vec::new(),
            snapshot_path: None,
            public_snapshot_path: None,
            snapshot_sha256: None,
            changelog_path: None,
        }
    }
}

impl fmt::Display for SyncRunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.status == RunStatus::NoData {
            return write!(
                f,
                "run {}: no data from any source, nothing written",
                self.run_id
            );
        }
        let counts = self
            .source_counts
            .iter()
            .map(|(source, n)| format!("{source}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        write!(
            f,
            "run {}: saved {} records ({}) -> {} & {}",
            self.run_id,
            self.total_records,
            counts,
            self.snapshot_path.as_deref().unwrap_or("-"),
            self.public_snapshot_path.as_deref().unwrap_or("-"),
        )?;
        if self.changed_keys.is_empty() {
            write!(f, "; no changes")
        } else {
            write!(
                f,
                "; {} changes: {}",
                self.changed_keys.len(),
                self.changed_keys.join(", ")
            )
        }
    }
}

pub struct SyncPipeline {
    store: HistoryStore,
    http: Arc<HttpFetcher>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let regions = config.region_map()?;
        let cn_timeout = Duration::from_secs(config.cn_timeout_secs);
        let na_timeout = Duration::from_secs(config.na_timeout_secs);
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: cn_timeout.max(na_timeout),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(CosmicApiAdapter::new(config.cn_url.clone(), cn_timeout)),
            Arc::new(LodestoneReportAdapter::new(
                config.na_url.clone(),
                na_timeout,
                regions,
            )),
        ];
        Ok(Self {
            store: config.history_store(),
            http: Arc::new(http),
            adapters,
        })
    }

    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_at(current_instant()).await
    }

    /// One full run with `now` as the run's civil instant.
    pub async fn run_at(&self, now: DateTime<FixedOffset>) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let stem = format_file_stem(now);
        let ctx = AdapterContext::new(run_id, now);
        info!(%run_id, %stem, sources = self.adapters.len(), "run started");

        let fetched = self.fetch_all(&ctx).await;
        if fetched.is_empty() {
            warn!(%run_id, "no data from any source; skipping persistence");
            return Ok(SyncRunSummary::no_data(run_id, now, stem));
        }

        let mut source_counts: BTreeMap<SourceKind, usize> = BTreeMap::new();
        for record in &fetched {
            *source_counts.entry(record.source).or_default() += 1;
        }

        let purged = self.store.purge_changelogs().await?;
        if !purged.is_empty() {
            debug!(count = purged.len(), "purged previous changelogs");
        }

        let (current, duplicates_collapsed) = collapse_duplicates(fetched);
        if duplicates_collapsed > 0 {
            warn!(duplicates_collapsed, "duplicate identity keys; kept the last record of each");
        }

        let prior = HistoryReader::new(self.store.clone())
            .load_prior_progress()
            .await;
        let changes = compute_changes(&current, &prior, &format_timestamp(now));

        let snapshot = self.store.write_snapshot(&stem, &current).await?;
        let changelog: Option<MirroredArtifact> =
            self.store.write_changelog(&stem, &changes).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at: now,
            stem,
            status: RunStatus::Completed,
            total_records: current.len(),
            source_counts,
            duplicates_collapsed,
            purged_changelogs: purged.len(),
            changed_keys: changes.iter().map(|c| c.server_id.clone()).collect(),
            snapshot_path: Some(snapshot.history.path.display().to_string()),
            public_snapshot_path: Some(snapshot.public.path.display().to_string()),
            snapshot_sha256: Some(snapshot.history.content_hash.clone()),
            changelog_path: changelog.map(|c| c.history.path.display().to_string()),
        };
        info!(
            %run_id,
            records = summary.total_records,
            changes = summary.changed_keys.len(),
            sha256 = %snapshot.history.content_hash,
            "run completed"
        );
        Ok(summary)
    }

    /// Run every adapter concurrently and concatenate in registration order.
    async fn fetch_all(&self, ctx: &AdapterContext) -> Vec<NormalizedRecord> {
        let mut tasks = JoinSet::new();
        for (index, adapter) in self.adapters.iter().enumerate() {
            let adapter = Arc::clone(adapter);
            let http = Arc::clone(&self.http);
            let ctx = ctx.clone();
            tasks.spawn(async move { (index, collect_records(adapter.as_ref(), &http, &ctx).await) });
        }

        let mut results = Vec::with_capacity(self.adapters.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "source task aborted; contributing no records"),
            }
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().flat_map(|(_, records)| records).collect()
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}
