//! Source adapter contract + the JSON-API and HTML-report adapters.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use cosmic_core::{
    clamp_progress, format_timestamp, round_down_to_half_hour, NormalizedRecord, SourceKind,
};
use cosmic_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cosmic-adapters";

pub const DEFAULT_CN_URL: &str = "https://ff14act.web.sdo.com/api/cosmicData/getCosmicData";
pub const DEFAULT_NA_URL: &str =
    "https://na.finalfantasyxiv.com/lodestone/cosmic_exploration/report/";
pub const DEFAULT_CN_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_NA_TIMEOUT: Duration = Duration::from_secs(20);

/// `code` value the JSON API reports on success.
pub const CN_SUCCESS_CODE: i64 = 10000;
pub const CN_DEFAULT_REGION: &str = "国服";
pub const CN_DEFAULT_SERVER: &str = "未知服务器";
pub const NA_UNKNOWN_REGION: &str = "国际服-未知区域";

/// Number of steps of the Lodestone progress gauge.
pub const GAUGE_STEPS: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub now: DateTime<FixedOffset>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, now: DateTime<FixedOffset>) -> Self {
        Self { run_id, now }
    }

    /// `lastUpdate` for records whose source carries no timestamp of its own.
    pub fn fallback_last_update(&self) -> String {
        format_timestamp(round_down_to_half_hour(self.now))
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload: {0}")]
    Payload(String),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceKind;

    /// Upper bound for one fetch-and-parse of this source.
    fn timeout(&self) -> Duration;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_page(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedRecord>, AdapterError>;
}

/// Fetch and parse one source. Every failure is logged and yields no records.
pub async fn collect_records(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> Vec<NormalizedRecord> {
    let source = adapter.source();
    let attempt = async {
        let page = adapter.fetch_page(http, ctx).await?;
        debug!(%source, url = %page.url, bytes = page.body.len(), "page fetched");
        adapter.parse_page(&page, ctx)
    };

    match tokio::time::timeout(adapter.timeout(), attempt).await {
        Ok(Ok(records)) => {
            info!(%source, records = records.len(), "source fetched");
            records
        }
        Ok(Err(AdapterError::Fetch(err))) if err.is_timeout() => {
            warn!(%source, error = %err, "source timed out; contributing no records");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(%source, error = %err, "source fetch failed; contributing no records");
            Vec::new()
        }
        Err(_) => {
            warn!(
                %source,
                timeout_secs = adapter.timeout().as_secs_f64(),
                "source timed out; contributing no records"
            );
            Vec::new()
        }
    }
}

/// Read-only lookup from a Lodestone data-center title to a display region.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegionMap {
    #[serde(default)]
    regions: BTreeMap<String, String>,
    #[serde(default = "default_unknown_region")]
    unknown: String,
}

fn default_unknown_region() -> String {
    NA_UNKNOWN_REGION.to_string()
}

impl Default for RegionMap {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RegionMap {
    pub fn builtin() -> Self {
        Self::from_pairs([
            ("Aether", "国际服-北美"),
            ("Crystal", "国际服-北美"),
            ("Dynamis", "国际服-北美"),
            ("Primal", "国际服-北美"),
            ("Chaos", "国际服-欧洲"),
            ("Light", "国际服-欧洲"),
            ("Materia", "国际服-大洋洲"),
            ("Elemental", "国际服-日本"),
            ("Gaia", "国际服-日本"),
            ("Mana", "国际服-日本"),
            ("Meteor", "国际服-日本"),
        ])
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            regions: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            unknown: default_unknown_region(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing region map YAML")
    }

    pub fn load_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading region map {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn region_for(&self, dc: &str) -> &str {
        self.regions
            .get(dc)
            .map(String::as_str)
            .unwrap_or(&self.unknown)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str().filter(|s| !s.is_empty())
}

/// Numbers arrive either as JSON numbers or as numeric strings.
fn json_number(value: &JsonValue, key: &str) -> Option<f64> {
    let number = match value.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// Adapter for the mainland JSON API (`{code, data: [...]}`).
#[derive(Debug, Clone)]
pub struct CosmicApiAdapter {
    url: String,
    timeout: Duration,
}

impl CosmicApiAdapter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn parse_payload(
        body: &[u8],
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedRecord>, AdapterError> {
        let payload: JsonValue = serde_json::from_slice(body)?;
        let code = payload.get("code").and_then(JsonValue::as_i64);
        if code != Some(CN_SUCCESS_CODE) {
            return Err(AdapterError::Payload(format!(
                "status code {} (expected {CN_SUCCESS_CODE})",
                payload
                    .get("code")
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "<missing>".to_string())
            )));
        }
        let items = payload
            .get("data")
            .and_then(JsonValue::as_array)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| AdapterError::Payload("`data` is missing or empty".to_string()))?;

        let fallback = ctx.fallback_last_update();
        Ok(items
            .iter()
            .map(|item| Self::normalize_item(item, &fallback))
            .collect())
    }

    fn normalize_item(item: &JsonValue, fallback_last_update: &str) -> NormalizedRecord {
        let rate = json_number(item, "ProgressRate").unwrap_or(0.0).trunc();
        // Saturating cast: negative grades become 0.
        let level = json_number(item, "DevelopmentGrade").unwrap_or(0.0).trunc() as u32;
        NormalizedRecord {
            region: json_str(item, "area_name")
                .unwrap_or(CN_DEFAULT_REGION)
                .to_string(),
            server: json_str(item, "group_name")
                .unwrap_or(CN_DEFAULT_SERVER)
                .to_string(),
            dc: None,
            progress: clamp_progress(rate / 10.0),
            level,
            last_update: json_str(item, "data_time")
                .unwrap_or(fallback_last_update)
                .to_string(),
            source: SourceKind::Cn,
        }
    }
}

#[async_trait]
impl SourceAdapter for CosmicApiAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Cn
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let cache_buster = ctx.now.timestamp_millis().to_string();
        let resp = http
            .fetch_bytes(
                ctx.run_id,
                self.source().as_str(),
                &self.url,
                &[("t", cache_buster)],
                self.timeout,
            )
            .await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
        })
    }

    fn parse_page(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedRecord>, AdapterError> {
        Self::parse_payload(&page.body, ctx)
    }
}

/// Why a single report card was left out of the result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CardError {
    #[error("card has no server name")]
    MissingName,
    #[error("card for {0} has no grade level element")]
    MissingLevel(String),
    #[error("card for {server} has non-numeric grade level {text:?}")]
    InvalidLevel { server: String, text: String },
}

struct CardSelectors {
    card: Selector,
    name: Selector,
    gauge: Selector,
    level: Selector,
    dc_title: Selector,
}

impl CardSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            card: parse_selector(".cosmic__report__card")?,
            name: parse_selector(".cosmic__report__card__name p")?,
            gauge: parse_selector(".cosmic__report__status__progress__bar")?,
            level: parse_selector(".cosmic__report__grade__level p")?,
            dc_title: parse_selector(".cosmic__report__dc__title")?,
        })
    }
}

/// Step number of a `gauge-N` class token.
pub fn gauge_step(class_token: &str) -> Option<u32> {
    let rest = class_token.strip_prefix("gauge-")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Eighths of the gauge as a percentage with one decimal, capped at 100.
pub fn gauge_to_percent(step: u32) -> f64 {
    let percent = f64::from(step) / f64::from(GAUGE_STEPS) * 100.0;
    ((percent * 10.0).round() / 10.0).min(100.0)
}

/// Adapter for the Lodestone cosmic exploration report page.
#[derive(Debug, Clone)]
pub struct LodestoneReportAdapter {
    url: String,
    timeout: Duration,
    regions: RegionMap,
}

impl LodestoneReportAdapter {
    pub fn new(url: impl Into<String>, timeout: Duration, regions: RegionMap) -> Self {
        Self {
            url: url.into(),
            timeout,
            regions,
        }
    }

    pub fn parse_document(
        &self,
        html: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedRecord>, AdapterError> {
        let selectors = CardSelectors::new()?;
        let document = Html::parse_document(html);
        let last_update = ctx.fallback_last_update();

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for card in document.select(&selectors.card) {
            match self.parse_card(card, &selectors, &last_update) {
                Ok(record) => records.push(record),
                Err(err) => {
                    skipped += 1;
                    debug!(error = %err, "skipping report card");
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, parsed = records.len(), "skipped malformed report cards");
        }
        Ok(records)
    }

    fn parse_card(
        &self,
        card: ElementRef<'_>,
        selectors: &CardSelectors,
        last_update: &str,
    ) -> Result<NormalizedRecord, CardError> {
        let server = card
            .select(&selectors.name)
            .next()
            .and_then(|el| text_or_none(element_text(el)))
            .ok_or(CardError::MissingName)?;

        let progress = if has_class(card, "completed") {
            100.0
        } else {
            card.select(&selectors.gauge)
                .next()
                .and_then(|bar| bar.value().classes().find_map(gauge_step))
                .map(gauge_to_percent)
                .unwrap_or(0.0)
        };

        let level_el = card
            .select(&selectors.level)
            .next()
            .ok_or_else(|| CardError::MissingLevel(server.clone()))?;
        let level_text = element_text(level_el);
        let level = if level_text.is_empty() {
            0
        } else {
            level_text
                .parse::<u32>()
                .map_err(|_| CardError::InvalidLevel {
                    server: server.clone(),
                    text: level_text.clone(),
                })?
        };

        let dc = self.data_center_of(card, selectors);
        Ok(NormalizedRecord {
            region: self.regions.region_for(&dc).to_string(),
            server,
            dc: Some(dc),
            progress,
            level,
            last_update: last_update.to_string(),
            source: SourceKind::Na,
        })
    }

    /// Title of the enclosing data-center block, or of one inside the card.
    fn data_center_of(&self, card: ElementRef<'_>, selectors: &CardSelectors) -> String {
        card.ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| has_class(*el, "cosmic__report__dc"))
            .and_then(|block| block.select(&selectors.dc_title).next())
            .or_else(|| card.select(&selectors.dc_title).next())
            .map(element_text)
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceAdapter for LodestoneReportAdapter {
    fn source(&self) -> SourceKind {
        SourceKind::Na
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let resp = http
            .fetch_bytes(ctx.run_id, self.source().as_str(), &self.url, &[], self.timeout)
            .await?;
        Ok(FetchedPage {
            url: resp.final_url,
            body: resp.body,
        })
    }

    fn parse_page(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedRecord>, AdapterError> {
        let html = String::from_utf8_lossy(&page.body);
        self.parse_document(&html, ctx)
    }
}

pub fn cosmic_api_adapter() -> CosmicApiAdapter {
    CosmicApiAdapter::new(DEFAULT_CN_URL, DEFAULT_CN_TIMEOUT)
}

pub fn lodestone_report_adapter() -> LodestoneReportAdapter {
    LodestoneReportAdapter::new(DEFAULT_NA_URL, DEFAULT_NA_TIMEOUT, RegionMap::builtin())
}
