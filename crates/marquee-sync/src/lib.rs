//! Aggregation cycle: source fan-out, reconciliation against persisted state, scheduling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use marquee_adapters::{adapter_for_source, AdapterContext, SourceAdapter, REGISTERED_SOURCES};
use marquee_core::{is_present, ListingDraft, RawRecord, RecordKind, Review, Show};
use marquee_storage::{
    HttpClientConfig, HttpFetcher, PersistenceGateway, ProxyConfig, StoreError, DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marquee-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: RecordKind,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    /// Registry used when no sources file exists: one show source and one review aggregator.
    pub fn builtin() -> Self {
        let entry = |source_id: &str, display_name: &str, enabled: bool, kind: RecordKind| SourceConfig {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            enabled,
            kind,
            listing_url: None,
            notes: None,
        };
        Self {
            sources: vec![
                entry("london-theatre", "London Theatre", true, RecordKind::Show),
                entry("timeout", "Time Out London", true, RecordKind::Review),
                entry("guardian", "The Guardian Stage", false, RecordKind::Review),
                entry("london-box-office", "London Box Office", false, RecordKind::Show),
                entry("whats-on-london", "What's On London", false, RecordKind::Show),
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry yaml")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no source registry file; using built-in sources");
                Ok(Self::builtin())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Routing table over every listed source, enabled or not.
    pub fn kind_policy(&self) -> SourceKindPolicy {
        SourceKindPolicy::new(self.sources.iter().map(|s| (s.source_id.as_str(), s.kind)))
    }

    pub fn enabled_adapters(&self) -> Result<Vec<Box<dyn SourceAdapter>>> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                adapter_for_source(&s.source_id, s.listing_url.as_deref()).with_context(|| {
                    format!(
                        "no adapter registered for {} (known: {})",
                        s.source_id,
                        REGISTERED_SOURCES.join(", ")
                    )
                })
            })
            .collect()
    }
}

/// Static source-name → collection table. Unlisted sources feed shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceKindPolicy {
    routes: HashMap<String, RecordKind>,
}

impl SourceKindPolicy {
    pub fn new<'a>(routes: impl IntoIterator<Item = (&'a str, RecordKind)>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(source, kind)| (source.to_ascii_lowercase(), kind))
                .collect(),
        }
    }

    pub fn kind_for(&self, source_name: &str) -> RecordKind {
        self.routes
            .get(&source_name.to_ascii_lowercase())
            .copied()
            .unwrap_or(RecordKind::Show)
    }
}

impl Default for SourceKindPolicy {
    fn default() -> Self {
        Self::new([("timeout", RecordKind::Review), ("guardian", RecordKind::Review)])
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub sources_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_timeout_secs: u64,
    pub proxy: Option<ProxyConfig>,
    pub bind_addr: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let secs = |name: &str, default: u64| var(name).and_then(|v| v.parse().ok()).unwrap_or(default);
        Self {
            data_dir: var("MARQUEE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            sources_file: var("MARQUEE_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            scheduler_enabled: var("MARQUEE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("MARQUEE_SYNC_CRON").unwrap_or_else(|| "0 0 0 */2 * *".to_string()),
            user_agent: var("MARQUEE_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: secs("MARQUEE_HTTP_TIMEOUT_SECS", 20),
            source_timeout_secs: secs("MARQUEE_SOURCE_TIMEOUT_SECS", 60),
            proxy: var("MARQUEE_PROXY_URL").map(|url| ProxyConfig {
                url,
                username: var("MARQUEE_PROXY_USERNAME"),
                password: var("MARQUEE_PROXY_PASSWORD"),
                accept_invalid_certs: var("MARQUEE_PROXY_INSECURE")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(false),
            }),
            bind_addr: var("MARQUEE_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3001".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            proxy: self.proxy.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceError {
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub run_id: Uuid,
    pub shows: Vec<RawRecord>,
    pub reviews: Vec<RawRecord>,
    pub total_sources: usize,
    pub successful_sources: usize,
    pub errors: Vec<SourceError>,
}

/// Runs every adapter concurrently and routes their output by [`SourceKindPolicy`].
pub struct FetchOrchestrator {
    http: Arc<HttpFetcher>,
    policy: SourceKindPolicy,
    source_timeout: Duration,
}

impl FetchOrchestrator {
    pub fn new(http: Arc<HttpFetcher>, policy: SourceKindPolicy, source_timeout: Duration) -> Self {
        Self {
            http,
            policy,
            source_timeout,
        }
    }

    /// Waits for every source; a failing or timed-out source only adds an `errors` entry.
    pub async fn run_all(&self, adapters: &[Box<dyn SourceAdapter>], limit: Option<usize>) -> AggregateResult {
        let run_id = Uuid::new_v4();
        let outcomes = join_all(
            adapters
                .iter()
                .map(|adapter| self.fetch_one(adapter.as_ref(), run_id, limit)),
        )
        .await;

        let mut result = AggregateResult {
            run_id,
            shows: Vec::new(),
            reviews: Vec::new(),
            total_sources: adapters.len(),
            successful_sources: 0,
            errors: Vec::new(),
        };
        for (source, outcome) in outcomes {
            match outcome {
                Ok(records) => {
                    result.successful_sources += 1;
                    for record in records {
                        match record.kind {
                            RecordKind::Show => result.shows.push(record),
                            RecordKind::Review => result.reviews.push(record),
                        }
                    }
                }
                Err(message) => result.errors.push(SourceError {
                    source: source.to_string(),
                    message,
                }),
            }
        }

        info!(
            %run_id,
            total_sources = result.total_sources,
            successful_sources = result.successful_sources,
            shows = result.shows.len(),
            reviews = result.reviews.len(),
            errors = result.errors.len(),
            "source fan-out finished"
        );
        result
    }

    /// Runs a single adapter and classifies its records.
    pub async fn run_source(
        &self,
        adapter: &dyn SourceAdapter,
        limit: Option<usize>,
    ) -> Result<Vec<RawRecord>, String> {
        self.fetch_one(adapter, Uuid::new_v4(), limit).await.1
    }

    async fn fetch_one(
        &self,
        adapter: &dyn SourceAdapter,
        run_id: Uuid,
        limit: Option<usize>,
    ) -> (&'static str, Result<Vec<RawRecord>, String>) {
        let source = adapter.name();
        let ctx = AdapterContext {
            run_id,
            scraped_at: Utc::now(),
        };
        let outcome = match tokio::time::timeout(self.source_timeout, adapter.fetch(&self.http, &ctx, limit)).await {
            Ok(Ok(drafts)) => Ok(self.classify(source, drafts)),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("timed out after {}ms", self.source_timeout.as_millis())),
        };
        match &outcome {
            Ok(records) => info!(%run_id, source, records = records.len(), "source fetched"),
            Err(message) => warn!(%run_id, source, error = %message, "source failed"),
        }
        (source, outcome)
    }

    fn classify(&self, source: &str, drafts: Vec<ListingDraft>) -> Vec<RawRecord> {
        let kind = self.policy.kind_for(source);
        drafts
            .into_iter()
            .map(|draft| RawRecord::from_draft(draft, kind))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("record from {source_name} has a blank title")]
    BlankTitle { source_name: String },
    #[error("{kind} record {title:?} from {source_name} routed to the {expected} collection")]
    KindMismatch {
        source_name: String,
        title: String,
        kind: RecordKind,
        expected: RecordKind,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub linked: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub shows: Vec<Show>,
    pub reviews: Vec<Review>,
    pub show_stats: ReconcileStats,
    pub review_stats: ReconcileStats,
}

/// Folds fresh records into persisted state. Shows are reconciled to completion first so
/// review linking sees this run's show list.
pub fn reconcile(
    existing_shows: Vec<Show>,
    existing_reviews: Vec<Review>,
    new_shows: &[RawRecord],
    new_reviews: &[RawRecord],
) -> Reconciled {
    let (shows, show_stats) = reconcile_shows(existing_shows, new_shows);
    let (reviews, review_stats) = reconcile_reviews(existing_reviews, &shows, new_reviews);
    Reconciled {
        shows,
        reviews,
        show_stats,
        review_stats,
    }
}

fn matching_key(record: &RawRecord, expected: RecordKind) -> Result<String, ReconcileError> {
    if record.kind != expected {
        return Err(ReconcileError::KindMismatch {
            source_name: record.source_name.clone(),
            title: record.title.clone(),
            kind: record.kind,
            expected,
        });
    }
    let key = record.normalized_title();
    if key.is_empty() {
        return Err(ReconcileError::BlankTitle {
            source_name: record.source_name.clone(),
        });
    }
    Ok(key)
}

fn title_index<'a>(keys: impl Iterator<Item = &'a str>) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for (position, key) in keys.enumerate() {
        index.entry(key.to_string()).or_insert(position);
    }
    index
}

pub fn reconcile_shows(mut shows: Vec<Show>, incoming: &[RawRecord]) -> (Vec<Show>, ReconcileStats) {
    let mut stats = ReconcileStats::default();
    let mut index = title_index(shows.iter().map(|s| s.normalized_title.as_str()));

    for record in incoming {
        let key = match matching_key(record, RecordKind::Show) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "skipping show record");
                stats.skipped += 1;
                continue;
            }
        };
        match index.get(&key) {
            Some(&position) => {
                if merge_show(&mut shows[position], record) {
                    stats.updated += 1;
                } else {
                    stats.unchanged += 1;
                }
            }
            None => {
                index.insert(key, shows.len());
                shows.push(Show::from_record(record));
                stats.created += 1;
            }
        }
    }
    (shows, stats)
}

/// Applies `record` only when strictly fresher. Keeps `id`, and keeps a known image
/// when the fresher record has none.
fn merge_show(show: &mut Show, record: &RawRecord) -> bool {
    if record.scraped_at <= show.scraped_at {
        return false;
    }
    if is_present(&record.image_url) || !show.has_image() {
        show.image_url = record.image_url.clone();
    }
    show.normalized_title = record.normalized_title();
    show.title = record.title.clone();
    show.source_name = record.source_name.clone();
    show.scraped_at = record.scraped_at;
    show.full_page_url = record.full_page_url.clone();
    show.attributes = record.attributes.clone();
    true
}

pub fn reconcile_reviews(
    mut reviews: Vec<Review>,
    shows: &[Show],
    incoming: &[RawRecord],
) -> (Vec<Review>, ReconcileStats) {
    let mut stats = ReconcileStats::default();
    let show_positions = title_index(shows.iter().map(|s| s.normalized_title.as_str()));
    let mut index = title_index(reviews.iter().map(|r| r.normalized_title.as_str()));

    for record in incoming {
        let key = match matching_key(record, RecordKind::Review) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, "skipping review record");
                stats.skipped += 1;
                continue;
            }
        };
        let show = show_positions.get(&key).map(|&p| &shows[p]);

        match index.get(&key) {
            Some(&position) => {
                let review = &mut reviews[position];
                if record.scraped_at <= review.scraped_at {
                    stats.unchanged += 1;
                    continue;
                }
                overwrite_review(review, record);
                stats.linked += link_review(review, show) as usize;
                stats.updated += 1;
            }
            None => {
                let mut review = Review::from_record(record);
                stats.linked += link_review(&mut review, show) as usize;
                index.insert(key, reviews.len());
                reviews.push(review);
                stats.created += 1;
            }
        }
    }
    (reviews, stats)
}

fn overwrite_review(review: &mut Review, record: &RawRecord) {
    review.normalized_title = record.normalized_title();
    review.title = record.title.clone();
    review.source_name = record.source_name.clone();
    review.scraped_at = record.scraped_at;
    review.full_page_url = record.full_page_url.clone();
    review.image_url = record.image_url.clone();
    review.attributes = record.attributes.clone();
}

/// Shows are the canonical image source for the reviews that match them.
fn link_review(review: &mut Review, show: Option<&Show>) -> bool {
    review.show_id = show.map(|s| s.id);
    if let Some(show) = show.filter(|s| s.has_image()) {
        review.image_url = show.image_url.clone();
    }
    review.show_id.is_some()
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("an aggregation cycle is already running")]
    AlreadyRunning,
    #[error("persisting reconciled collections failed: {0}")]
    Persist(#[from] StoreError),
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("source {source_name} failed: {message}")]
    SourceFailed { source_name: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_sources: usize,
    pub successful_sources: usize,
    pub total_shows: usize,
    pub total_reviews: usize,
    pub errors: Vec<SourceError>,
    pub show_stats: ReconcileStats,
    pub review_stats: ReconcileStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub shows: Vec<Show>,
    pub reviews: Vec<Review>,
    pub summary: CycleSummary,
}

pub struct SyncPipeline {
    orchestrator: FetchOrchestrator,
    adapters: Vec<Box<dyn SourceAdapter>>,
    gateway: PersistenceGateway,
    run_guard: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        orchestrator: FetchOrchestrator,
        adapters: Vec<Box<dyn SourceAdapter>>,
        gateway: PersistenceGateway,
    ) -> Self {
        Self {
            orchestrator,
            adapters,
            gateway,
            run_guard: Mutex::new(()),
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let adapters = registry.enabled_adapters()?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let orchestrator = FetchOrchestrator::new(
            http,
            registry.kind_policy(),
            Duration::from_secs(config.source_timeout_secs),
        );
        Ok(Self::new(
            orchestrator,
            adapters,
            PersistenceGateway::json_files(config.data_dir.clone()),
        ))
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.gateway
    }

    /// Fetch, reconcile and persist once. Source failures are reported in the summary;
    /// only a failed write (or an overlapping run) fails the cycle.
    pub async fn run_aggregation_cycle(&self, limit: Option<usize>) -> Result<CycleReport, CycleError> {
        let _guard = self.run_guard.try_lock().map_err(|_| CycleError::AlreadyRunning)?;
        let started_at = Utc::now();

        let aggregate = self.orchestrator.run_all(&self.adapters, limit).await;
        let existing_shows = self.gateway.load_shows().await;
        let existing_reviews = self.gateway.load_reviews().await;

        let reconciled = reconcile(existing_shows, existing_reviews, &aggregate.shows, &aggregate.reviews);
        self.gateway
            .save_all(&reconciled.shows, &reconciled.reviews)
            .await?;

        let summary = CycleSummary {
            run_id: aggregate.run_id,
            started_at,
            finished_at: Utc::now(),
            total_sources: aggregate.total_sources,
            successful_sources: aggregate.successful_sources,
            total_shows: reconciled.shows.len(),
            total_reviews: reconciled.reviews.len(),
            errors: aggregate.errors,
            show_stats: reconciled.show_stats,
            review_stats: reconciled.review_stats,
        };
        info!(
            run_id = %summary.run_id,
            total_sources = summary.total_sources,
            successful_sources = summary.successful_sources,
            total_shows = summary.total_shows,
            total_reviews = summary.total_reviews,
            shows_created = summary.show_stats.created,
            shows_updated = summary.show_stats.updated,
            reviews_created = summary.review_stats.created,
            reviews_updated = summary.review_stats.updated,
            errors = summary.errors.len(),
            "aggregation cycle complete"
        );

        Ok(CycleReport {
            shows: reconciled.shows,
            reviews: reconciled.reviews,
            summary,
        })
    }

    /// Runs one source by name (case-insensitive), enabled or merely registered. Nothing is persisted.
    pub async fn run_source(&self, name: &str, limit: Option<usize>) -> Result<Vec<RawRecord>, CycleError> {
        let fallback;
        let adapter: &dyn SourceAdapter = match self
            .adapters
            .iter()
            .find(|a| a.name().eq_ignore_ascii_case(name))
        {
            Some(adapter) => adapter.as_ref(),
            None => {
                fallback = adapter_for_source(&name.to_ascii_lowercase(), None)
                    .ok_or_else(|| CycleError::UnknownSource(name.to_string()))?;
                fallback.as_ref()
            }
        };
        self.orchestrator
            .run_source(adapter, limit)
            .await
            .map_err(|message| CycleError::SourceFailed {
                source_name: adapter.name().to_string(),
                message,
            })
    }
}

/// Scheduler tick body: logs the outcome and never overlaps a running cycle.
pub async fn run_scheduled_cycle(pipeline: &SyncPipeline, limit: Option<usize>) {
    match pipeline.run_aggregation_cycle(limit).await {
        Ok(report) => info!(
            run_id = %report.summary.run_id,
            errors = report.summary.errors.len(),
            "scheduled aggregation finished"
        ),
        Err(CycleError::AlreadyRunning) => {
            warn!("previous aggregation cycle still running; skipping this tick")
        }
        Err(err) => error!(error = %err, "scheduled aggregation failed"),
    }
}

pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str, limit: Option<usize>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            run_scheduled_cycle(&pipeline, limit).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(config: &SyncConfig, pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, &config.sync_cron, None).await.map(Some)
}

pub async fn run_sync_once_from_env(limit: Option<usize>) -> Result<CycleReport> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config).await?;
    pipeline
        .run_aggregation_cycle(limit)
        .await
        .context("running aggregation cycle")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use marquee_adapters::AdapterError;
    use marquee_core::Attributes;
    use marquee_storage::MemoryStore;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn record(kind: RecordKind, title: &str, scraped_at: DateTime<Utc>) -> RawRecord {
        RawRecord {
            title: title.to_string(),
            source_name: match kind {
                RecordKind::Show => "london-theatre".to_string(),
                RecordKind::Review => "timeout".to_string(),
            },
            kind,
            scraped_at,
            full_page_url: None,
            image_url: None,
            attributes: Attributes::new(),
        }
    }

    fn show_record(title: &str, scraped_at: DateTime<Utc>) -> RawRecord {
        record(RecordKind::Show, title, scraped_at)
    }

    fn review_record(title: &str, scraped_at: DateTime<Utc>) -> RawRecord {
        record(RecordKind::Review, title, scraped_at)
    }

    fn hamlet_show() -> Show {
        let mut show = Show::from_record(&show_record("Hamlet", at(0)));
        show.image_url = Some("h.jpg".to_string());
        show
    }

    struct StaticAdapter {
        name: &'static str,
        titles: Vec<&'static str>,
    }

    #[async_trait]
    impl SourceAdapter for StaticAdapter {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            ctx: &AdapterContext,
            limit: Option<usize>,
        ) -> Result<Vec<ListingDraft>, AdapterError> {
            Ok(self
                .titles
                .iter()
                .take(limit.unwrap_or(usize::MAX))
                .map(|t| ListingDraft::new(self.name, *t, ctx.scraped_at))
                .collect())
        }
    }

    struct FailingAdapter(&'static str);

    #[async_trait]
    impl SourceAdapter for FailingAdapter {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            _limit: Option<usize>,
        ) -> Result<Vec<ListingDraft>, AdapterError> {
            Err(AdapterError::Message("proxy authentication required".to_string()))
        }
    }

    struct SlowAdapter {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl SourceAdapter for SlowAdapter {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            ctx: &AdapterContext,
            _limit: Option<usize>,
        ) -> Result<Vec<ListingDraft>, AdapterError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![ListingDraft::new(self.name, "Slow Show", ctx.scraped_at)])
        }
    }

    fn orchestrator(source_timeout: Duration) -> FetchOrchestrator {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        FetchOrchestrator::new(http, SourceKindPolicy::default(), source_timeout)
    }

    fn pipeline(adapters: Vec<Box<dyn SourceAdapter>>, store: Arc<MemoryStore>) -> SyncPipeline {
        SyncPipeline::new(
            orchestrator(Duration::from_secs(5)),
            adapters,
            PersistenceGateway::new(store),
        )
    }

    #[test]
    fn kind_policy_routes_review_aggregators_and_defaults_to_shows() {
        let policy = SourceKindPolicy::default();
        assert_eq!(policy.kind_for("timeout"), RecordKind::Review);
        assert_eq!(policy.kind_for("TimeOut"), RecordKind::Review);
        assert_eq!(policy.kind_for("london-theatre"), RecordKind::Show);
        assert_eq!(policy.kind_for("never-heard-of-it"), RecordKind::Show);
    }

    #[test]
    fn registry_yaml_drives_policy_and_enabled_adapters() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: london-theatre
    display_name: London Theatre
    enabled: true
    kind: review
  - source_id: guardian
    display_name: Guardian
    enabled: false
    kind: review
"#,
        )
        .unwrap();

        let policy = registry.kind_policy();
        assert_eq!(policy.kind_for("london-theatre"), RecordKind::Review);
        assert_eq!(policy.kind_for("timeout"), RecordKind::Show);
        let adapters = registry.enabled_adapters().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].name(), "london-theatre");
    }

    #[test]
    fn registry_rejects_unknown_enabled_sources() {
        let mut registry = SourceRegistry::builtin();
        registry.sources[0].source_id = "britishmuseum".to_string();
        assert!(registry.enabled_adapters().is_err());
    }

    #[test]
    fn builtin_registry_enables_show_and_review_sources() {
        let registry = SourceRegistry::builtin();
        let names: Vec<_> = registry
            .enabled_adapters()
            .unwrap()
            .iter()
            .map(|a| a.name())
            .collect();
        assert_eq!(names, vec!["london-theatre", "timeout"]);
        assert_eq!(registry.kind_policy().kind_for("guardian"), RecordKind::Review);
    }

    #[tokio::test]
    async fn fan_out_isolates_failures_and_routes_by_source() {
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(StaticAdapter {
                name: "london-theatre",
                titles: vec!["Hamlet", "Cats"],
            }),
            Box::new(FailingAdapter("guardian")),
            Box::new(StaticAdapter {
                name: "timeout",
                titles: vec!["Hamlet"],
            }),
        ];
        let result = orchestrator(Duration::from_secs(5)).run_all(&adapters, None).await;

        assert_eq!(result.total_sources, 3);
        assert_eq!(result.successful_sources, 2);
        assert_eq!(result.shows.len(), 2);
        assert_eq!(result.reviews.len(), 1);
        assert!(result.reviews.iter().all(|r| r.kind == RecordKind::Review));
        assert_eq!(
            result.errors,
            vec![SourceError {
                source: "guardian".to_string(),
                message: "proxy authentication required".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn timed_out_source_becomes_one_error_entry() {
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(SlowAdapter {
                name: "whats-on-london",
                delay: Duration::from_secs(30),
            }),
            Box::new(StaticAdapter {
                name: "london-theatre",
                titles: vec!["Hamlet", "Cats", "Wicked"],
            }),
        ];
        let result = orchestrator(Duration::from_millis(50)).run_all(&adapters, None).await;

        assert_eq!(result.successful_sources, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].source, "whats-on-london");
        assert!(result.errors[0].message.contains("timed out"));
        assert_eq!(result.shows.len(), 3);
    }

    #[tokio::test]
    async fn slow_sources_are_awaited_concurrently() {
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(SlowAdapter {
                name: "london-theatre",
                delay: Duration::from_millis(300),
            }),
            Box::new(SlowAdapter {
                name: "london-box-office",
                delay: Duration::from_millis(300),
            }),
        ];
        let started = tokio::time::Instant::now();
        let result = orchestrator(Duration::from_millis(450)).run_all(&adapters, None).await;

        assert_eq!(result.successful_sources, 2);
        assert!(result.errors.is_empty());
        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn limit_is_forwarded_to_every_adapter() {
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(StaticAdapter {
            name: "london-theatre",
            titles: vec!["Hamlet", "Cats", "Wicked"],
        })];
        let result = orchestrator(Duration::from_secs(5)).run_all(&adapters, Some(2)).await;
        assert_eq!(result.shows.len(), 2);
    }

    #[test]
    fn fresher_show_keeps_id_and_known_image() {
        let existing = hamlet_show();
        let mut incoming = show_record("HAMLET ", at(1));
        incoming
            .attributes
            .insert("venue".to_string(), "Globe".to_string());

        let (shows, stats) = reconcile_shows(vec![existing.clone()], &[incoming]);

        assert_eq!(shows.len(), 1);
        assert_eq!(shows[0].id, existing.id);
        assert_eq!(shows[0].image_url.as_deref(), Some("h.jpg"));
        assert_eq!(shows[0].attribute("venue"), Some("Globe"));
        assert_eq!(shows[0].scraped_at, at(1));
        assert_eq!(stats.updated, 1);
    }

    #[test]
    fn fresher_image_replaces_old_one_and_blank_image_does_not() {
        let existing = hamlet_show();
        let mut with_image = show_record("Hamlet", at(1));
        with_image.image_url = Some("new.jpg".to_string());
        let mut blank_image = show_record("Hamlet", at(2));
        blank_image.image_url = Some("  ".to_string());

        let (shows, _) = reconcile_shows(vec![existing], &[with_image, blank_image]);
        assert_eq!(shows[0].image_url.as_deref(), Some("new.jpg"));
        assert_eq!(shows[0].scraped_at, at(2));
    }

    #[test]
    fn stale_or_equal_records_never_overwrite() {
        let mut existing = hamlet_show();
        existing.scraped_at = at(5);
        let mut older = show_record("Hamlet", at(4));
        older.image_url = Some("old.jpg".to_string());
        let mut same = show_record("hamlet", at(5));
        same.attributes.insert("price".to_string(), "£10".to_string());

        let (shows, stats) = reconcile_shows(vec![existing.clone()], &[older, same]);
        assert_eq!(shows, vec![existing]);
        assert_eq!(stats.unchanged, 2);
        assert_eq!(stats.updated, 0);
    }

    #[test]
    fn new_titles_are_appended_and_nothing_is_dropped() {
        let existing = vec![hamlet_show(), Show::from_record(&show_record("Cats", at(0)))];
        let incoming = [
            show_record("Wicked", at(1)),
            show_record("Hamlet (2024)", at(1)),
            show_record("wicked", at(1)),
        ];

        let (shows, stats) = reconcile_shows(existing.clone(), &incoming);
        let titles: Vec<_> = shows.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Hamlet", "Cats", "Wicked", "Hamlet (2024)"]);
        assert_eq!(shows[0].id, existing[0].id);
        assert_eq!(shows[1].id, existing[1].id);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn duplicate_titles_in_one_batch_keep_the_freshest() {
        let incoming = [show_record("Cats", at(1)), show_record(" CATS", at(3)), show_record("cats", at(2))];
        let (shows, stats) = reconcile_shows(Vec::new(), &incoming);

        assert_eq!(shows.len(), 1);
        assert_eq!(shows[0].title, " CATS");
        assert_eq!(shows[0].normalized_title, "cats");
        assert_eq!(stats.created, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.unchanged, 1);
    }

    #[test]
    fn unreconcilable_records_are_skipped_without_losing_peers() {
        let incoming = [
            show_record("   ", at(1)),
            review_record("Misrouted", at(1)),
            show_record("Matilda", at(1)),
        ];
        let (shows, stats) = reconcile_shows(Vec::new(), &incoming);

        assert_eq!(shows.len(), 1);
        assert_eq!(shows[0].title, "Matilda");
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn new_review_links_to_reconciled_show_and_borrows_its_image() {
        let shows = vec![hamlet_show()];
        let (reviews, stats) = reconcile_reviews(Vec::new(), &shows, &[review_record("Hamlet", at(2))]);

        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].show_id, Some(shows[0].id));
        assert_eq!(reviews[0].image_url.as_deref(), Some("h.jpg"));
        assert_eq!(stats.created, 1);
        assert_eq!(stats.linked, 1);
    }

    #[test]
    fn unmatched_review_keeps_null_show_id_and_own_image() {
        let mut incoming = review_record("The Mousetrap", at(2));
        incoming.image_url = Some("mouse.jpg".to_string());
        let (reviews, stats) = reconcile_reviews(Vec::new(), &[hamlet_show()], &[incoming]);

        assert_eq!(reviews[0].show_id, None);
        assert_eq!(reviews[0].image_url.as_deref(), Some("mouse.jpg"));
        assert_eq!(stats.linked, 0);
    }

    #[test]
    fn review_linking_observes_shows_created_in_the_same_run() {
        let reconciled = reconcile(
            Vec::new(),
            Vec::new(),
            &[show_record("Wicked", at(1))],
            &[review_record("WICKED", at(1))],
        );
        assert_eq!(reconciled.reviews[0].show_id, Some(reconciled.shows[0].id));
    }

    #[test]
    fn fresher_review_is_relinked_but_stale_one_is_not() {
        let old_review = Review::from_record(&review_record("Hamlet", at(1)));
        let shows = vec![hamlet_show()];

        let (unchanged, stats) =
            reconcile_reviews(vec![old_review.clone()], &shows, &[review_record("Hamlet", at(1))]);
        assert_eq!(unchanged, vec![old_review.clone()]);
        assert_eq!(stats.unchanged, 1);

        let (relinked, stats) = reconcile_reviews(vec![old_review.clone()], &shows, &[review_record("Hamlet", at(3))]);
        assert_eq!(relinked[0].id, old_review.id);
        assert_eq!(relinked[0].show_id, Some(shows[0].id));
        assert_eq!(relinked[0].image_url.as_deref(), Some("h.jpg"));
        assert_eq!(relinked[0].scraped_at, at(3));
        assert_eq!(stats.updated, 1);
    }

    #[test]
    fn fresher_review_without_a_matching_show_drops_its_link() {
        let shows = vec![hamlet_show()];
        let (linked, _) = reconcile_reviews(Vec::new(), &shows, &[review_record("Hamlet", at(1))]);
        assert_eq!(linked[0].show_id, Some(shows[0].id));
        assert_eq!(linked[0].image_url.as_deref(), Some("h.jpg"));

        let mut fresher = review_record("Hamlet", at(2));
        fresher.image_url = Some("own.jpg".to_string());
        let (reviews, stats) = reconcile_reviews(linked.clone(), &[], &[fresher]);

        assert_eq!(reviews[0].id, linked[0].id);
        assert_eq!(reviews[0].show_id, None);
        assert_eq!(reviews[0].image_url.as_deref(), Some("own.jpg"));
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.linked, 0);
    }

    #[test]
    fn reviews_without_incoming_records_are_left_alone() {
        let untouched = Review::from_record(&review_record("Cats", at(1)));
        let (reviews, _) = reconcile_reviews(vec![untouched.clone()], &[hamlet_show()], &[]);
        assert_eq!(reviews, vec![untouched]);
    }

    #[test]
    fn reconciling_the_same_batch_twice_is_idempotent() {
        let shows_in = [show_record("Hamlet", at(1)), show_record("Cats", at(1))];
        let reviews_in = [review_record("Hamlet", at(1)), review_record("Les Mis", at(1))];
        let start_shows = vec![hamlet_show()];

        let once = reconcile(start_shows, Vec::new(), &shows_in, &reviews_in);
        let twice = reconcile(once.shows.clone(), once.reviews.clone(), &shows_in, &reviews_in);

        assert_eq!(twice.shows, once.shows);
        assert_eq!(twice.reviews, once.reviews);
        assert_eq!(twice.show_stats.created + twice.show_stats.updated, 0);
        assert_eq!(twice.review_stats.created + twice.review_stats.updated, 0);
    }

    #[tokio::test]
    async fn cycle_persists_and_keeps_identity_across_runs() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            vec![
                Box::new(StaticAdapter {
                    name: "london-theatre",
                    titles: vec!["Hamlet", "Cats"],
                }),
                Box::new(StaticAdapter {
                    name: "timeout",
                    titles: vec!["hamlet"],
                }),
                Box::new(FailingAdapter("guardian")),
            ],
            store.clone(),
        );

        let first = pipeline.run_aggregation_cycle(None).await.unwrap();
        assert_eq!(first.summary.total_sources, 3);
        assert_eq!(first.summary.successful_sources, 2);
        assert_eq!(first.summary.total_shows, 2);
        assert_eq!(first.summary.total_reviews, 1);
        assert_eq!(first.summary.errors.len(), 1);
        assert_eq!(first.reviews[0].show_id, Some(first.shows[0].id));

        let second = pipeline.run_aggregation_cycle(None).await.unwrap();
        let first_ids: Vec<_> = first.shows.iter().map(|s| s.id).collect();
        let second_ids: Vec<_> = second.shows.iter().map(|s| s.id).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(second.reviews[0].id, first.reviews[0].id);
        assert_eq!(second.summary.show_stats.updated, 2);

        let persisted = pipeline.gateway().load_shows().await;
        assert_eq!(persisted, second.shows);
    }

    #[tokio::test]
    async fn failing_sources_do_not_erase_known_entities() {
        let store = Arc::new(MemoryStore::new());
        let seed = vec![hamlet_show()];
        store
            .put_raw(marquee_storage::Collection::Shows, serde_json::to_vec(&seed).unwrap())
            .await;
        let pipeline = pipeline(vec![Box::new(FailingAdapter("london-theatre"))], store);

        let report = pipeline.run_aggregation_cycle(None).await.unwrap();
        assert_eq!(report.shows, seed);
        assert_eq!(report.summary.successful_sources, 0);
        assert_eq!(report.summary.errors.len(), 1);
    }

    #[tokio::test]
    async fn write_failure_fails_the_cycle() {
        let pipeline = pipeline(
            vec![Box::new(StaticAdapter {
                name: "london-theatre",
                titles: vec!["Hamlet"],
            })],
            Arc::new(MemoryStore::rejecting_writes()),
        );
        let err = pipeline.run_aggregation_cycle(None).await.unwrap_err();
        assert!(matches!(err, CycleError::Persist(_)));
    }

    #[tokio::test]
    async fn overlapping_cycles_are_rejected() {
        let pipeline = pipeline(
            vec![Box::new(SlowAdapter {
                name: "london-theatre",
                delay: Duration::from_millis(200),
            })],
            Arc::new(MemoryStore::new()),
        );

        let (first, second) = tokio::join!(
            pipeline.run_aggregation_cycle(None),
            pipeline.run_aggregation_cycle(None)
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(CycleError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn single_source_runs_by_name_without_persisting() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(
            vec![Box::new(StaticAdapter {
                name: "timeout",
                titles: vec!["Hamlet", "Cats"],
            })],
            store.clone(),
        );

        let records = pipeline.run_source("TimeOut", Some(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordKind::Review);
        assert!(pipeline.gateway().load_reviews().await.is_empty());

        let err = pipeline.run_source("britishmuseum", None).await.unwrap_err();
        assert!(matches!(err, CycleError::UnknownSource(_)));
    }
}
