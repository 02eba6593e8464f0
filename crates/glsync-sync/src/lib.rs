//! Sync pipeline: concurrent multi-source fetch, normalization, first-seen
//! deduplication and reconciliation of the local document store, plus the
//! refresh scheduler that drives it.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use glsync_adapters::{request_url, AdapterError, FetchAdapter, GitlabAdapter};
use glsync_core::{normalize, CanonicalIssue, FileNameSanitizer, RawIssue, SlugSanitizer, Source, DEFAULT_GITLAB_URL};
use glsync_storage::{DocumentStore, FsDocumentStore, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod reconcile;
pub mod settings;
pub mod template;

pub use reconcile::{ReconcileOptions, ReconcileReport, Reconciler};
pub use settings::{load_settings, parse_settings, RefreshInterval, Settings, SourceSettings};
pub use template::{HandlebarsEngine, IssueTemplate, TemplateEngine, TemplateError, DEFAULT_TEMPLATE};

pub const CRATE_NAME: &str = "glsync-sync";

/// Delay before the startup refresh fires.
pub const STARTUP_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub settings_path: PathBuf,
    pub vault: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_concurrency: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            settings_path: std::env::var("GLSYNC_SETTINGS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./glsync.yaml")),
            vault: std::env::var("GLSYNC_VAULT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("GLSYNC_USER_AGENT")
                .unwrap_or_else(|_| "glsync/0.1".to_string()),
            http_timeout_secs: std::env::var("GLSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_concurrency: std::env::var("GLSYNC_HTTP_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
        }
    }

    pub fn load_settings(&self) -> Result<Settings> {
        load_settings(&self.settings_path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Fetching,
    Normalizing,
    Deduplicating,
    Reconciling,
}

/// A recoverable failure recorded during one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    SourceFetch {
        index: usize,
        url: String,
        error: String,
    },
    TemplateUnavailable {
        /// `None` when the built-in template itself failed.
        path: Option<PathBuf>,
        error: String,
    },
    FolderCreate {
        path: PathBuf,
        error: String,
    },
    PurgeListing {
        path: PathBuf,
        error: String,
    },
    DocumentRender {
        path: PathBuf,
        id: u64,
        error: String,
    },
    DocumentWrite {
        path: PathBuf,
        error: String,
    },
    DocumentDelete {
        path: PathBuf,
        error: String,
    },
}

impl Diagnostic {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceFetch { .. } => "source_fetch",
            Self::TemplateUnavailable { .. } => "template_unavailable",
            Self::FolderCreate { .. } => "folder_create",
            Self::PurgeListing { .. } => "purge_listing",
            Self::DocumentRender { .. } => "document_render",
            Self::DocumentWrite { .. } => "document_write",
            Self::DocumentDelete { .. } => "document_delete",
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceFetch { index, url, error } => {
                write!(f, "source #{index} ({url}) failed: {error}")
            }
            Self::TemplateUnavailable { path: Some(path), error } => write!(
                f,
                "template {} unavailable, using default: {error}",
                path.display()
            ),
            Self::TemplateUnavailable { path: None, error } => {
                write!(f, "default template unavailable: {error}")
            }
            Self::FolderCreate { path, error } => {
                write!(f, "could not create {}: {error}", path.display())
            }
            Self::PurgeListing { path, error } => {
                write!(f, "could not list {} for purge: {error}", path.display())
            }
            Self::DocumentRender { path, id, error } => {
                write!(f, "could not render issue {id} into {}: {error}", path.display())
            }
            Self::DocumentWrite { path, error } => {
                write!(f, "could not write {}: {error}", path.display())
            }
            Self::DocumentDelete { path, error } => {
                write!(f, "could not delete {}: {error}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub index: usize,
    pub url: String,
    pub error: String,
}

impl SourceFailure {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::SourceFetch {
            index: self.index,
            url: self.url.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("all {} sources failed", .failures.len())]
    AllSourcesFailed { failures: Vec<SourceFailure> },
    #[error("a sync run is already in progress")]
    RunInProgress,
}

/// Result of one source's fetch, captured rather than propagated.
#[derive(Debug)]
pub struct FetchOutcome {
    pub index: usize,
    pub url: String,
    pub result: Result<Vec<RawIssue>, AdapterError>,
}

/// Fetches every source concurrently. An empty list polls the personal
/// issues of the default instance.
pub async fn fetch_all(adapter: &dyn FetchAdapter, sources: &[Source]) -> Vec<FetchOutcome> {
    let fallback;
    let sources = if sources.is_empty() {
        fallback = [Source::personal(DEFAULT_GITLAB_URL)];
        &fallback[..]
    } else {
        sources
    };

    join_all(sources.iter().enumerate().map(|(index, source)| async move {
        let url = request_url(source);
        let result = adapter.fetch(&url, &source.token).await;
        FetchOutcome { index, url, result }
    }))
    .await
}

#[derive(Debug, Default)]
pub struct Aggregation {
    pub sources: usize,
    /// Normalized issues in source order, then response order.
    pub issues: Vec<CanonicalIssue>,
    pub failures: Vec<SourceFailure>,
}

impl Aggregation {
    pub fn all_failed(&self) -> bool {
        self.sources > 0 && self.failures.len() == self.sources
    }
}

/// Normalizes and concatenates successful batches; failed sources become
/// [`SourceFailure`]s.
pub fn aggregate(outcomes: Vec<FetchOutcome>, sanitizer: &dyn FileNameSanitizer) -> Aggregation {
    let mut aggregation = Aggregation {
        sources: outcomes.len(),
        ..Aggregation::default()
    };

    for outcome in outcomes {
        match outcome.result {
            Ok(batch) => {
                debug!(index = outcome.index, count = batch.len(), "source fetched");
                aggregation
                    .issues
                    .extend(batch.into_iter().map(|raw| normalize(raw, sanitizer)));
            }
            Err(err) => {
                let failure = SourceFailure {
                    index: outcome.index,
                    url: outcome.url,
                    error: err.to_string(),
                };
                warn!(kind = "source_fetch", "{}", failure.to_diagnostic());
                aggregation.failures.push(failure);
            }
        }
    }
    aggregation
}

/// Keeps the first issue seen for every id, preserving order.
pub fn dedupe(issues: Vec<CanonicalIssue>) -> Vec<CanonicalIssue> {
    let mut seen = HashSet::with_capacity(issues.len());
    issues
        .into_iter()
        .filter(|issue| {
            let first = seen.insert(issue.id);
            if !first {
                debug!(id = issue.id, "dropping duplicate issue");
            }
            first
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub sources: Vec<Source>,
    pub reconcile: ReconcileOptions,
}

impl SyncOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            sources: settings.resolve_sources(),
            reconcile: ReconcileOptions {
                output_dir: settings.output_dir.clone(),
                template_file: settings.template_file.clone(),
                purge: settings.purge_issues,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    /// [`FetchAdapter::name`] of the adapter that served the run.
    pub adapter: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub failed_sources: usize,
    pub fetched_issues: usize,
    pub unique_issues: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub used_default_template: bool,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct SyncPipeline {
    adapter: Arc<dyn FetchAdapter>,
    store: Arc<dyn DocumentStore>,
    engine: Arc<dyn TemplateEngine>,
    sanitizer: Arc<dyn FileNameSanitizer>,
    options: SyncOptions,
    running: Mutex<()>,
    state: watch::Sender<RunState>,
}

impl SyncPipeline {
    pub fn new(adapter: Arc<dyn FetchAdapter>, store: Arc<dyn DocumentStore>, options: SyncOptions) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            adapter,
            store,
            engine: Arc::new(HandlebarsEngine),
            sanitizer: Arc::new(SlugSanitizer),
            options,
            running: Mutex::new(()),
            state,
        }
    }

    pub fn with_template_engine(mut self, engine: Arc<dyn TemplateEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn FileNameSanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// One full pass. Overlapping calls on the same pipeline fail fast with
    /// [`SyncError::RunInProgress`].
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let Ok(_running) = self.running.try_lock() else {
            return Err(SyncError::RunInProgress);
        };
        let run_id = Uuid::new_v4();
        let result = self
            .run_locked(run_id)
            .instrument(info_span!("sync_run", %run_id, adapter = self.adapter.name()))
            .await;
        self.state.send_replace(RunState::Idle);
        result
    }

    async fn run_locked(&self, run_id: Uuid) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        info!(
            adapter = self.adapter.name(),
            sources = self.options.sources.len(),
            "sync run started"
        );

        self.state.send_replace(RunState::Fetching);
        let outcomes = fetch_all(self.adapter.as_ref(), &self.options.sources).await;

        self.state.send_replace(RunState::Normalizing);
        let aggregation = aggregate(outcomes, self.sanitizer.as_ref());
        if aggregation.all_failed() {
            warn!(sources = aggregation.sources, "every source failed, leaving documents untouched");
            return Err(SyncError::AllSourcesFailed {
                failures: aggregation.failures,
            });
        }

        self.state.send_replace(RunState::Deduplicating);
        let fetched_issues = aggregation.issues.len();
        let issues = dedupe(aggregation.issues);

        self.state.send_replace(RunState::Reconciling);
        let report = Reconciler::new(self.store.as_ref(), self.engine.as_ref(), &self.options.reconcile)
            .reconcile(&issues)
            .await;

        let mut diagnostics: Vec<Diagnostic> =
            aggregation.failures.iter().map(SourceFailure::to_diagnostic).collect();
        diagnostics.extend(report.diagnostics);

        let summary = SyncRunSummary {
            run_id,
            adapter: self.adapter.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            sources: aggregation.sources,
            failed_sources: aggregation.failures.len(),
            fetched_issues,
            unique_issues: issues.len(),
            created: report.created,
            updated: report.updated,
            deleted: report.deleted,
            used_default_template: report.used_default_template,
            diagnostics,
        };
        info!(
            unique_issues = summary.unique_issues,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            diagnostics = summary.diagnostics.len(),
            "sync run finished"
        );
        Ok(summary)
    }
}

/// Builds the production pipeline: GitLab over HTTP into a filesystem vault.
pub fn build_pipeline(config: &SyncConfig, settings: &Settings) -> Result<SyncPipeline> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        concurrency: config.http_concurrency,
        ..Default::default()
    })?;
    Ok(SyncPipeline::new(
        Arc::new(GitlabAdapter::new(http)),
        Arc::new(FsDocumentStore::new(config.vault.clone())),
        SyncOptions::from_settings(settings),
    ))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let settings = config.load_settings()?;
    let pipeline = build_pipeline(&config, &settings)?;
    Ok(pipeline.run_once().await?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub on_startup: bool,
    pub startup_delay: Duration,
    pub interval: RefreshInterval,
}

impl RefreshPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            on_startup: settings.refresh_on_startup,
            startup_delay: STARTUP_DELAY,
            interval: settings.interval_of_refresh,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.on_startup && self.interval.period().is_none()
    }
}

/// Scheduler with a one-shot startup job and a repeated refresh job, or
/// `None` when the policy schedules nothing. The caller starts it.
pub async fn build_scheduler(
    pipeline: Arc<SyncPipeline>,
    refresh: RefreshPolicy,
) -> Result<Option<JobScheduler>> {
    if refresh.is_idle() {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    if refresh.on_startup {
        let pipeline = pipeline.clone();
        let job = Job::new_one_shot_async(refresh.startup_delay, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move { run_scheduled(&pipeline, "startup").await })
        })
        .context("creating startup refresh job")?;
        sched.add(job).await.context("adding startup refresh job")?;
    }

    if let Some(period) = refresh.interval.period() {
        let job = Job::new_repeated_async(period, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move { run_scheduled(&pipeline, "interval").await })
        })
        .with_context(|| format!("creating refresh job every {}s", period.as_secs()))?;
        sched.add(job).await.context("adding refresh job")?;
    }

    Ok(Some(sched))
}

async fn run_scheduled(pipeline: &SyncPipeline, trigger: &'static str) {
    match pipeline.run_once().await {
        Ok(summary) => info!(
            trigger,
            run_id = %summary.run_id,
            diagnostics = summary.diagnostics.len(),
            "scheduled sync finished"
        ),
        Err(SyncError::RunInProgress) => debug!(trigger, "sync already running, skipping"),
        Err(err) => warn!(trigger, error = %err, "scheduled sync failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glsync_storage::FetchError;
    use serde_json::json;

    fn canonical(id: u64, title: &str) -> CanonicalIssue {
        normalize(RawIssue::new(id, title), &SlugSanitizer)
    }

    #[test]
    fn dedupe_keeps_first_seen_and_is_idempotent() {
        let issues = vec![
            canonical(1, "first"),
            canonical(2, "two"),
            canonical(1, "second copy"),
            canonical(3, "three"),
            canonical(2, "two again"),
        ];
        let once = dedupe(issues);
        let ids: Vec<_> = once.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(once[0].title, "first");
        assert_eq!(dedupe(once.clone()), once);
    }

    #[test]
    fn aggregate_isolates_failed_sources() {
        let outcomes = vec![
            FetchOutcome {
                index: 0,
                url: "https://a/api/v4/issues?".into(),
                result: Ok(vec![RawIssue::new(1, "Fix bug").with_references(json!("g/p#1"))]),
            },
            FetchOutcome {
                index: 1,
                url: "https://b/api/v4/issues?".into(),
                result: Err(AdapterError::Fetch(FetchError::HttpStatus {
                    status: 500,
                    url: "https://b/api/v4/issues?".into(),
                })),
            },
            FetchOutcome {
                index: 2,
                url: "https://c/api/v4/issues?".into(),
                result: Ok(vec![RawIssue::new(2, "Other"), RawIssue::new(3, "Third")]),
            },
        ];

        let aggregation = aggregate(outcomes, &SlugSanitizer);
        assert!(!aggregation.all_failed());
        let ids: Vec<_> = aggregation.issues.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(aggregation.issues[0].project, "g/p");
        assert_eq!(aggregation.failures.len(), 1);
        assert_eq!(aggregation.failures[0].index, 1);
        assert!(aggregation.failures[0].error.contains("500"));
    }

    #[test]
    fn all_failed_requires_every_source_to_fail() {
        let failed = |index| FetchOutcome {
            index,
            url: String::new(),
            result: Err(AdapterError::InvalidToken),
        };
        assert!(aggregate(vec![failed(0), failed(1)], &SlugSanitizer).all_failed());
        assert!(!aggregate(Vec::new(), &SlugSanitizer).all_failed());
    }

    #[test]
    fn diagnostics_serialize_with_kind_tag() {
        let diagnostic = Diagnostic::DocumentWrite {
            path: PathBuf::from("Gitlab Issues/a.md"),
            error: "denied".into(),
        };
        let value = serde_json::to_value(&diagnostic).unwrap();
        assert_eq!(value["kind"], "document_write");
        assert_eq!(diagnostic.kind(), "document_write");
        assert_eq!(diagnostic.to_string(), "could not write Gitlab Issues/a.md: denied");
    }

    #[test]
    fn refresh_policy_follows_settings() {
        let mut settings = Settings::default();
        let policy = RefreshPolicy::from_settings(&settings);
        assert!(policy.on_startup);
        assert_eq!(policy.startup_delay, STARTUP_DELAY);
        assert!(!policy.is_idle());

        settings.refresh_on_startup = false;
        settings.interval_of_refresh = RefreshInterval::Off;
        assert!(RefreshPolicy::from_settings(&settings).is_idle());
    }

    #[test]
    fn sync_options_carry_resolved_sources() {
        let settings = parse_settings("sources:\n  - scope: group:7\n  - scope: personal\npurge_issues: false\n").unwrap();
        let options = SyncOptions::from_settings(&settings);
        assert_eq!(options.sources.len(), 2);
        assert_eq!(options.sources[0].scope, glsync_core::Scope::Group("7".into()));
        assert!(!options.reconcile.purge);
        assert_eq!(options.reconcile.output_dir, PathBuf::from("Gitlab Issues"));
    }
}
