//! Reconciliation runs: fetch the remote catalog, diff it against the local
//! store and apply the difference.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use toolmirror_core::{
    CatalogError, FieldMapping, FieldWarning, LocalKeySet, ReconcilePlan, RemoteSnapshot,
    SkippedRecord,
};
use toolmirror_remote::{catalog_source, CatalogSource};
use toolmirror_storage::{
    BackoffPolicy, CatalogStore, CatalogTxn, HttpClientConfig, HttpFetcher, PgCatalogStore,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "toolmirror-sync";

pub const DEFAULT_CATALOG_URL: &str = "https://www.dockstore.org:8443/api/v1/tools";

/// Daily at 03:00, seconds-first as the scheduler expects.
pub const DEFAULT_SYNC_CRON: &str = "0 0 3 * * *";

/// Prepends a zero seconds field to classic 5-field expressions.
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub catalog_url: String,
    pub catalog_file: Option<PathBuf>,
    pub mapping_file: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub scheduler_enabled: bool,
    pub sync_crons: Vec<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost:5432/dockstore".to_string()),
            catalog_url: lookup("TOOLMIRROR_CATALOG_URL")
                .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
            catalog_file: lookup("TOOLMIRROR_CATALOG_FILE").map(PathBuf::from),
            mapping_file: lookup("TOOLMIRROR_MAPPING_FILE").map(PathBuf::from),
            reports_dir: lookup("TOOLMIRROR_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            user_agent: lookup("TOOLMIRROR_USER_AGENT")
                .unwrap_or_else(|| "toolmirror/0.1".to_string()),
            http_timeout_secs: lookup("TOOLMIRROR_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_max_retries: lookup("TOOLMIRROR_HTTP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            scheduler_enabled: lookup("TOOLMIRROR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_crons: lookup("TOOLMIRROR_SYNC_CRON")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(normalize_cron)
                        .collect::<Vec<_>>()
                })
                .filter(|crons| !crons.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_SYNC_CRON.to_string()]),
        }
    }

    pub fn load_mapping(&self) -> Result<FieldMapping> {
        let Some(path) = &self.mapping_file else {
            return Ok(FieldMapping::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        FieldMapping::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Cooperative stop signal, checked before each tool-level record is applied.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Compute and report the plan, then roll back.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    DryRun,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::DryRun => "dry-run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Tools,
    Versions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Delete,
    Insert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    pub collection: Collection,
    pub operation: Operation,
    pub key: String,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub tools_deleted: usize,
    pub versions_deleted: usize,
    pub tools_inserted: usize,
    pub versions_inserted: usize,
    pub failures: Vec<FailedOperation>,
    pub cancelled: bool,
}

impl ApplyOutcome {
    pub fn mutations(&self) -> usize {
        self.tools_deleted + self.versions_deleted + self.tools_inserted + self.versions_inserted
    }

    /// Keeps per-record rejections; anything else ends the batch.
    fn record(
        &mut self,
        collection: Collection,
        operation: Operation,
        err: CatalogError,
    ) -> Result<(), CatalogError> {
        match err {
            CatalogError::ApplyFailure { key, cause } => {
                warn!(?collection, ?operation, %key, %cause, "store rejected operation");
                self.failures.push(FailedOperation {
                    collection,
                    operation,
                    key,
                    cause,
                });
                Ok(())
            }
            fatal => Err(fatal),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCounts {
    pub tools: u64,
    pub versions: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCounts {
    pub tools_to_add: usize,
    pub tools_to_remove: usize,
    pub versions_to_add: usize,
    pub versions_to_remove: usize,
}

impl From<&ReconcilePlan> for PlanCounts {
    fn from(plan: &ReconcilePlan) -> Self {
        Self {
            tools_to_add: plan.tools.to_add.len(),
            tools_to_remove: plan.tools.to_remove.len(),
            versions_to_add: plan.versions.to_add.len(),
            versions_to_remove: plan.versions.to_remove.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub source: String,
    pub catalog_digest: String,
    pub remote: CollectionCounts,
    pub local_before: CollectionCounts,
    pub local_after: CollectionCounts,
    pub plan: PlanCounts,
    pub applied: ApplyOutcome,
    /// Remote version keys missing locally whose tool already existed.
    pub unapplied_version_adds: usize,
    pub skipped: Vec<SkippedRecord>,
    #[serde(default)]
    pub warnings: Vec<FieldWarning>,
    #[serde(default)]
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn tool_discrepancy(&self) -> i64 {
        self.local_after.tools as i64 - self.remote.tools as i64
    }

    pub fn version_discrepancy(&self) -> i64 {
        self.local_after.versions as i64 - self.remote.versions as i64
    }
}

/// Reads the tool and version keys currently stored.
pub async fn load_local_keys(txn: &mut dyn CatalogTxn) -> Result<LocalKeySet, CatalogError> {
    let tools = txn.tool_keys().await?;
    let versions = txn.version_keys().await?;
    Ok(LocalKeySet { tools, versions })
}

/// Deletes removed tools and versions, then inserts each new tool followed by
/// all of its versions. Rejections are collected; an unreachable store aborts.
pub async fn apply_plan(
    txn: &mut dyn CatalogTxn,
    snapshot: &RemoteSnapshot,
    plan: &ReconcilePlan,
    cancel: &CancellationFlag,
) -> Result<ApplyOutcome, CatalogError> {
    let mut outcome = ApplyOutcome::default();

    for key in &plan.tools.to_remove {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }
        match txn.delete_tool(key).await {
            Ok(true) => outcome.tools_deleted += 1,
            Ok(false) => debug!(%key, "tool already gone"),
            Err(err) => outcome.record(Collection::Tools, Operation::Delete, err.for_key(key))?,
        }
    }

    for key in &plan.versions.to_remove {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }
        match txn.delete_version(key).await {
            Ok(true) => outcome.versions_deleted += 1,
            Ok(false) => debug!(%key, "version already gone"),
            Err(err) => {
                outcome.record(Collection::Versions, Operation::Delete, err.for_key(key))?
            }
        }
    }

    let new_tools = snapshot
        .tools
        .iter()
        .filter(|tool| plan.tools.to_add.contains(&tool.id));
    for tool in new_tools {
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }
        if let Err(err) = txn.insert_tool(tool).await {
            // Versions only go in alongside their tool.
            outcome.record(Collection::Tools, Operation::Insert, err.for_key(&tool.id))?;
            continue;
        }
        outcome.tools_inserted += 1;

        for version in &tool.versions {
            match txn.insert_version(version).await {
                Ok(()) => outcome.versions_inserted += 1,
                Err(err) => outcome.record(
                    Collection::Versions,
                    Operation::Insert,
                    err.for_key(&version.id),
                )?,
            }
        }
    }

    Ok(outcome)
}

/// Version keys in the add-set that no new tool carries.
pub fn unapplied_version_adds(snapshot: &RemoteSnapshot, plan: &ReconcilePlan) -> usize {
    let carried: BTreeSet<&str> = snapshot
        .tools
        .iter()
        .filter(|tool| plan.tools.to_add.contains(&tool.id))
        .flat_map(|tool| tool.versions.iter().map(|v| v.id.as_str()))
        .collect();
    plan.versions
        .to_add
        .iter()
        .filter(|key| !carried.contains(key.as_str()))
        .count()
}

pub struct SyncPipeline {
    config: SyncConfig,
    mapping: FieldMapping,
    source: Box<dyn CatalogSource>,
    store: Arc<dyn CatalogStore>,
    cancel: CancellationFlag,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        mapping: FieldMapping,
        source: Box<dyn CatalogSource>,
        store: Arc<dyn CatalogStore>,
    ) -> Self {
        Self {
            config,
            mapping,
            source,
            store,
            cancel: CancellationFlag::default(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn CatalogStore> {
        Arc::clone(&self.store)
    }

    /// One full run followed by the on-disk report.
    pub async fn run_once(&self, options: RunOptions) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async {
            let mut summary = self.reconcile_once(run_id, options).await?;
            let reports_dir = self.write_reports(&summary).await?;
            summary.reports_dir = Some(reports_dir.display().to_string());
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Fetch, diff and apply without writing reports.
    pub async fn reconcile_once(
        &self,
        run_id: Uuid,
        options: RunOptions,
    ) -> Result<SyncRunSummary, CatalogError> {
        let started_at = Utc::now();

        let raw = self.source.fetch(run_id).await?;
        let snapshot = raw.into_snapshot(&self.mapping);
        for skipped in &snapshot.skipped {
            warn!(location = %skipped.location, reason = %skipped.reason, "skipping malformed record");
        }
        for warning in &snapshot.warnings {
            warn!(
                location = %warning.location,
                field = %warning.field,
                reason = %warning.reason,
                "unexpected field type"
            );
        }
        let remote = CollectionCounts {
            tools: snapshot.tools.len() as u64,
            versions: snapshot.version_count() as u64,
        };
        info!(
            tools = remote.tools,
            versions = remote.versions,
            skipped = snapshot.skipped.len(),
            warnings = snapshot.warnings.len(),
            "remote catalog decoded"
        );

        let mut txn = self.store.begin().await?;
        let local = load_local_keys(txn.as_mut()).await?;
        let local_before = CollectionCounts {
            tools: local.tools.len() as u64,
            versions: local.versions.len() as u64,
        };
        info!(
            tools = local_before.tools,
            versions = local_before.versions,
            "local catalog loaded"
        );

        let plan = ReconcilePlan::build(&snapshot, &local);
        let plan_counts = PlanCounts::from(&plan);
        info!(
            tools_to_add = plan_counts.tools_to_add,
            tools_to_remove = plan_counts.tools_to_remove,
            versions_to_add = plan_counts.versions_to_add,
            versions_to_remove = plan_counts.versions_to_remove,
            "reconcile plan computed"
        );

        let (status, applied, local_after) = if options.dry_run {
            drop(txn);
            (RunStatus::DryRun, ApplyOutcome::default(), local_before)
        } else {
            let applied = apply_plan(txn.as_mut(), &snapshot, &plan, &self.cancel).await?;
            let local_after = CollectionCounts {
                tools: txn.count_tools().await?,
                versions: txn.count_versions().await?,
            };
            txn.commit().await?;
            let status = if applied.cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            };
            (status, applied, local_after)
        };
        info!(
            status = status.as_str(),
            tools = local_after.tools,
            versions = local_after.versions,
            failures = applied.failures.len(),
            "local catalog after run"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            source: snapshot.source_url.clone(),
            catalog_digest: snapshot.digest.clone(),
            remote,
            local_before,
            local_after,
            plan: plan_counts,
            unapplied_version_adds: unapplied_version_adds(&snapshot, &plan),
            applied,
            skipped: snapshot.skipped,
            warnings: snapshot.warnings,
            reports_dir: None,
        })
    }

    async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        fs::write(reports_dir.join("sync_brief.md"), render_brief(summary))
            .await
            .context("writing sync_brief.md")?;

        Ok(reports_dir)
    }
}

fn render_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# toolmirror sync brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Status: {}", summary.status.as_str()),
        format!("- Source: {}", summary.source),
        format!("- Catalog digest: `{}`", summary.catalog_digest),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        String::new(),
        "## Counters".to_string(),
        String::new(),
        "| | tools | versions |".to_string(),
        "|---|---|---|".to_string(),
        format!("| remote | {} | {} |", summary.remote.tools, summary.remote.versions),
        format!(
            "| local before | {} | {} |",
            summary.local_before.tools, summary.local_before.versions
        ),
        format!(
            "| local after | {} | {} |",
            summary.local_after.tools, summary.local_after.versions
        ),
        format!(
            "| discrepancy | {} | {} |",
            summary.tool_discrepancy(),
            summary.version_discrepancy()
        ),
        String::new(),
        "## Plan".to_string(),
        String::new(),
        format!(
            "- tools: +{} / -{}",
            summary.plan.tools_to_add, summary.plan.tools_to_remove
        ),
        format!(
            "- versions: +{} / -{} (not applied: {})",
            summary.plan.versions_to_add,
            summary.plan.versions_to_remove,
            summary.unapplied_version_adds
        ),
    ];

    if !summary.skipped.is_empty() {
        lines.push(String::new());
        lines.push("## Skipped records".to_string());
        lines.push(String::new());
        for skipped in &summary.skipped {
            lines.push(format!("- `{}`: {}", skipped.location, skipped.reason));
        }
    }

    if !summary.warnings.is_empty() {
        lines.push(String::new());
        lines.push("## Field warnings".to_string());
        lines.push(String::new());
        for warning in &summary.warnings {
            lines.push(format!(
                "- `{}` `{}`: {}",
                warning.location, warning.field, warning.reason
            ));
        }
    }

    if !summary.applied.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Apply failures".to_string());
        lines.push(String::new());
        for failure in &summary.applied.failures {
            lines.push(format!(
                "- {:?} {:?} `{}`: {}",
                failure.operation, failure.collection, failure.key, failure.cause
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Connects the PostgreSQL store and the configured catalog source.
pub async fn pipeline_from_config(config: SyncConfig, ensure_schema: bool) -> Result<SyncPipeline> {
    let mapping = config.load_mapping()?;
    let store = PgCatalogStore::connect(&config.database_url, &mapping)
        .await
        .context("connecting to catalog store")?;
    if ensure_schema {
        store
            .ensure_schema()
            .await
            .context("ensuring catalog schema")?;
    }

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy {
            max_retries: config.http_max_retries,
            ..BackoffPolicy::default()
        },
    })?;
    let source = catalog_source(&config.catalog_url, config.catalog_file.as_deref(), http);
    Ok(SyncPipeline::new(config, mapping, source, Arc::new(store)))
}

/// Cron jobs that trigger `run_once`; `None` when scheduling is disabled.
/// A trigger that finds a run in progress is skipped.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));
    for cron in pipeline.config.sync_crons.clone() {
        let pipeline = Arc::clone(&pipeline);
        let gate = Arc::clone(&gate);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                let Ok(_running) = gate.try_lock() else {
                    warn!("previous sync still running; skipping trigger");
                    return;
                };
                match pipeline.run_once(RunOptions::default()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        status = summary.status.as_str(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Markdown overview of the newest `runs` reports under `reports_root`.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# toolmirror runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs) {
        let summary_path = dir.path().join("run_summary.json");
        let summary: SyncRunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- status: {}", summary.status.as_str()));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(format!(
            "- tools: {} remote / {} local (was {})",
            summary.remote.tools, summary.local_after.tools, summary.local_before.tools
        ));
        lines.push(format!(
            "- versions: {} remote / {} local (was {})",
            summary.remote.versions, summary.local_after.versions, summary.local_before.versions
        ));
        lines.push(format!(
            "- skipped records: {}, apply failures: {}",
            summary.skipped.len(),
            summary.applied.failures.len()
        ));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
