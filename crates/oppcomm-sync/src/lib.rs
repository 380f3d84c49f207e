//! Reconciliation orchestration: batch passes, single-record events and the poll loop.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oppcomm_client::{
    BackoffPolicy, CrmClient, CrmClientConfig, CrmError, PageRequest, RemoteStore,
    DEFAULT_BASE_URL,
};
use oppcomm_core::{build_update_payload, CommissionPolicy, Opportunity, Outcome};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppcomm-sync";

pub const DEFAULT_FIELD_KEY: &str = "loan_with_mipfunding_fee";
pub const DEFAULT_COMMISSION_RATE: f64 = 0.015;
pub const DEFAULT_STATUS: &str = "open";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GHL_ACCESS_TOKEN is missing from environment variables")]
    MissingToken,
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration, read once at startup.
#[derive(Clone)]
pub struct SyncConfig {
    pub access_token: String,
    pub commission_rate: f64,
    pub loan_amount_field_key: String,
    pub poll_interval: Duration,
    pub base_url: String,
    pub opportunity_status: String,
    pub http_timeout_secs: u64,
    pub page_limit: u32,
    pub max_pages: usize,
    pub port: u16,
    pub user_agent: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("access_token", &"<redacted>")
            .field("commission_rate", &self.commission_rate)
            .field("loan_amount_field_key", &self.loan_amount_field_key)
            .field("poll_interval", &self.poll_interval)
            .field("base_url", &self.base_url)
            .field("opportunity_status", &self.opportunity_status)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("page_limit", &self.page_limit)
            .field("max_pages", &self.max_pages)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

fn text_var(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
            value: raw,
        }),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let access_token = lookup("GHL_ACCESS_TOKEN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let commission_rate: f64 = parse_var(&lookup, "COMMISSION_RATE", DEFAULT_COMMISSION_RATE)?;
        if !commission_rate.is_finite() || commission_rate < 0.0 {
            return Err(ConfigError::Invalid {
                name: "COMMISSION_RATE",
                value: commission_rate.to_string(),
                reason: "must be a finite, non-negative fraction".into(),
            });
        }

        let max_pages: usize = parse_var(&lookup, "MAX_PAGES", 20)?;
        Ok(Self {
            access_token,
            commission_rate,
            loan_amount_field_key: text_var(&lookup, "LOAN_AMOUNT_FIELD_KEY", DEFAULT_FIELD_KEY),
            poll_interval: Duration::from_secs(parse_var(&lookup, "POLL_INTERVAL_SECONDS", 600)?),
            base_url: text_var(&lookup, "GHL_BASE_URL", DEFAULT_BASE_URL),
            opportunity_status: text_var(&lookup, "OPPORTUNITY_STATUS", DEFAULT_STATUS),
            http_timeout_secs: parse_var(&lookup, "HTTP_TIMEOUT_SECS", 20)?,
            page_limit: parse_var(&lookup, "PAGE_LIMIT", 100)?,
            max_pages: max_pages.max(1),
            port: parse_var(&lookup, "PORT", 5000)?,
            user_agent: text_var(&lookup, "OPPCOMM_USER_AGENT", "oppcomm/0.1"),
        })
    }

    pub fn policy(&self) -> CommissionPolicy {
        CommissionPolicy::new(self.commission_rate, self.loan_amount_field_key.clone())
    }

    pub fn client_config(&self) -> CrmClientConfig {
        CrmClientConfig {
            base_url: self.base_url.clone(),
            token: self.access_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            status: self.opportunity_status.clone(),
            page_limit: self.page_limit,
            max_pages: self.max_pages,
        }
    }
}

/// How pipelines are walked when listing records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub status: String,
    pub page_limit: u32,
    pub max_pages: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            status: DEFAULT_STATUS.to_string(),
            page_limit: 100,
            max_pages: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub updated: usize,
    pub errors: usize,
    pub skipped: usize,
    pub already_correct: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub scanned: usize,
    pub updated: usize,
    pub errors: usize,
    pub skipped: usize,
    pub already_correct: usize,
}

/// Single-record request, typically built from an inbound event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SingleRequest {
    pub opportunity_id: String,
    pub pipeline_id: Option<String>,
    pub override_amount: Option<JsonValue>,
}

impl SingleRequest {
    pub fn new(opportunity_id: impl Into<String>) -> Self {
        Self {
            opportunity_id: opportunity_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SingleOutcome {
    pub success: bool,
    pub message: String,
}

impl SingleOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub fn next_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Drives the reconciler against a remote store.
///
/// Records are processed one at a time; a failed write is counted and the
/// pass moves on.
pub struct ReconcileService {
    store: Arc<dyn RemoteStore>,
    policy: CommissionPolicy,
    scan: ScanOptions,
}

impl ReconcileService {
    pub fn new(store: Arc<dyn RemoteStore>, policy: CommissionPolicy) -> Self {
        Self {
            store,
            policy,
            scan: ScanOptions::default(),
        }
    }

    pub fn with_scan(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let client = CrmClient::new(config.client_config())?;
        match client.location_id() {
            Some(location_id) => info!(location_id, "scoping pipeline listing to token location"),
            None => debug!("no location id in token; pipeline listing is unscoped"),
        }
        Ok(Self::new(Arc::new(client), config.policy()).with_scan(config.scan_options()))
    }

    pub fn policy(&self) -> &CommissionPolicy {
        &self.policy
    }

    /// All records in `status` across every pipeline of the tenant.
    ///
    /// A pipeline whose listing fails is logged and skipped; failing to list
    /// the pipelines themselves fails the fetch.
    pub async fn fetch_opportunities(&self, status: &str) -> Result<Vec<Opportunity>> {
        let pipelines = self
            .store
            .list_pipelines()
            .await
            .context("listing pipelines")?;

        let mut opportunities = Vec::new();
        for pipeline in &pipelines {
            let mut page = PageRequest::first(self.scan.page_limit);
            for page_no in 1..=self.scan.max_pages {
                let listed = match self
                    .store
                    .list_opportunities(&pipeline.id, status, &page)
                    .await
                {
                    Ok(listed) => listed,
                    Err(err) => {
                        error!(pipeline_id = %pipeline.id, error = %err, "failed to fetch opportunities for pipeline");
                        break;
                    }
                };
                opportunities.extend(listed.opportunities.into_iter().map(|mut o| {
                    o.pipeline_id.get_or_insert_with(|| pipeline.id.clone());
                    o
                }));
                match listed.next {
                    Some(cursor) if page_no < self.scan.max_pages => page.cursor = Some(cursor),
                    Some(_) => {
                        warn!(pipeline_id = %pipeline.id, max_pages = self.scan.max_pages, "page limit reached; remaining records skipped this pass");
                        break;
                    }
                    None => break,
                }
            }
        }
        debug!(pipelines = pipelines.len(), opportunities = opportunities.len(), status, "fetched opportunities");
        Ok(opportunities)
    }

    async fn write_back(&self, opportunity: &Opportunity, pipeline_id: &str, target: f64) -> Result<(), CrmError> {
        let payload = build_update_payload(pipeline_id, &opportunity.id, target, Some(opportunity));
        self.store.update_opportunity(&payload).await?;
        info!(opportunity_id = %opportunity.id, pipeline_id, value = target, "updated opportunity value");
        Ok(())
    }

    /// Reconcile every record in `opportunities`, writing where needed.
    pub async fn process_opportunities(&self, opportunities: &[Opportunity]) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for opportunity in opportunities {
            match self.policy.reconcile(opportunity, None) {
                Outcome::Skipped(reason) => {
                    debug!(opportunity_id = %opportunity.id, %reason, "skipped");
                    counts.skipped += 1;
                }
                Outcome::AlreadyCorrect { .. } => counts.already_correct += 1,
                Outcome::NeedsUpdate { loan_amount, target } => {
                    info!(
                        opportunity_id = %opportunity.id,
                        loan_amount,
                        current = ?opportunity.current_value(),
                        target,
                        "commission out of date; updating"
                    );
                    let Some(pipeline_id) = opportunity.pipeline_id.as_deref() else {
                        error!(opportunity_id = %opportunity.id, "record has no pipeline id; cannot address update");
                        counts.errors += 1;
                        continue;
                    };
                    match self.write_back(opportunity, pipeline_id, target).await {
                        Ok(()) => counts.updated += 1,
                        Err(err) => {
                            error!(opportunity_id = %opportunity.id, error = %err, "failed to update opportunity");
                            counts.errors += 1;
                        }
                    }
                }
            }
        }
        counts
    }

    /// One poll pass: fetch everything in the configured status and reconcile it.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let status = self.scan.status.clone();

        async {
            let opportunities = self.fetch_opportunities(&status).await?;
            let counts = self.process_opportunities(&opportunities).await;
            let summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                status: status.clone(),
                scanned: opportunities.len(),
                updated: counts.updated,
                errors: counts.errors,
                skipped: counts.skipped,
                already_correct: counts.already_correct,
            };
            info!(
                scanned = summary.scanned,
                updated = summary.updated,
                errors = summary.errors,
                skipped = summary.skipped,
                already_correct = summary.already_correct,
                "sync pass complete"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(info_span!("sync_run", %run_id))
        .await
    }

    /// Locate one record: the pipeline hint is tried first, then every
    /// pipeline's records in the configured status.
    pub async fn find_opportunity(&self, opportunity_id: &str, pipeline_hint: Option<&str>) -> Result<Option<Opportunity>> {
        if let Some(pipeline_id) = pipeline_hint {
            match self.store.get_opportunity(pipeline_id, opportunity_id).await {
                Ok(Some(mut found)) => {
                    found.pipeline_id.get_or_insert_with(|| pipeline_id.to_string());
                    return Ok(Some(found));
                }
                Ok(None) => warn!(opportunity_id, pipeline_id, "not found in hinted pipeline"),
                Err(err) => error!(opportunity_id, pipeline_id, error = %err, "direct fetch failed"),
            }
        }

        info!(opportunity_id, "searching all pipelines for opportunity");
        let status = self.scan.status.clone();
        let all = self.fetch_opportunities(&status).await?;
        Ok(all.into_iter().find(|o| o.id == opportunity_id))
    }

    /// Reconcile one record. Never fails: every problem becomes an
    /// unsuccessful outcome with a message.
    pub async fn process_single(&self, request: SingleRequest) -> SingleOutcome {
        let opportunity_id = request.opportunity_id.clone();
        match self
            .process_single_inner(request)
            .instrument(info_span!("single_opportunity", %opportunity_id))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%opportunity_id, error = %format!("{err:#}"), "error processing single opportunity");
                SingleOutcome::failed(format!("Error: {err:#}"))
            }
        }
    }

    async fn process_single_inner(&self, request: SingleRequest) -> Result<SingleOutcome> {
        let id = request.opportunity_id.as_str();
        let Some(opportunity) = self.find_opportunity(id, request.pipeline_id.as_deref()).await? else {
            return Ok(SingleOutcome::failed(format!("Opportunity {id} not found.")));
        };

        let (loan_amount, target) = match self.policy.reconcile(&opportunity, request.override_amount.as_ref()) {
            Outcome::Skipped(reason) => return Ok(SingleOutcome::failed(format!("Skipped: {reason}"))),
            Outcome::AlreadyCorrect { .. } => {
                return Ok(SingleOutcome::ok("No update needed (Value already correct)."))
            }
            Outcome::NeedsUpdate { loan_amount, target } => (loan_amount, target),
        };

        let Some(pipeline_id) = opportunity.pipeline_id.clone().or(request.pipeline_id) else {
            return Ok(SingleOutcome::failed(format!(
                "Opportunity {id} has no pipeline id; cannot update."
            )));
        };
        info!(loan_amount, current = ?opportunity.current_value(), target, "commission out of date; updating");
        match self.write_back(&opportunity, &pipeline_id, target).await {
            Ok(()) => Ok(SingleOutcome::ok("Updated successfully.")),
            Err(err) => {
                error!(error = %err, "failed to update opportunity");
                Ok(SingleOutcome::failed("Failed to update API."))
            }
        }
    }

    /// Run passes until `shutdown` resolves or `max_cycles` passes have run.
    ///
    /// Each cycle sleeps for whatever is left of `interval` after the pass.
    /// A failed pass is logged and the loop carries on.
    pub async fn run_poll_loop<F>(&self, interval: Duration, max_cycles: Option<usize>, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut cycles = 0usize;
        info!(interval_secs = interval.as_secs(), "starting poll loop");
        loop {
            let started = Instant::now();
            match self.run_once().await {
                Ok(summary) => debug!(run_id = %summary.run_id, "poll pass finished"),
                Err(err) => error!(error = %format!("{err:#}"), "poll pass failed"),
            }
            cycles += 1;
            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }

            let sleep_for = next_sleep(interval, started.elapsed());
            debug!(sleep_secs = sleep_for.as_secs_f64(), "waiting for next pass");
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping poll loop");
                    break;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        cycles
    }
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oppcomm_client::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap;

    const KEY: &str = "loan_with_mipfunding_fee";

    fn opp(value: JsonValue) -> Opportunity {
        serde_json::from_value(value).expect("opportunity json")
    }

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "pip1",
            opp(json!({
                "id": "opp1", "pipelineId": "pip1", "status": "open",
                "monetaryValue": 500.0,
                "customFields": [{"id": KEY, "value": 100000}]
            })),
        );
        store.insert(
            "pip1",
            opp(json!({
                "id": "opp2", "pipelineId": "pip1", "status": "open",
                "monetaryValue": 2500.0,
                "customFields": [{"id": KEY, "value": 250000}]
            })),
        );
        store.insert(
            "pip1",
            opp(json!({
                "id": "opp3", "pipelineId": "pip1", "status": "open",
                "monetaryValue": 0,
                "customFields": []
            })),
        );
        store
    }

    fn service(store: Arc<MemoryStore>, rate: f64) -> ReconcileService {
        ReconcileService::new(store, CommissionPolicy::new(rate, KEY))
    }

    #[tokio::test]
    async fn batch_updates_only_stale_records() {
        let store = seeded_store();
        let svc = service(store.clone(), 0.01);

        let summary = svc.run_once().await.expect("pass");
        assert_eq!(summary.scanned, 3);
        assert_eq!((summary.updated, summary.errors), (1, 0));
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.already_correct, 1);

        let updates = store.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].pipeline_id, "pip1");
        assert_eq!(updates[0].opportunity_id, "opp1");
        assert_eq!(updates[0].monetary_value, 1000.0);
        assert_eq!(updates[0].status.as_deref(), Some("open"));
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let store = seeded_store();
        let svc = service(store.clone(), 0.01);
        svc.run_once().await.expect("first pass");
        let second = svc.run_once().await.expect("second pass");
        assert_eq!((second.updated, second.errors), (0, 0));
        assert_eq!(second.already_correct, 2);
        assert_eq!(store.updates().len(), 1);
    }

    #[tokio::test]
    async fn failed_write_is_counted_and_batch_continues() {
        let store = seeded_store();
        store.insert(
            "pip2",
            opp(json!({
                "id": "opp4", "status": "open",
                "customFields": [{"name": "Loan With MIP Funding Fee", "value": "$20,000"}]
            })),
        );
        store.fail_updates_for("opp1");
        let svc = service(store.clone(), 0.01);

        let summary = svc.run_once().await.expect("pass");
        assert_eq!((summary.updated, summary.errors), (1, 1));
        let updates = store.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].opportunity_id, "opp4");
        assert_eq!(updates[0].pipeline_id, "pip2");
        assert_eq!(updates[0].monetary_value, 200.0);
    }

    #[tokio::test]
    async fn record_without_pipeline_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(store.clone(), 0.01);
        let records = vec![opp(json!({
            "id": "loose", "customFields": [{"id": KEY, "value": 1000}]
        }))];
        let counts = svc.process_opportunities(&records).await;
        assert_eq!(counts, BatchCounts { updated: 0, errors: 1, skipped: 0, already_correct: 0 });
    }

    #[tokio::test]
    async fn failing_pipeline_is_skipped_but_pipeline_listing_failure_fails_the_pass() {
        let store = seeded_store();
        store.insert("pip2", opp(json!({"id": "x", "status": "open"})));
        store.fail_listing_for("pip1");
        let svc = service(store.clone(), 0.01);
        let listed = svc.fetch_opportunities("open").await.expect("fetch");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].pipeline_id.as_deref(), Some("pip2"));

        store.fail_pipeline_listing();
        assert!(svc.run_once().await.is_err());
    }

    #[tokio::test]
    async fn scan_follows_pages_up_to_the_cap() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store.insert("p", opp(json!({"id": format!("o{i}"), "status": "open"})));
        }
        let svc = service(store.clone(), 0.01).with_scan(ScanOptions {
            status: "open".into(),
            page_limit: 2,
            max_pages: 10,
        });
        assert_eq!(svc.fetch_opportunities("open").await.unwrap().len(), 5);

        let capped = service(store, 0.01).with_scan(ScanOptions {
            status: "open".into(),
            page_limit: 2,
            max_pages: 2,
        });
        assert_eq!(capped.fetch_opportunities("open").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn single_record_via_pipeline_hint() {
        let store = seeded_store();
        let svc = service(store.clone(), 0.01);
        let outcome = svc
            .process_single(SingleRequest {
                opportunity_id: "opp1".into(),
                pipeline_id: Some("pip1".into()),
                override_amount: None,
            })
            .await;
        assert_eq!(outcome, SingleOutcome::ok("Updated successfully."));
        assert_eq!(store.get_calls(), 1);
        assert_eq!(store.pipeline_list_calls(), 0);

        let again = svc
            .process_single(SingleRequest {
                opportunity_id: "opp1".into(),
                pipeline_id: Some("pip1".into()),
                override_amount: None,
            })
            .await;
        assert!(again.success);
        assert_eq!(again.message, "No update needed (Value already correct).");
    }

    #[tokio::test]
    async fn single_record_falls_back_to_scan() {
        let store = seeded_store();
        let svc = service(store.clone(), 0.01);
        let outcome = svc
            .process_single(SingleRequest {
                opportunity_id: "opp1".into(),
                pipeline_id: Some("wrong-pipeline".into()),
                override_amount: None,
            })
            .await;
        assert!(outcome.success);
        assert_eq!(store.pipeline_list_calls(), 1);
        assert_eq!(store.updates()[0].pipeline_id, "pip1");

        let without_hint = svc.process_single(SingleRequest::new("opp2")).await;
        assert!(without_hint.success);
    }

    #[tokio::test]
    async fn single_record_not_found_is_a_failure_not_a_panic() {
        let svc = service(seeded_store(), 0.01);
        let outcome = svc.process_single(SingleRequest::new("missing")).await;
        assert_eq!(outcome, SingleOutcome::failed("Opportunity missing not found."));
    }

    #[tokio::test]
    async fn single_record_skip_and_write_failure() {
        let store = seeded_store();
        store.fail_updates_for("opp1");
        let svc = service(store.clone(), 0.01);

        let skipped = svc.process_single(SingleRequest::new("opp3")).await;
        assert!(!skipped.success);
        assert!(skipped.message.starts_with("Skipped:"));

        let failed = svc.process_single(SingleRequest::new("opp1")).await;
        assert_eq!(failed, SingleOutcome::failed("Failed to update API."));
    }

    #[tokio::test]
    async fn single_record_scan_failure_becomes_error_outcome() {
        let store = seeded_store();
        store.fail_pipeline_listing();
        let svc = service(store, 0.01);
        let outcome = svc.process_single(SingleRequest::new("opp1")).await;
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("Error:"));
    }

    #[tokio::test]
    async fn override_amount_wins_over_record_field() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "pip1",
            opp(json!({
                "id": "opp9", "status": "open", "monetaryValue": 0,
                "customFields": [{"id": KEY, "value": 50000}]
            })),
        );
        let svc = service(store.clone(), 0.01);
        let outcome = svc
            .process_single(SingleRequest {
                opportunity_id: "opp9".into(),
                pipeline_id: Some("pip1".into()),
                override_amount: Some(json!("$200,000")),
            })
            .await;
        assert!(outcome.success);
        assert_eq!(store.updates()[0].monetary_value, 2000.0);
    }

    #[tokio::test]
    async fn poll_loop_runs_requested_cycles() {
        let store = seeded_store();
        let svc = service(store.clone(), 0.01);
        let cycles = svc
            .run_poll_loop(Duration::ZERO, Some(2), std::future::pending())
            .await;
        assert_eq!(cycles, 2);
        assert_eq!(store.pipeline_list_calls(), 2);
    }

    #[tokio::test]
    async fn poll_loop_stops_on_shutdown_during_sleep() {
        let store = seeded_store();
        store.fail_pipeline_listing();
        let svc = service(store.clone(), 0.01);
        let cycles = svc
            .run_poll_loop(Duration::from_secs(3600), None, async {})
            .await;
        assert_eq!(cycles, 1);
        assert_eq!(store.pipeline_list_calls(), 1);
    }

    #[test]
    fn sleep_is_interval_minus_elapsed() {
        assert_eq!(next_sleep(Duration::from_secs(600), Duration::from_secs(45)), Duration::from_secs(555));
        assert_eq!(next_sleep(Duration::from_secs(10), Duration::from_secs(45)), Duration::ZERO);
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn config_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[("GHL_ACCESS_TOKEN", "tok")])).unwrap();
        assert_eq!(config.commission_rate, 0.015);
        assert_eq!(config.loan_amount_field_key, DEFAULT_FIELD_KEY);
        assert_eq!(config.poll_interval, Duration::from_secs(600));
        assert_eq!(config.opportunity_status, "open");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.port, 5000);
        assert!(!format!("{config:?}").contains("tok\""));
    }

    #[test]
    fn config_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("GHL_ACCESS_TOKEN", "tok"),
            ("COMMISSION_RATE", "0.025"),
            ("LOAN_AMOUNT_FIELD_KEY", "Loan Amount"),
            ("POLL_INTERVAL_SECONDS", "60"),
            ("MAX_PAGES", "0"),
        ]))
        .unwrap();
        assert_eq!(config.commission_rate, 0.025);
        assert_eq!(config.policy().field_key.as_str(), "Loan Amount");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.max_pages, 1);
    }

    #[test]
    fn missing_token_is_fatal() {
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingToken)
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("GHL_ACCESS_TOKEN", "   ")])),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("GHL_ACCESS_TOKEN", "tok"),
            ("POLL_INTERVAL_SECONDS", "ten minutes"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "POLL_INTERVAL_SECONDS", .. }));

        let err = SyncConfig::from_lookup(lookup(&[
            ("GHL_ACCESS_TOKEN", "tok"),
            ("COMMISSION_RATE", "-0.5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "COMMISSION_RATE", .. }));
    }
}
