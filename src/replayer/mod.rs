//! Replay engine: materialize and execute HTTP exchanges, committing
//! responses and anomalies to the store.
//!
//! Two execution modes exist. Single-test-case replays the baseline once
//! and the mutant once, strictly paired, on a fresh cookie jar.
//! Whole-flow first replays every baseline in ordinal order to establish
//! the baseline transcript, then replays each test case with its
//! preceding baseline prefix re-run for context, splicing the mutated
//! request in at the correct ordinal.
//!
//! Concurrency model: one bounded worker pool per execution
//! (`concurrent_requests` permits around every outbound request). Test
//! cases that target the same ordinal run serially with each other but in
//! parallel with other ordinals. A per-execution token bucket and an
//! optional inter-request delay pace the traffic. Transport errors retry
//! with exponential backoff and jitter; HTTP statuses are data and never
//! retry. Every transport failure — baseline transcript entries included
//! — counts against the failure threshold, and crossing it stops the
//! execution as `failed`. Cancellation is cooperative at request
//! boundaries: in-flight requests complete, no partial pair is committed
//! afterwards.

mod limiter;

pub use limiter::RateLimiter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use rand::RngExt;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, Semaphore};
use tracing::instrument;
use uuid::Uuid;

use crate::analyzer::{self, DetectionCatalog};
use crate::config::AppConfig;
use crate::events::{EventEmitter, ProgressEvent};
use crate::model::{
    Anomaly, ExecutionState, Flow, RecordedRequest, ResponseRecord, TestCase, Transform,
};
use crate::mutator::{MaterializedRequest, materialize};
use crate::store::{SharedStore, Store, StoreError};
use crate::types::{ErrorKind, ExecutionStatus, OwnerKind};

/// Errors from replay orchestration. Transport failures are not errors:
/// they are recorded as responses with `error_kind` set.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ReplayerError {
    #[error("flow not found: {id}")]
    #[diagnostic(code(flowprobe::replayer::flow_not_found))]
    FlowNotFound { id: Uuid },

    #[error("test case not found: {id}")]
    #[diagnostic(code(flowprobe::replayer::test_case_not_found))]
    TestCaseNotFound { id: Uuid },

    #[error("request not found: {id}")]
    #[diagnostic(code(flowprobe::replayer::request_not_found))]
    RequestNotFound { id: Uuid },

    #[error("execution not found: {id}")]
    #[diagnostic(code(flowprobe::replayer::execution_not_found))]
    ExecutionNotFound { id: Uuid },

    #[error("http client error: {message}")]
    #[diagnostic(code(flowprobe::replayer::client))]
    Client { message: String },

    #[error(transparent)]
    #[diagnostic(code(flowprobe::replayer::store))]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ReplayerError>;

/// Replay tuning, extracted from the process configuration.
#[derive(Clone, Debug)]
pub struct ReplaySettings {
    pub concurrent_requests: usize,
    pub rate_limit_rps: f64,
    pub inter_request_delay: Duration,
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    /// Execution aborts once failed/total exceeds this fraction.
    pub failure_threshold: f64,
    pub max_body_bytes: usize,
}

impl From<&AppConfig> for ReplaySettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrent_requests: config.max_concurrent_requests.max(1),
            rate_limit_rps: config.default_rate_limit_rps,
            inter_request_delay: Duration::from_millis(config.inter_request_delay_ms),
            request_timeout: config.request_timeout(),
            retry_attempts: config.retry_attempts,
            failure_threshold: config.failure_threshold_pct,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// Analyzer inputs resolved by the caller at launch time: a snapshot of
/// the detection catalog plus the effective confidence threshold.
#[derive(Clone, Debug)]
pub struct AnalysisContext {
    pub detection: DetectionCatalog,
    pub confidence_threshold: f64,
}

/// One observed HTTP exchange.
struct HttpOutcome {
    status: u16,
    headers: FxHashMap<String, String>,
    body: Vec<u8>,
    elapsed_ms: u64,
}

/// Per-pair replay plan: the context prefix to re-run and the request to
/// probe with. Sequence transforms resolve to reshaped plans.
struct PairPlan {
    prefix: Vec<RecordedRequest>,
    probe: RecordedRequest,
    /// Apply the case's mutation to the probe before sending.
    mutate_probe: bool,
}

/// The replay engine. Cheap to clone; executions run on spawned tasks
/// and are tracked in the execution registry until they reach a terminal
/// state.
#[derive(Clone)]
pub struct Replayer {
    store: SharedStore,
    settings: ReplaySettings,
    registry: Arc<std::sync::Mutex<FxHashMap<Uuid, Arc<AtomicBool>>>>,
    emitter: EventEmitter,
}

impl Replayer {
    #[must_use]
    pub fn new(store: SharedStore, settings: ReplaySettings, emitter: EventEmitter) -> Self {
        Self {
            store,
            settings,
            registry: Arc::new(std::sync::Mutex::new(FxHashMap::default())),
            emitter,
        }
    }

    /// Execution ids currently registered as running.
    #[must_use]
    pub fn running_executions(&self) -> Vec<Uuid> {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    /// Signal cancellation. Workers observe the flag at request
    /// boundaries; returns `false` when the execution is unknown or
    /// already terminal.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match registry.get(&execution_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Launch a whole-flow execution. Returns the execution id
    /// immediately; progress is polled via the store.
    #[instrument(skip(self, analysis), err)]
    pub async fn replay_flow(&self, flow_id: Uuid, analysis: AnalysisContext) -> Result<Uuid> {
        let flow = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or(ReplayerError::FlowNotFound { id: flow_id })?;
        let requests = self.store.list_requests(flow_id).await?;
        let cases = self.store.list_test_cases_for_flow(flow_id).await?;

        let execution = ExecutionState::begin(flow_id, cases.len() as u64);
        self.store.create_execution(&execution).await?;
        let cancel = self.register(execution.id);

        let engine = self.clone();
        let execution_id = execution.id;
        tokio::spawn(async move {
            engine
                .run_flow_execution(flow, requests, cases, execution, analysis, cancel)
                .await;
        });
        Ok(execution_id)
    }

    /// Launch a single-test-case execution: baseline once, mutant once,
    /// strictly paired on a fresh cookie jar.
    #[instrument(skip(self, analysis), err)]
    pub async fn replay_test_case(
        &self,
        test_case_id: Uuid,
        analysis: AnalysisContext,
    ) -> Result<Uuid> {
        let case = self
            .store
            .get_test_case(test_case_id)
            .await?
            .ok_or(ReplayerError::TestCaseNotFound { id: test_case_id })?;
        let request = self
            .store
            .get_request(case.request_id)
            .await?
            .ok_or(ReplayerError::RequestNotFound {
                id: case.request_id,
            })?;
        let flow = self
            .store
            .get_flow(request.flow_id)
            .await?
            .ok_or(ReplayerError::FlowNotFound {
                id: request.flow_id,
            })?;
        let requests = self.store.list_requests(flow.id).await?;

        let execution = ExecutionState::begin(flow.id, 1);
        self.store.create_execution(&execution).await?;
        let cancel = self.register(execution.id);

        let engine = self.clone();
        let execution_id = execution.id;
        tokio::spawn(async move {
            engine
                .run_single_execution(flow, requests, request, case, execution, analysis, cancel)
                .await;
        });
        Ok(execution_id)
    }

    fn register(&self, execution_id: Uuid) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(execution_id, Arc::clone(&flag));
        flag
    }

    fn deregister(&self, execution_id: Uuid) {
        self.registry
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&execution_id);
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.settings.request_timeout)
            .build()
            .map_err(|e| ReplayerError::Client {
                message: e.to_string(),
            })
    }

    // ----------------------------------------------------------------- flow

    #[allow(clippy::too_many_arguments)]
    async fn run_flow_execution(
        self,
        flow: Flow,
        requests: Vec<RecordedRequest>,
        cases: Vec<TestCase>,
        execution: ExecutionState,
        analysis: AnalysisContext,
        cancel: Arc<AtomicBool>,
    ) {
        let execution_id = execution.id;
        self.emitter.emit(ProgressEvent::ExecutionStarted {
            execution_id,
            flow_id: flow.id,
            total: execution.total,
            when: Utc::now(),
        });

        let limiter = Arc::new(RateLimiter::new(self.settings.rate_limit_rps));
        let pool = Arc::new(Semaphore::new(self.settings.concurrent_requests));
        let progress = Arc::new(Mutex::new(execution));
        let threshold_tripped = Arc::new(AtomicBool::new(false));

        // Phase 1: baseline transcript, strictly in ordinal order, before
        // any mutant runs. Baseline transport errors count against the
        // failure threshold exactly like mutant pairs.
        let mut transcript: FxHashMap<u32, ResponseRecord> = FxHashMap::default();
        if !cancel.load(Ordering::SeqCst) {
            match self.build_client() {
                Ok(client) => {
                    for request in &requests {
                        if cancel.load(Ordering::SeqCst) {
                            break;
                        }
                        let response = self
                            .execute_recorded(
                                &client,
                                &MaterializedRequest::baseline(request),
                                OwnerKind::Baseline,
                                request.id,
                                execution_id,
                                &limiter,
                                &pool,
                            )
                            .await;
                        let transport_failed = response.error_kind.is_some();
                        let committed = self
                            .record_with_retry(flow.id, &response)
                            .await;
                        if committed {
                            transcript.insert(request.ordinal, response);
                        }
                        if transport_failed && self.count_failure(&progress).await {
                            threshold_tripped.store(true, Ordering::SeqCst);
                            cancel.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "replay client construction failed");
                    threshold_tripped.store(true, Ordering::SeqCst);
                    cancel.store(true, Ordering::SeqCst);
                }
            }
        }

        // Phase 2: mutants, grouped by ordinal. Groups run concurrently,
        // cases within a group serially.
        let mut groups: BTreeMap<u32, Vec<TestCase>> = BTreeMap::new();
        let by_id: FxHashMap<Uuid, RecordedRequest> =
            requests.iter().map(|r| (r.id, r.clone())).collect();
        for case in cases {
            if let Some(request) = by_id.get(&case.request_id) {
                groups.entry(request.ordinal).or_default().push(case);
            }
        }

        let transcript = Arc::new(transcript);
        let mut workers = Vec::new();
        for (_, group) in groups {
            let engine = self.clone();
            let flow = flow.clone();
            let requests = requests.clone();
            let analysis = analysis.clone();
            let cancel = Arc::clone(&cancel);
            let limiter = Arc::clone(&limiter);
            let pool = Arc::clone(&pool);
            let progress = Arc::clone(&progress);
            let transcript = Arc::clone(&transcript);
            let tripped = Arc::clone(&threshold_tripped);
            workers.push(tokio::spawn(async move {
                for case in group {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let failed = engine
                        .run_pair(
                            &flow, &requests, &case, &transcript, execution_id, &analysis,
                            &cancel, &limiter, &pool, &progress,
                        )
                        .await;
                    if failed {
                        let snapshot = { progress.lock().await.clone() };
                        if engine.threshold_exceeded(&snapshot) {
                            tripped.store(true, Ordering::SeqCst);
                            cancel.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }));
        }
        join_all(workers).await;

        let status = if threshold_tripped.load(Ordering::SeqCst) {
            ExecutionStatus::Failed
        } else if cancel.load(Ordering::SeqCst) {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Succeeded
        };
        self.finish(progress, status, execution_id).await;
    }

    /// Record one transport failure against the execution and report
    /// whether the failure ratio now exceeds the configured threshold.
    async fn count_failure(&self, progress: &Arc<Mutex<ExecutionState>>) -> bool {
        let snapshot = {
            let mut state = progress.lock().await;
            state.failed += 1;
            state.clone()
        };
        if let Err(err) = self.store.update_execution(&snapshot).await {
            tracing::warn!(error = %err, "execution progress update failed");
        }
        self.threshold_exceeded(&snapshot)
    }

    fn threshold_exceeded(&self, state: &ExecutionState) -> bool {
        let ratio = state.failed as f64 / state.total.max(1) as f64;
        ratio > self.settings.failure_threshold
    }

    // --------------------------------------------------------------- single

    #[allow(clippy::too_many_arguments)]
    async fn run_single_execution(
        self,
        flow: Flow,
        requests: Vec<RecordedRequest>,
        request: RecordedRequest,
        case: TestCase,
        execution: ExecutionState,
        analysis: AnalysisContext,
        cancel: Arc<AtomicBool>,
    ) {
        let execution_id = execution.id;
        self.emitter.emit(ProgressEvent::ExecutionStarted {
            execution_id,
            flow_id: flow.id,
            total: 1,
            when: Utc::now(),
        });
        let limiter = Arc::new(RateLimiter::new(self.settings.rate_limit_rps));
        let pool = Arc::new(Semaphore::new(self.settings.concurrent_requests));
        let progress = Arc::new(Mutex::new(execution));

        let mut transcript: FxHashMap<u32, ResponseRecord> = FxHashMap::default();
        let plan = pair_plan(&case, &request, &requests);
        let mut baseline_tripped = false;

        // Baseline side of the pair on a fresh cookie jar. A baseline
        // transport failure counts against the threshold just like a
        // failed mutant pair.
        if !cancel.load(Ordering::SeqCst) {
            if let Ok(client) = self.build_client() {
                for prefix_request in &plan.prefix {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let _ = self
                        .send_with_retry(
                            &client,
                            &MaterializedRequest::baseline(prefix_request),
                            execution_id,
                            &limiter,
                            &pool,
                            &cancel,
                        )
                        .await;
                }
                if !cancel.load(Ordering::SeqCst) {
                    let baseline = self
                        .execute_recorded(
                            &client,
                            &MaterializedRequest::baseline(&plan.probe),
                            OwnerKind::Baseline,
                            plan.probe.id,
                            execution_id,
                            &limiter,
                            &pool,
                        )
                        .await;
                    let transport_failed = baseline.error_kind.is_some();
                    if self.record_with_retry(flow.id, &baseline).await {
                        transcript.insert(plan.probe.ordinal, baseline);
                    }
                    if transport_failed && self.count_failure(&progress).await {
                        baseline_tripped = true;
                        cancel.store(true, Ordering::SeqCst);
                    }
                }
            }
        }

        let transcript = Arc::new(transcript);
        let failed = if cancel.load(Ordering::SeqCst) {
            false
        } else {
            self.run_pair(
                &flow, &requests, &case, &transcript, execution_id, &analysis, &cancel,
                &limiter, &pool, &progress,
            )
            .await
        };

        let status = if baseline_tripped {
            ExecutionStatus::Failed
        } else if cancel.load(Ordering::SeqCst) && !failed {
            ExecutionStatus::Cancelled
        } else {
            let snapshot = { progress.lock().await.clone() };
            if self.threshold_exceeded(&snapshot) {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Succeeded
            }
        };
        self.finish(progress, status, execution_id).await;
    }

    // ---------------------------------------------------------------- pairs

    /// Replay one test case against its baseline context. Returns `true`
    /// when the pair ended in a transport failure.
    #[allow(clippy::too_many_arguments)]
    async fn run_pair(
        &self,
        flow: &Flow,
        requests: &[RecordedRequest],
        case: &TestCase,
        transcript: &FxHashMap<u32, ResponseRecord>,
        execution_id: Uuid,
        analysis: &AnalysisContext,
        cancel: &Arc<AtomicBool>,
        limiter: &Arc<RateLimiter>,
        pool: &Arc<Semaphore>,
        progress: &Arc<Mutex<ExecutionState>>,
    ) -> bool {
        let Some(target) = requests.iter().find(|r| r.id == case.request_id) else {
            return false;
        };
        let plan = pair_plan(case, target, requests);

        let probe = if plan.mutate_probe {
            match materialize(&plan.probe, &case.mutation, &flow.identity_pool) {
                Ok(materialized) => materialized,
                Err(err) => {
                    tracing::warn!(case = %case.id, error = %err, "materialization failed; skipping pair");
                    return false;
                }
            }
        } else {
            MaterializedRequest::baseline(&plan.probe)
        };

        let Ok(client) = self.build_client() else {
            return true;
        };

        // Context prefix: re-run the preceding baselines on this client's
        // fresh cookie jar so the probe sees realistic session state.
        for prefix_request in &plan.prefix {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            let _ = self
                .send_with_retry(
                    &client,
                    &MaterializedRequest::baseline(prefix_request),
                    execution_id,
                    limiter,
                    pool,
                    cancel,
                )
                .await;
        }
        if cancel.load(Ordering::SeqCst) {
            return false;
        }

        let mutant = self
            .execute_recorded(
                &client,
                &probe,
                OwnerKind::Mutant,
                case.id,
                execution_id,
                limiter,
                pool,
            )
            .await;
        if cancel.load(Ordering::SeqCst) {
            // Cancelled mid-pair: discard, never commit a partial pair.
            return false;
        }

        let baseline = transcript.get(&plan.probe.ordinal);
        let anomalies: Vec<Anomaly> = match baseline {
            Some(baseline)
                if !(baseline.error_kind.is_some() && mutant.error_kind.is_some()) =>
            {
                analyzer::analyze(
                    flow.id,
                    case,
                    baseline,
                    &mutant,
                    &analysis.detection,
                    analysis.confidence_threshold,
                )
            }
            _ => Vec::new(),
        };

        let committed = self
            .commit_with_retry(flow.id, &mutant, &anomalies)
            .await;
        let transport_failed = mutant.error_kind.is_some();

        {
            let mut state = progress.lock().await;
            if transport_failed {
                state.failed += 1;
            } else {
                state.done += 1;
            }
            let snapshot = state.clone();
            drop(state);
            if let Err(err) = self.store.update_execution(&snapshot).await {
                tracing::warn!(error = %err, "execution progress update failed");
            }
        }

        if committed {
            self.emitter.emit(ProgressEvent::PairReplayed {
                execution_id,
                test_case_id: case.id,
                ordinal: plan.probe.ordinal,
                mutant_status: mutant.status,
                anomalies: anomalies.len(),
                when: Utc::now(),
            });
        }
        transport_failed
    }

    // ------------------------------------------------------------- requests

    /// Send a request and wrap the outcome (or transport failure) into a
    /// response record, truncating oversized bodies.
    #[allow(clippy::too_many_arguments)]
    async fn execute_recorded(
        &self,
        client: &reqwest::Client,
        request: &MaterializedRequest,
        owner_kind: OwnerKind,
        owner_id: Uuid,
        execution_id: Uuid,
        limiter: &Arc<RateLimiter>,
        pool: &Arc<Semaphore>,
    ) -> ResponseRecord {
        let never_cancel = Arc::new(AtomicBool::new(false));
        let outcome = self
            .send_with_retry(client, request, execution_id, limiter, pool, &never_cancel)
            .await;
        match outcome {
            Ok(outcome) => {
                let mut body = outcome.body;
                let content_length = body.len() as u64;
                body.truncate(self.settings.max_body_bytes);
                ResponseRecord {
                    id: Uuid::new_v4(),
                    owner_kind,
                    owner_id,
                    execution_id,
                    status: Some(outcome.status),
                    headers: outcome.headers,
                    body: Some(body),
                    content_length,
                    response_time_ms: outcome.elapsed_ms,
                    error_kind: None,
                    captured_at: Utc::now(),
                }
            }
            Err(kind) => ResponseRecord {
                id: Uuid::new_v4(),
                owner_kind,
                owner_id,
                execution_id,
                status: None,
                headers: FxHashMap::default(),
                body: None,
                content_length: 0,
                response_time_ms: self.settings.request_timeout.as_millis() as u64,
                error_kind: Some(kind),
                captured_at: Utc::now(),
            },
        }
    }

    /// Transport-error retry loop: exponential backoff from 250 ms,
    /// factor 2, jitter ±20%. HTTP statuses are never retried.
    async fn send_with_retry(
        &self,
        client: &reqwest::Client,
        request: &MaterializedRequest,
        execution_id: Uuid,
        limiter: &Arc<RateLimiter>,
        pool: &Arc<Semaphore>,
        cancel: &Arc<AtomicBool>,
    ) -> std::result::Result<HttpOutcome, ErrorKind> {
        let mut attempt = 0;
        loop {
            limiter.acquire().await;
            if !self.settings.inter_request_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_request_delay).await;
            }
            let permit = pool.acquire().await;
            let result = send_once(client, request).await;
            drop(permit);
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    let kind = classify_transport_error(&err);
                    if attempt >= self.settings.retry_attempts || cancel.load(Ordering::SeqCst) {
                        return Err(kind);
                    }
                    let backoff = backoff_delay(attempt);
                    self.emitter.emit(ProgressEvent::RetryScheduled {
                        execution_id,
                        attempt: attempt + 1,
                        delay_ms: backoff.as_millis() as u64,
                        when: Utc::now(),
                    });
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    // -------------------------------------------------------------- commits

    /// Storage writes retry once locally before counting as lost.
    async fn record_with_retry(&self, flow_id: Uuid, response: &ResponseRecord) -> bool {
        match self.store.record_response(flow_id, response).await {
            Ok(()) => true,
            Err(first) => {
                tracing::warn!(error = %first, "response write failed; retrying once");
                match self.store.record_response(flow_id, response).await {
                    Ok(()) => true,
                    Err(second) => {
                        tracing::error!(error = %second, "response write lost");
                        false
                    }
                }
            }
        }
    }

    async fn commit_with_retry(
        &self,
        flow_id: Uuid,
        response: &ResponseRecord,
        anomalies: &[Anomaly],
    ) -> bool {
        match self.store.commit_pair(flow_id, response, anomalies).await {
            Ok(()) => true,
            Err(first) => {
                tracing::warn!(error = %first, "pair commit failed; retrying once");
                match self.store.commit_pair(flow_id, response, anomalies).await {
                    Ok(()) => true,
                    Err(second) => {
                        tracing::error!(error = %second, "pair commit lost");
                        false
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        progress: Arc<Mutex<ExecutionState>>,
        status: ExecutionStatus,
        execution_id: Uuid,
    ) {
        let snapshot = {
            let mut state = progress.lock().await;
            state.status = status;
            state.finished_at = Some(Utc::now());
            state.clone()
        };
        if let Err(err) = self.store.update_execution(&snapshot).await {
            tracing::error!(error = %err, "final execution update failed");
        }
        self.deregister(execution_id);
        self.emitter.emit(ProgressEvent::ExecutionFinished {
            execution_id,
            status,
            done: snapshot.done,
            failed: snapshot.failed,
            when: Utc::now(),
        });
    }
}

/// The request whose response a test case's mutant is compared against.
/// Sequence skips probe their successor; everything else probes the
/// mutation's own request.
#[must_use]
pub fn probe_request<'a>(
    case: &TestCase,
    requests: &'a [RecordedRequest],
) -> Option<&'a RecordedRequest> {
    let target = requests.iter().find(|r| r.id == case.request_id)?;
    match case.mutation.transform {
        Transform::SequenceSkip => requests
            .iter()
            .filter(|r| r.ordinal > target.ordinal)
            .min_by_key(|r| r.ordinal)
            .or(Some(target)),
        _ => Some(target),
    }
}

/// Resolve a test case into its replay plan. Sequence transforms reshape
/// the prefix and probe; everything else probes the mutated target after
/// its full baseline prefix.
fn pair_plan(case: &TestCase, target: &RecordedRequest, requests: &[RecordedRequest]) -> PairPlan {
    let before = |ordinal: u32| {
        requests
            .iter()
            .filter(|r| r.ordinal < ordinal)
            .cloned()
            .collect::<Vec<_>>()
    };
    match case.mutation.transform {
        Transform::SequenceSkip => {
            // Drop the target ordinal; the probe is the next step, which
            // now runs without its prerequisite.
            let successor = requests
                .iter()
                .filter(|r| r.ordinal > target.ordinal)
                .min_by_key(|r| r.ordinal);
            match successor {
                Some(next) => PairPlan {
                    prefix: before(target.ordinal),
                    probe: next.clone(),
                    mutate_probe: false,
                },
                // No successor to probe; degrade to a plain replay.
                None => PairPlan {
                    prefix: before(target.ordinal),
                    probe: target.clone(),
                    mutate_probe: false,
                },
            }
        }
        Transform::SequenceRepeat => {
            // Play the full prefix including the target once, then probe
            // with the target a second time.
            let mut prefix = before(target.ordinal);
            prefix.push(target.clone());
            PairPlan {
                prefix,
                probe: target.clone(),
                mutate_probe: false,
            }
        }
        Transform::SequenceReorder => {
            // Run the target before its immediate predecessor.
            let prefix = requests
                .iter()
                .filter(|r| r.ordinal + 1 < target.ordinal)
                .cloned()
                .collect();
            PairPlan {
                prefix,
                probe: target.clone(),
                mutate_probe: false,
            }
        }
        _ => PairPlan {
            prefix: before(target.ordinal),
            probe: target.clone(),
            mutate_probe: true,
        },
    }
}

async fn send_once(
    client: &reqwest::Client,
    request: &MaterializedRequest,
) -> std::result::Result<HttpOutcome, reqwest::Error> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        // Hop-by-hop and computed headers are reqwest's business.
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    let started = tokio::time::Instant::now();
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let body = response.bytes().await?.to_vec();
    Ok(HttpOutcome {
        status,
        headers,
        body,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

fn classify_transport_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Network
    }
}

/// Exponential backoff: base 250 ms, factor 2, jitter ±20%.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 250.0 * 2.0_f64.powi(attempt as i32);
    let jitter = rand::rng().random_range(0.8..=1.2);
    Duration::from_millis((base * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mutation, TargetSelector};
    use crate::types::MutationCategory;
    use serde_json::json;

    fn request(ordinal: u32) -> RecordedRequest {
        RecordedRequest {
            id: Uuid::new_v4(),
            flow_id: Uuid::new_v4(),
            ordinal,
            method: "POST".into(),
            url: format!("https://shop.example.com/step/{ordinal}"),
            headers: FxHashMap::default(),
            body: None,
            captured_status: 200,
            captured_headers: FxHashMap::default(),
            captured_body: None,
            timestamp: Utc::now(),
        }
    }

    fn case_for(target: &RecordedRequest, transform: Transform) -> TestCase {
        TestCase {
            id: Uuid::new_v4(),
            request_id: target.id,
            category: MutationCategory::Sequence,
            rule_id: "seq".into(),
            description: "seq".into(),
            mutation: Mutation {
                selector: TargetSelector::Envelope,
                transform,
            },
            catalog_version: "builtin-1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn skip_plan_probes_the_successor_without_the_target() {
        let requests = vec![request(1), request(2), request(3)];
        let case = case_for(&requests[1], Transform::SequenceSkip);
        let plan = pair_plan(&case, &requests[1], &requests);
        assert_eq!(plan.probe.ordinal, 3);
        assert_eq!(
            plan.prefix.iter().map(|r| r.ordinal).collect::<Vec<_>>(),
            vec![1]
        );
        assert!(!plan.mutate_probe);
    }

    #[test]
    fn repeat_plan_plays_target_twice() {
        let requests = vec![request(1), request(2)];
        let case = case_for(&requests[1], Transform::SequenceRepeat);
        let plan = pair_plan(&case, &requests[1], &requests);
        assert_eq!(
            plan.prefix.iter().map(|r| r.ordinal).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(plan.probe.ordinal, 2);
    }

    #[test]
    fn reorder_plan_drops_the_predecessor() {
        let requests = vec![request(1), request(2), request(3)];
        let case = case_for(&requests[2], Transform::SequenceReorder);
        let plan = pair_plan(&case, &requests[2], &requests);
        assert_eq!(
            plan.prefix.iter().map(|r| r.ordinal).collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(plan.probe.ordinal, 3);
    }

    #[test]
    fn value_mutation_plan_probes_mutated_target() {
        let requests = vec![request(1), request(2)];
        let mut case = case_for(&requests[1], Transform::NumericExtreme { value: json!(-1) });
        case.mutation.selector = TargetSelector::QueryParam { name: "q".into() };
        let plan = pair_plan(&case, &requests[1], &requests);
        assert_eq!(plan.probe.ordinal, 2);
        assert!(plan.mutate_probe);
        assert_eq!(
            plan.prefix.iter().map(|r| r.ordinal).collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_delay(0);
        let third = backoff_delay(2);
        assert!(first >= Duration::from_millis(200) && first <= Duration::from_millis(300));
        assert!(third >= Duration::from_millis(800) && third <= Duration::from_millis(1200));
    }
}
