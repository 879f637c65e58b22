//! Store infrastructure
//!
//! The store is the canonical entity graph: flows, recorded requests,
//! derived test cases, replay responses, anomalies, and execution ledgers.
//! This module defines the [`Store`] trait, an in-memory implementation
//! for tests and ephemeral runs, and the shared pagination/locking
//! plumbing; the SQL backends live in sibling modules.
//!
//! ## Contracts
//!
//! - Writes are serialized per flow (see [`FlowLocks`]); writes to
//!   different flows proceed independently.
//! - Reads are snapshot-consistent per call.
//! - [`Store::commit_pair`] writes a response and its anomalies
//!   atomically, so a reader observing the mutant response will also
//!   observe its anomalies.
//! - Deletes cascade down the ownership tree (flow → requests → test
//!   cases → responses/anomalies).

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::model::{
    Anomaly, ExecutionState, Flow, RecordedRequest, ResponseRecord, TestCase,
};
use crate::types::OwnerKind;

/// Errors from store operations.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StoreError {
    /// Entity was not found.
    #[error("not found: {what} {id}")]
    #[diagnostic(code(flowprobe::store::not_found))]
    NotFound { what: &'static str, id: Uuid },

    /// Backend storage error (database, filesystem, etc.).
    #[error("backend error: {message}")]
    #[diagnostic(
        code(flowprobe::store::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    /// Serialization error or other unexpected condition.
    #[error("store error: {message}")]
    #[diagnostic(code(flowprobe::store::other))]
    Other { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Maximum page size accepted by list operations.
pub const MAX_PER_PAGE: u32 = 100;

/// Pagination, sorting, and filtering for list operations.
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    /// 1-based page number; 0 is treated as 1.
    pub page: u32,
    /// Page size, clamped to [`MAX_PER_PAGE`].
    pub per_page: u32,
    /// Backend-interpreted sort key (e.g. `created_at`, `severity`).
    pub sort: Option<String>,
    /// Case-insensitive substring filter over name/description fields.
    pub search: Option<String>,
}

impl ListQuery {
    /// Normalized `(page, per_page)` with defaults and caps applied.
    #[must_use]
    pub fn normalized(&self) -> (u32, u32) {
        let page = self.page.max(1);
        let per_page = match self.per_page {
            0 => 20,
            n => n.min(MAX_PER_PAGE),
        };
        (page, per_page)
    }

    /// Zero-based row offset for SQL backends.
    #[must_use]
    pub fn offset(&self) -> u32 {
        let (page, per_page) = self.normalized();
        (page - 1) * per_page
    }
}

/// One page of results plus pagination metadata.
#[derive(Clone, Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    #[must_use]
    pub fn has_next(&self) -> bool {
        u64::from(self.page) * u64::from(self.per_page) < self.total
    }

    #[must_use]
    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    /// Assemble a page from an already-filtered full result set.
    #[must_use]
    pub fn slice(mut items: Vec<T>, query: &ListQuery) -> Self {
        let (page, per_page) = query.normalized();
        let total = items.len() as u64;
        let start = (query.offset() as usize).min(items.len());
        let end = (start + per_page as usize).min(items.len());
        let items = items.drain(start..end).collect();
        Self {
            items,
            total,
            page,
            per_page,
        }
    }
}

/// Per-flow write serialization.
///
/// Each flow id maps to one async mutex; write paths acquire the flow's
/// lock for the duration of the operation, so concurrent writers to the
/// same flow queue up while different flows proceed in parallel.
#[derive(Default)]
pub struct FlowLocks {
    inner: std::sync::Mutex<FxHashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl FlowLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the write lock for `flow_id`, creating it on first use.
    pub async fn acquire(&self, flow_id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(
                map.entry(flow_id)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for a deleted flow.
    pub fn forget(&self, flow_id: Uuid) {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.remove(&flow_id);
    }
}

/// Canonical persistence surface for the entity graph.
///
/// Implementations must be `Send + Sync`; all operations are atomic at
/// the statement level and [`commit_pair`](Store::commit_pair) is atomic
/// as a whole.
#[async_trait]
pub trait Store: Send + Sync {
    // -- flows -------------------------------------------------------------

    async fn create_flow(&self, flow: &Flow) -> Result<()>;
    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>>;
    /// Update name, description, target domain, identity pool, and
    /// threshold; bumps `updated_at`.
    async fn update_flow(&self, flow: &Flow) -> Result<()>;
    /// Cascading delete; returns `false` when the flow did not exist.
    async fn delete_flow(&self, id: Uuid) -> Result<bool>;
    async fn list_flows(&self, query: &ListQuery) -> Result<Page<Flow>>;

    // -- requests ----------------------------------------------------------

    /// Append a request to its flow, assigning the next ordinal. The
    /// `ordinal` field on `request` is overwritten with the assigned value.
    async fn append_request(&self, request: &mut RecordedRequest) -> Result<()>;
    async fn get_request(&self, id: Uuid) -> Result<Option<RecordedRequest>>;
    /// All requests of a flow in ordinal order.
    async fn list_requests(&self, flow_id: Uuid) -> Result<Vec<RecordedRequest>>;
    /// Delete a request and cascade to its test cases, their responses,
    /// and their anomalies.
    async fn delete_request(&self, id: Uuid) -> Result<bool>;

    // -- test cases --------------------------------------------------------

    /// Insert test cases, skipping any whose `(request_id, mutation)`
    /// already exists. Returns the number actually inserted.
    async fn insert_test_cases(&self, flow_id: Uuid, cases: &[TestCase]) -> Result<u64>;
    async fn get_test_case(&self, id: Uuid) -> Result<Option<TestCase>>;
    async fn list_test_cases_for_request(&self, request_id: Uuid) -> Result<Vec<TestCase>>;
    async fn list_test_cases_for_flow(&self, flow_id: Uuid) -> Result<Vec<TestCase>>;

    // -- responses ---------------------------------------------------------

    async fn record_response(&self, flow_id: Uuid, response: &ResponseRecord) -> Result<()>;
    /// Latest response for `(owner, execution)`, by capture time.
    async fn latest_response(
        &self,
        owner_kind: OwnerKind,
        owner_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Option<ResponseRecord>>;
    /// Atomically commit a mutant response together with the anomalies the
    /// analyzer derived from its pair.
    async fn commit_pair(
        &self,
        flow_id: Uuid,
        response: &ResponseRecord,
        anomalies: &[Anomaly],
    ) -> Result<()>;

    // -- anomalies ---------------------------------------------------------

    /// Insert anomalies produced outside a pair commit (re-analysis runs).
    async fn insert_anomalies(&self, flow_id: Uuid, anomalies: &[Anomaly]) -> Result<()>;
    async fn get_anomaly(&self, id: Uuid) -> Result<Option<Anomaly>>;
    /// Update triage status/description of an existing anomaly.
    async fn update_anomaly(&self, anomaly: &Anomaly) -> Result<()>;
    async fn list_anomalies(&self, flow_id: Uuid, query: &ListQuery) -> Result<Page<Anomaly>>;
    async fn list_all_anomalies(&self, flow_id: Uuid) -> Result<Vec<Anomaly>>;

    // -- executions --------------------------------------------------------

    async fn create_execution(&self, execution: &ExecutionState) -> Result<()>;
    async fn update_execution(&self, execution: &ExecutionState) -> Result<()>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionState>>;
    async fn list_executions(&self, flow_id: Uuid) -> Result<Vec<ExecutionState>>;
    /// Boot-time reconciliation: executions still marked `running` from a
    /// previous process are transitioned to `failed`. Returns how many
    /// rows changed.
    async fn reconcile_stale_executions(&self) -> Result<u64>;
}

/// Shared handle type used across the crate.
pub type SharedStore = Arc<dyn Store>;
