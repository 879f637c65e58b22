//! Recording sessions: accept captured HTTP exchanges and attach them to
//! a flow.
//!
//! The recorder never intercepts traffic itself; importers (browser
//! extension, proxy dump, cURL) present parsed [`CapturedExchange`]s and
//! the recorder validates shape and appends. At most one recording
//! session is active per process; the slot is claimed and released with
//! compare-and-swap semantics on start/stop.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{CapturedExchange, RecordedRequest};
use crate::store::{SharedStore, Store, StoreError};

/// Errors from recorder operations.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RecorderError {
    /// Another session already holds the slot.
    #[error("a recording session is already active: {active_session}")]
    #[diagnostic(
        code(flowprobe::recorder::conflict),
        help("Stop session {active_session} before starting a new one.")
    )]
    Conflict { active_session: Uuid },

    /// Operation requires an active session.
    #[error("no recording session is active")]
    #[diagnostic(code(flowprobe::recorder::idle))]
    NoActiveSession,

    /// No flow selected and none supplied.
    #[error("no flow selected for recording")]
    #[diagnostic(
        code(flowprobe::recorder::no_flow),
        help("Select a flow first or pass flow_id explicitly.")
    )]
    NoFlowSelected,

    /// The captured exchange failed shape validation.
    #[error("invalid exchange: {message}")]
    #[diagnostic(code(flowprobe::recorder::validation))]
    Validation { message: String },

    #[error(transparent)]
    #[diagnostic(code(flowprobe::recorder::store))]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

/// The process-wide recording slot contents while `recording`.
#[derive(Clone, Debug)]
struct ActiveSession {
    session_id: Uuid,
    flow_id: Uuid,
    started_at: DateTime<Utc>,
    requests_recorded: u64,
}

/// Status view returned by the control plane.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub recording: bool,
    pub session_id: Option<Uuid>,
    pub flow_id: Option<Uuid>,
    pub selected_flow: Option<Uuid>,
    pub requests_recorded: u64,
}

/// Summary returned when a session stops; the session itself is discarded.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub flow_id: Uuid,
    pub duration_ms: u64,
    pub requests_recorded: u64,
}

/// Process-wide recorder. Lifecycle: `idle → recording → idle`.
pub struct Recorder {
    store: SharedStore,
    slot: Mutex<Option<ActiveSession>>,
    selected_flow: Mutex<Option<Uuid>>,
    max_body_bytes: usize,
}

impl Recorder {
    #[must_use]
    pub fn new(store: SharedStore, max_body_bytes: usize) -> Self {
        Self {
            store,
            slot: Mutex::new(None),
            selected_flow: Mutex::new(None),
            max_body_bytes,
        }
    }

    /// Set the default flow for subsequently started sessions.
    pub async fn select_flow(&self, flow_id: Uuid) {
        *self.selected_flow.lock().await = Some(flow_id);
    }

    pub async fn status(&self) -> SessionStatus {
        let slot = self.slot.lock().await;
        let selected = *self.selected_flow.lock().await;
        match slot.as_ref() {
            Some(active) => SessionStatus {
                recording: true,
                session_id: Some(active.session_id),
                flow_id: Some(active.flow_id),
                selected_flow: selected,
                requests_recorded: active.requests_recorded,
            },
            None => SessionStatus {
                recording: false,
                session_id: None,
                flow_id: None,
                selected_flow: selected,
                requests_recorded: 0,
            },
        }
    }

    /// Claim the slot and start recording into `flow_id` (or the selected
    /// flow). Fails with [`RecorderError::Conflict`] while another session
    /// is active.
    pub async fn start(&self, flow_id: Option<Uuid>) -> Result<Uuid> {
        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            return Err(RecorderError::Conflict {
                active_session: active.session_id,
            });
        }
        let flow_id = match flow_id {
            Some(id) => id,
            None => self
                .selected_flow
                .lock()
                .await
                .ok_or(RecorderError::NoFlowSelected)?,
        };
        // Reject unknown flows before claiming the slot for good.
        if self.store.get_flow(flow_id).await?.is_none() {
            return Err(StoreError::NotFound {
                what: "flow",
                id: flow_id,
            }
            .into());
        }
        let session_id = Uuid::new_v4();
        *slot = Some(ActiveSession {
            session_id,
            flow_id,
            started_at: Utc::now(),
            requests_recorded: 0,
        });
        tracing::info!(%session_id, %flow_id, "recording session started");
        Ok(session_id)
    }

    /// Release the slot and return the session summary.
    pub async fn stop(&self) -> Result<SessionSummary> {
        let mut slot = self.slot.lock().await;
        let active = slot.take().ok_or(RecorderError::NoActiveSession)?;
        let duration_ms = (Utc::now() - active.started_at)
            .num_milliseconds()
            .max(0) as u64;
        tracing::info!(session_id = %active.session_id, duration_ms, "recording session stopped");
        Ok(SessionSummary {
            session_id: active.session_id,
            flow_id: active.flow_id,
            duration_ms,
            requests_recorded: active.requests_recorded,
        })
    }

    /// Validate and append one exchange to the active session's flow.
    /// Rejected outside `recording`.
    pub async fn add_exchange(&self, exchange: CapturedExchange) -> Result<RecordedRequest> {
        let mut slot = self.slot.lock().await;
        let active = slot.as_mut().ok_or(RecorderError::NoActiveSession)?;
        let mut request = self.build_request(active.flow_id, &exchange)?;
        self.store.append_request(&mut request).await?;
        active.requests_recorded += 1;
        Ok(request)
    }

    /// Bulk import: validate every exchange up front, then append in
    /// order. Does not require (or touch) a recording session.
    pub async fn import(
        &self,
        flow_id: Uuid,
        exchanges: Vec<CapturedExchange>,
    ) -> Result<Vec<RecordedRequest>> {
        let mut requests = exchanges
            .iter()
            .map(|ex| self.build_request(flow_id, ex))
            .collect::<Result<Vec<_>>>()?;
        for request in &mut requests {
            self.store.append_request(request).await?;
        }
        Ok(requests)
    }

    fn build_request(
        &self,
        flow_id: Uuid,
        exchange: &CapturedExchange,
    ) -> Result<RecordedRequest> {
        let method = exchange.method.trim().to_uppercase();
        const METHODS: &[&str] = &[
            "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "TRACE",
        ];
        if !METHODS.contains(&method.as_str()) {
            return Err(RecorderError::Validation {
                message: format!("unknown method: {}", exchange.method),
            });
        }
        let parsed = url::Url::parse(&exchange.url).map_err(|e| RecorderError::Validation {
            message: format!("invalid url {}: {e}", exchange.url),
        })?;
        if parsed.host_str().is_none() {
            return Err(RecorderError::Validation {
                message: format!("url has no host: {}", exchange.url),
            });
        }
        if !(100..=599).contains(&exchange.response_status) {
            return Err(RecorderError::Validation {
                message: format!("status out of range: {}", exchange.response_status),
            });
        }
        let clip = |body: &Option<String>| {
            body.as_ref().map(|b| {
                let mut bytes = b.clone().into_bytes();
                bytes.truncate(self.max_body_bytes);
                bytes
            })
        };
        Ok(RecordedRequest {
            id: Uuid::new_v4(),
            flow_id,
            ordinal: 0, // assigned by the store
            method,
            url: exchange.url.clone(),
            headers: exchange.headers.clone(),
            body: clip(&exchange.body),
            captured_status: exchange.response_status,
            captured_headers: exchange.response_headers.clone(),
            captured_body: clip(&exchange.response_body),
            timestamp: Utc::now(),
        })
    }
}
