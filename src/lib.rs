//! # Flowprobe: Black-box Business-Logic Security Testing
//!
//! Flowprobe records baseline HTTP flows, mechanically derives mutated
//! test cases from a declarative rule catalog, replays baseline and
//! mutants against the target under concurrency and rate limits, and
//! diffs the response pairs for behaviors suggestive of business-logic
//! vulnerabilities: authentication/authorization bypass, parameter
//! tampering, privilege escalation, and workflow-sequence violations.
//!
//! ## Pipeline
//!
//! ```text
//! Recorder ──> Store <── Mutator (rule catalog)
//!                │
//!                ▼
//!            Replayer ──(pairs)──> Analyzer (detection catalog)
//!                │                     │
//!                ▼                     ▼
//!            Responses             Anomalies ──> Scoring/Reports
//! ```
//!
//! The store is the canonical graph; everything downstream of the
//! recorder is derived and reproducible. Findings are *suspicions* with
//! calibrated confidence, never confirmed exploits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowprobe::config::AppConfig;
//! use flowprobe::events::EventBus;
//! use flowprobe::replayer::{Replayer, ReplaySettings};
//! use flowprobe::store::{InMemoryStore, SharedStore};
//! use flowprobe::api::{AppState, router};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::from_env();
//! let store: SharedStore = Arc::new(InMemoryStore::new());
//! let bus = EventBus::default();
//! bus.listen();
//! let replayer = Replayer::new(
//!     Arc::clone(&store),
//!     ReplaySettings::from(&config),
//!     bus.emitter(),
//! );
//! let app = router(AppState::new(store, config, replayer));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8088").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`types`] - Closed vocabularies: severities, categories, error kinds
//! - [`model`] - The entity graph (flows, requests, test cases, responses,
//!   anomalies, executions)
//! - [`config`] - Process-wide startup configuration
//! - [`store`] - Durable graph storage (in-memory, SQLite, PostgreSQL)
//! - [`recorder`] - Recording sessions and bulk import
//! - [`mutator`] - Rule catalog and deterministic test-case derivation
//! - [`replayer`] - Concurrent replay engine with retries and cancellation
//! - [`analyzer`] - Detectors-as-data diff engine
//! - [`scoring`] - Risk aggregation and report documents
//! - [`events`] - Execution progress bus
//! - [`api`] - Axum control plane

pub mod analyzer;
pub mod api;
pub mod config;
pub mod events;
pub mod model;
pub mod mutator;
pub mod recorder;
pub mod replayer;
pub mod scoring;
pub mod store;
pub mod types;
