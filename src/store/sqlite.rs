/*!
SQLite Store

Default durable backend for the entity graph.

## Behavior

- Entities serialize through serde: header maps and identity pools are
  stored as JSON text, mutation records as canonical JSON (which doubles
  as the de-duplication key via a unique index), bodies as BLOBs.
- Timestamps are RFC 3339 text; UUIDs are stored in their hyphenated
  string form.
- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) are executed on connect;
  disabling the feature assumes external migration orchestration.
- Foreign keys are enabled on every connection so flow deletion cascades
  in the database. Responses are keyed polymorphically by
  `(owner_kind, owner_id)` and additionally carry `flow_id` for cascades.

## Concurrency

Writes take the per-flow lock (see [`FlowLocks`]) before touching the
pool, which serializes writers within a flow while letting distinct flows
proceed concurrently.
*/

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use crate::model::{
    Anomaly, ExecutionState, Flow, Identity, Mutation, RecordedRequest, ResponseRecord, TestCase,
};
use crate::types::{
    AnomalyKind, AnomalyStatus, ErrorKind, ExecutionStatus, MutationCategory, OwnerKind, Severity,
    VulnerabilityType,
};

use super::{FlowLocks, ListQuery, Page, Result, Store, StoreError};

/// SQLite-backed store.
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
    locks: FlowLocks,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

fn backend(context: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        message: format!("{context}: {err}"),
    }
}

fn to_json<T: Serialize>(value: &T, what: &'static str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Other {
        message: format!("serialize {what}: {e}"),
    })
}

fn from_json<T: DeserializeOwned>(payload: &str, what: &'static str) -> Result<T> {
    serde_json::from_str(payload).map_err(|e| StoreError::Other {
        message: format!("deserialize {what}: {e}"),
    })
}

fn parse_uuid(payload: &str, what: &'static str) -> Result<Uuid> {
    Uuid::parse_str(payload).map_err(|e| StoreError::Other {
        message: format!("parse {what} uuid: {e}"),
    })
}

fn parse_ts(payload: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(payload)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn decode_with<T>(payload: &str, what: &'static str, decode: fn(&str) -> Option<T>) -> Result<T> {
    decode(payload).ok_or(StoreError::Other {
        message: format!("unknown {what}: {payload}"),
    })
}

impl SqliteStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: "sqlite://flowprobe.db"
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| backend("connect options", e))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| backend("connect", e))?;
        // Run embedded migrations only if the feature is enabled (idempotent).
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(backend("migration failure", e));
            }
        }
        #[cfg(not(feature = "sqlite-migrations"))]
        {
            // Feature disabled: assume external migration orchestration already applied schema.
        }
        Ok(Self {
            pool: Arc::new(pool),
            locks: FlowLocks::new(),
        })
    }

    fn row_to_flow(row: &SqliteRow) -> Result<Flow> {
        let id: String = row.get("id");
        let identity_pool_json: String = row.get("identity_pool_json");
        let identity_pool: Vec<Identity> = from_json(&identity_pool_json, "identity_pool")?;
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        Ok(Flow {
            id: parse_uuid(&id, "flow")?,
            name: row.get("name"),
            description: row.get("description"),
            target_domain: row.get("target_domain"),
            identity_pool,
            confidence_threshold: row.get("confidence_threshold"),
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    fn row_to_request(row: &SqliteRow) -> Result<RecordedRequest> {
        let id: String = row.get("id");
        let flow_id: String = row.get("flow_id");
        let headers_json: String = row.get("headers_json");
        let captured_headers_json: String = row.get("captured_headers_json");
        let headers: FxHashMap<String, String> = from_json(&headers_json, "headers")?;
        let captured_headers: FxHashMap<String, String> =
            from_json(&captured_headers_json, "captured_headers")?;
        let ordinal: i64 = row.get("ordinal");
        let captured_status: i64 = row.get("captured_status");
        let recorded_at: String = row.get("recorded_at");
        Ok(RecordedRequest {
            id: parse_uuid(&id, "request")?,
            flow_id: parse_uuid(&flow_id, "flow")?,
            ordinal: ordinal as u32,
            method: row.get("method"),
            url: row.get("url"),
            headers,
            body: row.get("body"),
            captured_status: captured_status as u16,
            captured_headers,
            captured_body: row.get("captured_body"),
            timestamp: parse_ts(&recorded_at),
        })
    }

    fn row_to_test_case(row: &SqliteRow) -> Result<TestCase> {
        let id: String = row.get("id");
        let request_id: String = row.get("request_id");
        let category: String = row.get("category");
        let mutation_json: String = row.get("mutation_json");
        let mutation: Mutation = from_json(&mutation_json, "mutation")?;
        let created_at: String = row.get("created_at");
        Ok(TestCase {
            id: parse_uuid(&id, "test_case")?,
            request_id: parse_uuid(&request_id, "request")?,
            category: decode_with(&category, "category", MutationCategory::decode)?,
            rule_id: row.get("rule_id"),
            description: row.get("description"),
            mutation,
            catalog_version: row.get("catalog_version"),
            created_at: parse_ts(&created_at),
        })
    }

    fn row_to_response(row: &SqliteRow) -> Result<ResponseRecord> {
        let id: String = row.get("id");
        let owner_kind: String = row.get("owner_kind");
        let owner_id: String = row.get("owner_id");
        let execution_id: String = row.get("execution_id");
        let headers_json: String = row.get("headers_json");
        let headers: FxHashMap<String, String> = from_json(&headers_json, "headers")?;
        let status: Option<i64> = row.get("status");
        let content_length: i64 = row.get("content_length");
        let response_time_ms: i64 = row.get("response_time_ms");
        let error_kind: Option<String> = row.get("error_kind");
        let error_kind = match error_kind {
            Some(s) => Some(decode_with(&s, "error_kind", ErrorKind::decode)?),
            None => None,
        };
        let captured_at: String = row.get("captured_at");
        Ok(ResponseRecord {
            id: parse_uuid(&id, "response")?,
            owner_kind: decode_with(&owner_kind, "owner_kind", OwnerKind::decode)?,
            owner_id: parse_uuid(&owner_id, "owner")?,
            execution_id: parse_uuid(&execution_id, "execution")?,
            status: status.map(|s| s as u16),
            headers,
            body: row.get("body"),
            content_length: content_length as u64,
            response_time_ms: response_time_ms as u64,
            error_kind,
            captured_at: parse_ts(&captured_at),
        })
    }

    fn row_to_anomaly(row: &SqliteRow) -> Result<Anomaly> {
        let id: String = row.get("id");
        let flow_id: String = row.get("flow_id");
        let test_case_id: String = row.get("test_case_id");
        let kind: String = row.get("kind");
        let severity: String = row.get("severity");
        let vulnerability_type: String = row.get("vulnerability_type");
        let status: String = row.get("status");
        let is_potential: i64 = row.get("is_potential_vulnerability");
        let original_status: Option<i64> = row.get("original_status");
        let replayed_status: Option<i64> = row.get("replayed_status");
        let original_content_length: i64 = row.get("original_content_length");
        let replayed_content_length: i64 = row.get("replayed_content_length");
        let created_at: String = row.get("created_at");
        Ok(Anomaly {
            id: parse_uuid(&id, "anomaly")?,
            flow_id: parse_uuid(&flow_id, "flow")?,
            test_case_id: parse_uuid(&test_case_id, "test_case")?,
            kind: decode_with(&kind, "anomaly kind", AnomalyKind::decode)?,
            severity: decode_with(&severity, "severity", Severity::decode)?,
            confidence: row.get("confidence"),
            is_potential_vulnerability: is_potential != 0,
            vulnerability_type: decode_with(
                &vulnerability_type,
                "vulnerability_type",
                VulnerabilityType::decode,
            )?,
            original_status: original_status.map(|s| s as u16),
            replayed_status: replayed_status.map(|s| s as u16),
            original_content_length: original_content_length as u64,
            replayed_content_length: replayed_content_length as u64,
            description: row.get("description"),
            status: decode_with(&status, "anomaly status", AnomalyStatus::decode)?,
            catalog_version: row.get("catalog_version"),
            created_at: parse_ts(&created_at),
        })
    }

    fn row_to_execution(row: &SqliteRow) -> Result<ExecutionState> {
        let id: String = row.get("id");
        let flow_id: String = row.get("flow_id");
        let started_at: String = row.get("started_at");
        let finished_at: Option<String> = row.get("finished_at");
        let total: i64 = row.get("total");
        let done: i64 = row.get("done");
        let failed: i64 = row.get("failed");
        let status: String = row.get("status");
        Ok(ExecutionState {
            id: parse_uuid(&id, "execution")?,
            flow_id: parse_uuid(&flow_id, "flow")?,
            started_at: parse_ts(&started_at),
            finished_at: finished_at.as_deref().map(parse_ts),
            total: total as u64,
            done: done as u64,
            failed: failed as u64,
            status: decode_with(&status, "execution status", ExecutionStatus::decode)?,
        })
    }

    async fn insert_response_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        flow_id: Uuid,
        response: &ResponseRecord,
    ) -> Result<()> {
        let headers_json = to_json(&response.headers, "headers")?;
        sqlx::query(
            r#"
            INSERT INTO responses (
                id, flow_id, owner_kind, owner_id, execution_id, status,
                headers_json, body, content_length, response_time_ms,
                error_kind, captured_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        )
        .bind(response.id.to_string())
        .bind(flow_id.to_string())
        .bind(response.owner_kind.encode())
        .bind(response.owner_id.to_string())
        .bind(response.execution_id.to_string())
        .bind(response.status.map(i64::from))
        .bind(&headers_json)
        .bind(response.body.as_deref())
        .bind(response.content_length as i64)
        .bind(response.response_time_ms as i64)
        .bind(response.error_kind.map(|k| k.encode()))
        .bind(response.captured_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(|e| backend("insert response", e))?;
        Ok(())
    }

    async fn insert_anomaly_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        anomaly: &Anomaly,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO anomalies (
                id, flow_id, test_case_id, kind, severity, confidence,
                is_potential_vulnerability, vulnerability_type,
                original_status, replayed_status,
                original_content_length, replayed_content_length,
                description, status, catalog_version, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        "#,
        )
        .bind(anomaly.id.to_string())
        .bind(anomaly.flow_id.to_string())
        .bind(anomaly.test_case_id.to_string())
        .bind(anomaly.kind.encode())
        .bind(anomaly.severity.encode())
        .bind(anomaly.confidence)
        .bind(i64::from(anomaly.is_potential_vulnerability))
        .bind(anomaly.vulnerability_type.encode())
        .bind(anomaly.original_status.map(i64::from))
        .bind(anomaly.replayed_status.map(i64::from))
        .bind(anomaly.original_content_length as i64)
        .bind(anomaly.replayed_content_length as i64)
        .bind(&anomaly.description)
        .bind(anomaly.status.encode())
        .bind(&anomaly.catalog_version)
        .bind(anomaly.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(|e| backend("insert anomaly", e))?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, flow), err)]
    async fn create_flow(&self, flow: &Flow) -> Result<()> {
        let _guard = self.locks.acquire(flow.id).await;
        let identity_pool_json = to_json(&flow.identity_pool, "identity_pool")?;
        sqlx::query(
            r#"
            INSERT INTO flows (
                id, name, description, target_domain, identity_pool_json,
                confidence_threshold, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        )
        .bind(flow.id.to_string())
        .bind(&flow.name)
        .bind(&flow.description)
        .bind(&flow.target_domain)
        .bind(&identity_pool_json)
        .bind(flow.confidence_threshold)
        .bind(flow.created_at.to_rfc3339())
        .bind(flow.updated_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("insert flow", e))?;
        Ok(())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        let row = sqlx::query("SELECT * FROM flows WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select flow", e))?;
        row.as_ref().map(Self::row_to_flow).transpose()
    }

    #[instrument(skip(self, flow), err)]
    async fn update_flow(&self, flow: &Flow) -> Result<()> {
        let _guard = self.locks.acquire(flow.id).await;
        let identity_pool_json = to_json(&flow.identity_pool, "identity_pool")?;
        let result = sqlx::query(
            r#"
            UPDATE flows SET
                name = ?2, description = ?3, target_domain = ?4,
                identity_pool_json = ?5, confidence_threshold = ?6, updated_at = ?7
            WHERE id = ?1
        "#,
        )
        .bind(flow.id.to_string())
        .bind(&flow.name)
        .bind(&flow.description)
        .bind(&flow.target_domain)
        .bind(&identity_pool_json)
        .bind(flow.confidence_threshold)
        .bind(Utc::now().to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("update flow", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: "flow",
                id: flow.id,
            });
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_flow(&self, id: Uuid) -> Result<bool> {
        let _guard = self.locks.acquire(id).await;
        // Foreign keys cascade the rest of the graph.
        let result = sqlx::query("DELETE FROM flows WHERE id = ?1")
            .bind(id.to_string())
            .execute(&*self.pool)
            .await
            .map_err(|e| backend("delete flow", e))?;
        self.locks.forget(id);
        Ok(result.rows_affected() > 0)
    }

    async fn list_flows(&self, query: &ListQuery) -> Result<Page<Flow>> {
        let (page, per_page) = query.normalized();
        let order = match query.sort.as_deref() {
            Some("name") => "name ASC",
            _ => "created_at DESC",
        };
        let like = query.search.as_ref().map(|s| format!("%{s}%"));
        let (count_sql, select_sql) = if like.is_some() {
            (
                "SELECT COUNT(*) AS total FROM flows WHERE name LIKE ?1 OR description LIKE ?1"
                    .to_string(),
                format!(
                    "SELECT * FROM flows WHERE name LIKE ?1 OR description LIKE ?1 \
                     ORDER BY {order} LIMIT {per_page} OFFSET {offset}",
                    offset = query.offset()
                ),
            )
        } else {
            (
                "SELECT COUNT(*) AS total FROM flows".to_string(),
                format!(
                    "SELECT * FROM flows ORDER BY {order} LIMIT {per_page} OFFSET {offset}",
                    offset = query.offset()
                ),
            )
        };

        let mut count_query = sqlx::query(&count_sql);
        let mut select_query = sqlx::query(&select_sql);
        if let Some(pattern) = &like {
            count_query = count_query.bind(pattern.clone());
            select_query = select_query.bind(pattern.clone());
        }
        let total: i64 = count_query
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| backend("count flows", e))?
            .get("total");
        let rows = select_query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| backend("select flows", e))?;
        let items = rows
            .iter()
            .map(Self::row_to_flow)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total: total as u64,
            page,
            per_page,
        })
    }

    #[instrument(skip(self, request), err)]
    async fn append_request(&self, request: &mut RecordedRequest) -> Result<()> {
        let _guard = self.locks.acquire(request.flow_id).await;
        let flow_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM flows WHERE id = ?1")
            .bind(request.flow_id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("check flow", e))?;
        if flow_exists.is_none() {
            return Err(StoreError::NotFound {
                what: "flow",
                id: request.flow_id,
            });
        }
        let next_ordinal: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM requests WHERE flow_id = ?1",
        )
        .bind(request.flow_id.to_string())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| backend("next ordinal", e))?;
        request.ordinal = next_ordinal as u32;

        let headers_json = to_json(&request.headers, "headers")?;
        let captured_headers_json = to_json(&request.captured_headers, "captured_headers")?;
        sqlx::query(
            r#"
            INSERT INTO requests (
                id, flow_id, ordinal, method, url, headers_json, body,
                captured_status, captured_headers_json, captured_body, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        )
        .bind(request.id.to_string())
        .bind(request.flow_id.to_string())
        .bind(next_ordinal)
        .bind(&request.method)
        .bind(&request.url)
        .bind(&headers_json)
        .bind(request.body.as_deref())
        .bind(i64::from(request.captured_status))
        .bind(&captured_headers_json)
        .bind(request.captured_body.as_deref())
        .bind(request.timestamp.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("insert request", e))?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<RecordedRequest>> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select request", e))?;
        row.as_ref().map(Self::row_to_request).transpose()
    }

    async fn list_requests(&self, flow_id: Uuid) -> Result<Vec<RecordedRequest>> {
        let rows = sqlx::query("SELECT * FROM requests WHERE flow_id = ?1 ORDER BY ordinal ASC")
            .bind(flow_id.to_string())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| backend("select requests", e))?;
        rows.iter().map(Self::row_to_request).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_request(&self, id: Uuid) -> Result<bool> {
        let flow_id: Option<String> =
            sqlx::query_scalar("SELECT flow_id FROM requests WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| backend("select request flow", e))?;
        let Some(flow_id) = flow_id else {
            return Ok(false);
        };
        let _guard = self.locks.acquire(parse_uuid(&flow_id, "flow")?).await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))?;
        // Responses reference their owner polymorphically, so cascade by hand.
        sqlx::query(
            r#"
            DELETE FROM responses
            WHERE owner_id = ?1
               OR owner_id IN (SELECT id FROM test_cases WHERE request_id = ?1)
        "#,
        )
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("delete owned responses", e))?;
        // Test cases (and via FK their anomalies) cascade with the request row.
        let result = sqlx::query("DELETE FROM requests WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("delete request", e))?;
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, cases), err)]
    async fn insert_test_cases(&self, flow_id: Uuid, cases: &[TestCase]) -> Result<u64> {
        let _guard = self.locks.acquire(flow_id).await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))?;
        let mut inserted = 0;
        for case in cases {
            let mutation_json = to_json(&case.mutation, "mutation")?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO test_cases (
                    id, request_id, flow_id, category, rule_id, description,
                    mutation_json, catalog_version, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            )
            .bind(case.id.to_string())
            .bind(case.request_id.to_string())
            .bind(flow_id.to_string())
            .bind(case.category.encode())
            .bind(&case.rule_id)
            .bind(&case.description)
            .bind(&mutation_json)
            .bind(&case.catalog_version)
            .bind(case.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("insert test case", e))?;
            inserted += result.rows_affected();
        }
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(inserted)
    }

    async fn get_test_case(&self, id: Uuid) -> Result<Option<TestCase>> {
        let row = sqlx::query("SELECT * FROM test_cases WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select test case", e))?;
        row.as_ref().map(Self::row_to_test_case).transpose()
    }

    async fn list_test_cases_for_request(&self, request_id: Uuid) -> Result<Vec<TestCase>> {
        let rows = sqlx::query(
            "SELECT * FROM test_cases WHERE request_id = ?1 ORDER BY rule_id ASC, id ASC",
        )
        .bind(request_id.to_string())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("select test cases", e))?;
        rows.iter().map(Self::row_to_test_case).collect()
    }

    async fn list_test_cases_for_flow(&self, flow_id: Uuid) -> Result<Vec<TestCase>> {
        let rows = sqlx::query(
            "SELECT * FROM test_cases WHERE flow_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(flow_id.to_string())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("select flow test cases", e))?;
        rows.iter().map(Self::row_to_test_case).collect()
    }

    #[instrument(skip(self, response), err)]
    async fn record_response(&self, flow_id: Uuid, response: &ResponseRecord) -> Result<()> {
        let _guard = self.locks.acquire(flow_id).await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))?;
        Self::insert_response_tx(&mut tx, flow_id, response).await?;
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(())
    }

    async fn latest_response(
        &self,
        owner_kind: OwnerKind,
        owner_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Option<ResponseRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM responses
            WHERE owner_kind = ?1 AND owner_id = ?2 AND execution_id = ?3
            ORDER BY captured_at DESC, rowid DESC
            LIMIT 1
        "#,
        )
        .bind(owner_kind.encode())
        .bind(owner_id.to_string())
        .bind(execution_id.to_string())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| backend("select latest response", e))?;
        row.as_ref().map(Self::row_to_response).transpose()
    }

    #[instrument(skip(self, response, anomalies), err)]
    async fn commit_pair(
        &self,
        flow_id: Uuid,
        response: &ResponseRecord,
        anomalies: &[Anomaly],
    ) -> Result<()> {
        let _guard = self.locks.acquire(flow_id).await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))?;
        Self::insert_response_tx(&mut tx, flow_id, response).await?;
        for anomaly in anomalies {
            Self::insert_anomaly_tx(&mut tx, anomaly).await?;
        }
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(())
    }

    #[instrument(skip(self, anomalies), err)]
    async fn insert_anomalies(&self, flow_id: Uuid, anomalies: &[Anomaly]) -> Result<()> {
        let _guard = self.locks.acquire(flow_id).await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend("tx begin", e))?;
        for anomaly in anomalies {
            Self::insert_anomaly_tx(&mut tx, anomaly).await?;
        }
        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(())
    }

    async fn get_anomaly(&self, id: Uuid) -> Result<Option<Anomaly>> {
        let row = sqlx::query("SELECT * FROM anomalies WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select anomaly", e))?;
        row.as_ref().map(Self::row_to_anomaly).transpose()
    }

    #[instrument(skip(self, anomaly), err)]
    async fn update_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        let _guard = self.locks.acquire(anomaly.flow_id).await;
        let result = sqlx::query(
            "UPDATE anomalies SET status = ?2, description = ?3 WHERE id = ?1",
        )
        .bind(anomaly.id.to_string())
        .bind(anomaly.status.encode())
        .bind(&anomaly.description)
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("update anomaly", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: "anomaly",
                id: anomaly.id,
            });
        }
        Ok(())
    }

    async fn list_anomalies(&self, flow_id: Uuid, query: &ListQuery) -> Result<Page<Anomaly>> {
        let (page, per_page) = query.normalized();
        let order = match query.sort.as_deref() {
            Some("confidence") => "confidence DESC",
            Some("severity") => {
                "CASE severity WHEN 'critical' THEN 4 WHEN 'high' THEN 3 \
                 WHEN 'medium' THEN 2 WHEN 'low' THEN 1 ELSE 0 END DESC"
            }
            _ => "created_at DESC",
        };
        let like = query.search.as_ref().map(|s| format!("%{s}%"));
        let filter = if like.is_some() {
            "flow_id = ?1 AND description LIKE ?2"
        } else {
            "flow_id = ?1"
        };
        let count_sql = format!("SELECT COUNT(*) AS total FROM anomalies WHERE {filter}");
        let select_sql = format!(
            "SELECT * FROM anomalies WHERE {filter} ORDER BY {order} \
             LIMIT {per_page} OFFSET {offset}",
            offset = query.offset()
        );
        let mut count_query = sqlx::query(&count_sql).bind(flow_id.to_string());
        let mut select_query = sqlx::query(&select_sql).bind(flow_id.to_string());
        if let Some(pattern) = &like {
            count_query = count_query.bind(pattern.clone());
            select_query = select_query.bind(pattern.clone());
        }
        let total: i64 = count_query
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| backend("count anomalies", e))?
            .get("total");
        let rows = select_query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| backend("select anomalies", e))?;
        let items = rows
            .iter()
            .map(Self::row_to_anomaly)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total: total as u64,
            page,
            per_page,
        })
    }

    async fn list_all_anomalies(&self, flow_id: Uuid) -> Result<Vec<Anomaly>> {
        let rows = sqlx::query(
            "SELECT * FROM anomalies WHERE flow_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(flow_id.to_string())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("select all anomalies", e))?;
        rows.iter().map(Self::row_to_anomaly).collect()
    }

    #[instrument(skip(self, execution), err)]
    async fn create_execution(&self, execution: &ExecutionState) -> Result<()> {
        let _guard = self.locks.acquire(execution.flow_id).await;
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, flow_id, started_at, finished_at, total, done, failed, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.flow_id.to_string())
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.finished_at.map(|t| t.to_rfc3339()))
        .bind(execution.total as i64)
        .bind(execution.done as i64)
        .bind(execution.failed as i64)
        .bind(execution.status.encode())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("insert execution", e))?;
        Ok(())
    }

    async fn update_execution(&self, execution: &ExecutionState) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE executions SET
                finished_at = ?2, total = ?3, done = ?4, failed = ?5, status = ?6
            WHERE id = ?1
        "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.finished_at.map(|t| t.to_rfc3339()))
        .bind(execution.total as i64)
        .bind(execution.done as i64)
        .bind(execution.failed as i64)
        .bind(execution.status.encode())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("update execution", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: "execution",
                id: execution.id,
            });
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionState>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| backend("select execution", e))?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn list_executions(&self, flow_id: Uuid) -> Result<Vec<ExecutionState>> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE flow_id = ?1 ORDER BY started_at DESC",
        )
        .bind(flow_id.to_string())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| backend("select executions", e))?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    #[instrument(skip(self), err)]
    async fn reconcile_stale_executions(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'failed', finished_at = ?1 WHERE status = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(|e| backend("reconcile executions", e))?;
        Ok(result.rows_affected())
    }
}
