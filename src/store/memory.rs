//! In-memory store for tests and ephemeral runs. Stores the whole graph
//! behind one `RwLock`; serialization guarantees are trivially met.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::model::{
    Anomaly, ExecutionState, Flow, RecordedRequest, ResponseRecord, TestCase,
};
use crate::types::{ExecutionStatus, OwnerKind};

use super::{ListQuery, Page, Result, Store, StoreError};

#[derive(Default)]
struct Graph {
    flows: FxHashMap<Uuid, Flow>,
    requests: FxHashMap<Uuid, RecordedRequest>,
    test_cases: FxHashMap<Uuid, TestCase>,
    responses: FxHashMap<Uuid, (Uuid, ResponseRecord)>, // response id -> (flow, record)
    anomalies: FxHashMap<Uuid, Anomaly>,
    executions: FxHashMap<Uuid, ExecutionState>,
}

/// Volatile process-local store. Fast, non-durable; suitable for tests
/// and ephemeral runs.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Graph>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Graph> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Graph> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn remove_request_subtree(graph: &mut Graph, request_id: Uuid) {
    let case_ids: Vec<Uuid> = graph
        .test_cases
        .values()
        .filter(|tc| tc.request_id == request_id)
        .map(|tc| tc.id)
        .collect();
    for case_id in &case_ids {
        graph.test_cases.remove(case_id);
        graph.anomalies.retain(|_, a| a.test_case_id != *case_id);
        graph.responses.retain(|_, (_, r)| r.owner_id != *case_id);
    }
    graph.responses.retain(|_, (_, r)| r.owner_id != request_id);
    graph.requests.remove(&request_id);
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_flow(&self, flow: &Flow) -> Result<()> {
        self.write().flows.insert(flow.id, flow.clone());
        Ok(())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        Ok(self.read().flows.get(&id).cloned())
    }

    async fn update_flow(&self, flow: &Flow) -> Result<()> {
        let mut graph = self.write();
        let entry = graph.flows.get_mut(&flow.id).ok_or(StoreError::NotFound {
            what: "flow",
            id: flow.id,
        })?;
        *entry = Flow {
            updated_at: Utc::now(),
            created_at: entry.created_at,
            ..flow.clone()
        };
        Ok(())
    }

    async fn delete_flow(&self, id: Uuid) -> Result<bool> {
        let mut graph = self.write();
        if graph.flows.remove(&id).is_none() {
            return Ok(false);
        }
        let request_ids: Vec<Uuid> = graph
            .requests
            .values()
            .filter(|r| r.flow_id == id)
            .map(|r| r.id)
            .collect();
        for request_id in request_ids {
            remove_request_subtree(&mut graph, request_id);
        }
        graph.anomalies.retain(|_, a| a.flow_id != id);
        graph.responses.retain(|_, (flow, _)| *flow != id);
        graph.executions.retain(|_, e| e.flow_id != id);
        Ok(true)
    }

    async fn list_flows(&self, query: &ListQuery) -> Result<Page<Flow>> {
        let graph = self.read();
        let needle = query.search.as_deref().map(str::to_lowercase);
        let mut flows: Vec<Flow> = graph
            .flows
            .values()
            .filter(|f| match &needle {
                Some(n) => {
                    f.name.to_lowercase().contains(n)
                        || f.description.to_lowercase().contains(n)
                }
                None => true,
            })
            .cloned()
            .collect();
        match query.sort.as_deref() {
            Some("name") => flows.sort_by(|a, b| a.name.cmp(&b.name)),
            _ => flows.sort_by_key(|f| std::cmp::Reverse(f.created_at)),
        }
        Ok(Page::slice(flows, query))
    }

    async fn append_request(&self, request: &mut RecordedRequest) -> Result<()> {
        let mut graph = self.write();
        if !graph.flows.contains_key(&request.flow_id) {
            return Err(StoreError::NotFound {
                what: "flow",
                id: request.flow_id,
            });
        }
        let next_ordinal = graph
            .requests
            .values()
            .filter(|r| r.flow_id == request.flow_id)
            .map(|r| r.ordinal)
            .max()
            .unwrap_or(0)
            + 1;
        request.ordinal = next_ordinal;
        graph.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<RecordedRequest>> {
        Ok(self.read().requests.get(&id).cloned())
    }

    async fn list_requests(&self, flow_id: Uuid) -> Result<Vec<RecordedRequest>> {
        let graph = self.read();
        let mut requests: Vec<RecordedRequest> = graph
            .requests
            .values()
            .filter(|r| r.flow_id == flow_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.ordinal);
        Ok(requests)
    }

    async fn delete_request(&self, id: Uuid) -> Result<bool> {
        let mut graph = self.write();
        if !graph.requests.contains_key(&id) {
            return Ok(false);
        }
        remove_request_subtree(&mut graph, id);
        Ok(true)
    }

    async fn insert_test_cases(&self, _flow_id: Uuid, cases: &[TestCase]) -> Result<u64> {
        let mut graph = self.write();
        let mut inserted = 0;
        for case in cases {
            let duplicate = graph
                .test_cases
                .values()
                .any(|tc| tc.request_id == case.request_id && tc.mutation == case.mutation);
            if !duplicate {
                graph.test_cases.insert(case.id, case.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_test_case(&self, id: Uuid) -> Result<Option<TestCase>> {
        Ok(self.read().test_cases.get(&id).cloned())
    }

    async fn list_test_cases_for_request(&self, request_id: Uuid) -> Result<Vec<TestCase>> {
        let graph = self.read();
        let mut cases: Vec<TestCase> = graph
            .test_cases
            .values()
            .filter(|tc| tc.request_id == request_id)
            .cloned()
            .collect();
        cases.sort_by(|a, b| a.rule_id.cmp(&b.rule_id).then(a.id.cmp(&b.id)));
        Ok(cases)
    }

    async fn list_test_cases_for_flow(&self, flow_id: Uuid) -> Result<Vec<TestCase>> {
        let graph = self.read();
        let request_ids: Vec<Uuid> = graph
            .requests
            .values()
            .filter(|r| r.flow_id == flow_id)
            .map(|r| r.id)
            .collect();
        let mut cases: Vec<TestCase> = graph
            .test_cases
            .values()
            .filter(|tc| request_ids.contains(&tc.request_id))
            .cloned()
            .collect();
        cases.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(cases)
    }

    async fn record_response(&self, flow_id: Uuid, response: &ResponseRecord) -> Result<()> {
        self.write()
            .responses
            .insert(response.id, (flow_id, response.clone()));
        Ok(())
    }

    async fn latest_response(
        &self,
        owner_kind: OwnerKind,
        owner_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Option<ResponseRecord>> {
        let graph = self.read();
        Ok(graph
            .responses
            .values()
            .map(|(_, r)| r)
            .filter(|r| {
                r.owner_kind == owner_kind
                    && r.owner_id == owner_id
                    && r.execution_id == execution_id
            })
            .max_by_key(|r| r.captured_at)
            .cloned())
    }

    async fn commit_pair(
        &self,
        flow_id: Uuid,
        response: &ResponseRecord,
        anomalies: &[Anomaly],
    ) -> Result<()> {
        let mut graph = self.write();
        graph
            .responses
            .insert(response.id, (flow_id, response.clone()));
        for anomaly in anomalies {
            graph.anomalies.insert(anomaly.id, anomaly.clone());
        }
        Ok(())
    }

    async fn insert_anomalies(&self, _flow_id: Uuid, anomalies: &[Anomaly]) -> Result<()> {
        let mut graph = self.write();
        for anomaly in anomalies {
            graph.anomalies.insert(anomaly.id, anomaly.clone());
        }
        Ok(())
    }

    async fn get_anomaly(&self, id: Uuid) -> Result<Option<Anomaly>> {
        Ok(self.read().anomalies.get(&id).cloned())
    }

    async fn update_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        let mut graph = self.write();
        let entry = graph
            .anomalies
            .get_mut(&anomaly.id)
            .ok_or(StoreError::NotFound {
                what: "anomaly",
                id: anomaly.id,
            })?;
        *entry = anomaly.clone();
        Ok(())
    }

    async fn list_anomalies(&self, flow_id: Uuid, query: &ListQuery) -> Result<Page<Anomaly>> {
        let graph = self.read();
        let needle = query.search.as_deref().map(str::to_lowercase);
        let mut anomalies: Vec<Anomaly> = graph
            .anomalies
            .values()
            .filter(|a| a.flow_id == flow_id)
            .filter(|a| match &needle {
                Some(n) => a.description.to_lowercase().contains(n),
                None => true,
            })
            .cloned()
            .collect();
        match query.sort.as_deref() {
            Some("confidence") => {
                anomalies.sort_by(|a, b| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            Some("severity") => anomalies.sort_by(|a, b| b.severity.cmp(&a.severity)),
            _ => anomalies.sort_by_key(|a| std::cmp::Reverse(a.created_at)),
        }
        Ok(Page::slice(anomalies, query))
    }

    async fn list_all_anomalies(&self, flow_id: Uuid) -> Result<Vec<Anomaly>> {
        let graph = self.read();
        let mut anomalies: Vec<Anomaly> = graph
            .anomalies
            .values()
            .filter(|a| a.flow_id == flow_id)
            .cloned()
            .collect();
        anomalies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(anomalies)
    }

    async fn create_execution(&self, execution: &ExecutionState) -> Result<()> {
        self.write()
            .executions
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &ExecutionState) -> Result<()> {
        let mut graph = self.write();
        let entry = graph
            .executions
            .get_mut(&execution.id)
            .ok_or(StoreError::NotFound {
                what: "execution",
                id: execution.id,
            })?;
        *entry = execution.clone();
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionState>> {
        Ok(self.read().executions.get(&id).cloned())
    }

    async fn list_executions(&self, flow_id: Uuid) -> Result<Vec<ExecutionState>> {
        let graph = self.read();
        let mut executions: Vec<ExecutionState> = graph
            .executions
            .values()
            .filter(|e| e.flow_id == flow_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| std::cmp::Reverse(e.started_at));
        Ok(executions)
    }

    async fn reconcile_stale_executions(&self) -> Result<u64> {
        let mut graph = self.write();
        let mut changed = 0;
        for execution in graph.executions.values_mut() {
            if execution.status == ExecutionStatus::Running {
                execution.status = ExecutionStatus::Failed;
                execution.finished_at = Some(Utc::now());
                changed += 1;
            }
        }
        Ok(changed)
    }
}
