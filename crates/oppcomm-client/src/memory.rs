use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use oppcomm_core::{Opportunity, UpdatePayload};
use serde_json::json;

use crate::{CrmError, OpportunityPage, PageCursor, PageRequest, Pipeline, RemoteStore};

/// In-process `RemoteStore` that records every write.
///
/// Updates are applied to the stored records the way the CRM applies them, so
/// a second pass over the same store sees the written values.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    pipelines: Vec<Pipeline>,
    records: Vec<(String, Opportunity)>,
    updates: Vec<UpdatePayload>,
    failing_updates: HashSet<String>,
    failing_pipelines: HashSet<String>,
    fail_pipeline_listing: bool,
    pipeline_list_calls: usize,
    get_calls: usize,
}

fn status_error(status: u16, url: String, body: &str) -> CrmError {
    CrmError::HttpStatus {
        status,
        url,
        body: body.to_string(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `pipeline_id` (if new) and store `opportunity` under it.
    pub fn insert(&self, pipeline_id: &str, opportunity: Opportunity) {
        let mut state = self.lock();
        if !state.pipelines.iter().any(|p| p.id == pipeline_id) {
            state.pipelines.push(Pipeline {
                id: pipeline_id.to_string(),
                name: None,
            });
        }
        state.records.push((pipeline_id.to_string(), opportunity));
    }

    pub fn add_pipeline(&self, pipeline_id: &str) {
        let mut state = self.lock();
        if !state.pipelines.iter().any(|p| p.id == pipeline_id) {
            state.pipelines.push(Pipeline {
                id: pipeline_id.to_string(),
                name: None,
            });
        }
    }

    /// Reject writes to `opportunity_id` with a validation error.
    pub fn fail_updates_for(&self, opportunity_id: &str) {
        self.lock().failing_updates.insert(opportunity_id.to_string());
    }

    pub fn fail_listing_for(&self, pipeline_id: &str) {
        self.lock().failing_pipelines.insert(pipeline_id.to_string());
    }

    pub fn fail_pipeline_listing(&self) {
        self.lock().fail_pipeline_listing = true;
    }

    pub fn updates(&self) -> Vec<UpdatePayload> {
        self.lock().updates.clone()
    }

    pub fn record(&self, opportunity_id: &str) -> Option<Opportunity> {
        self.lock()
            .records
            .iter()
            .find(|(_, o)| o.id == opportunity_id)
            .map(|(_, o)| o.clone())
    }

    pub fn pipeline_list_calls(&self) -> usize {
        self.lock().pipeline_list_calls
    }

    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, CrmError> {
        let mut state = self.lock();
        state.pipeline_list_calls += 1;
        if state.fail_pipeline_listing {
            return Err(status_error(401, "memory://pipelines/".into(), "unauthorized"));
        }
        Ok(state.pipelines.clone())
    }

    async fn list_opportunities(
        &self,
        pipeline_id: &str,
        status: &str,
        page: &PageRequest,
    ) -> Result<OpportunityPage, CrmError> {
        let state = self.lock();
        if state.failing_pipelines.contains(pipeline_id) {
            return Err(status_error(
                500,
                format!("memory://pipelines/{pipeline_id}/opportunities"),
                "internal error",
            ));
        }

        let matching: Vec<&Opportunity> = state
            .records
            .iter()
            .filter(|(p, o)| p == pipeline_id && (status == "all" || o.status.as_deref() == Some(status)))
            .map(|(_, o)| o)
            .collect();
        let start = match &page.cursor {
            Some(cursor) => matching
                .iter()
                .position(|o| o.id == cursor.start_after_id)
                .map_or(matching.len(), |i| i + 1),
            None => 0,
        };
        let limit = page.limit.max(1) as usize;
        let opportunities: Vec<Opportunity> = matching
            .iter()
            .skip(start)
            .take(limit)
            .map(|o| (*o).clone())
            .collect();
        let next = match opportunities.last() {
            Some(last) if start + opportunities.len() < matching.len() => Some(PageCursor {
                start_after_id: last.id.clone(),
                start_after: None,
            }),
            _ => None,
        };
        Ok(OpportunityPage {
            opportunities,
            next,
        })
    }

    async fn get_opportunity(
        &self,
        pipeline_id: &str,
        opportunity_id: &str,
    ) -> Result<Option<Opportunity>, CrmError> {
        let mut state = self.lock();
        state.get_calls += 1;
        Ok(state
            .records
            .iter()
            .find(|(p, o)| p == pipeline_id && o.id == opportunity_id)
            .map(|(_, o)| o.clone()))
    }

    async fn update_opportunity(&self, payload: &UpdatePayload) -> Result<(), CrmError> {
        let mut state = self.lock();
        let url = format!(
            "memory://pipelines/{}/opportunities/{}",
            payload.pipeline_id, payload.opportunity_id
        );
        if state.failing_updates.contains(&payload.opportunity_id) {
            return Err(status_error(422, url, r#"{"msg":"validation failed"}"#));
        }
        let Some((_, record)) = state
            .records
            .iter_mut()
            .find(|(p, o)| *p == payload.pipeline_id && o.id == payload.opportunity_id)
        else {
            return Err(status_error(404, url, "not found"));
        };
        record.monetary_value = Some(json!(payload.monetary_value));
        if let Some(status) = &payload.status {
            record.status = Some(status.clone());
        }
        if let Some(stage_id) = &payload.stage_id {
            record.stage_id = Some(stage_id.clone());
        }
        state.updates.push(payload.clone());
        Ok(())
    }
}
