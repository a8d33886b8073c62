use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::graph::{ValidationResult, WorkflowGraph};
use codeflow_core::types::{
    RunFilter, Workflow, WorkflowFilter, WorkflowId, WorkflowSpec, WorkflowStatus,
};

use super::Shared;

/// Workflow definitions. Graphs are replaced wholesale, never patched.
#[derive(Clone)]
pub struct WorkflowRegistry {
    shared: Arc<Shared>,
}

impl WorkflowRegistry {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Create a `Draft` workflow. The graph is validated right away; an
    /// invalid graph is kept (drafts may be incomplete) but cannot run until
    /// a valid one replaces it.
    pub async fn create(&self, spec: WorkflowSpec) -> Result<(Workflow, ValidationResult)> {
        if spec.name.trim().is_empty() {
            return Err(CodeflowError::InvalidRequest("workflow name is empty".into()));
        }
        let validation = spec.graph.validate();
        let now = Utc::now();
        let workflow = Workflow {
            id: WorkflowId::new(),
            name: spec.name,
            description: spec.description,
            status: WorkflowStatus::Draft,
            graph: spec.graph,
            triggers: spec.triggers,
            category: spec.category,
            is_template: spec.is_template,
            graph_version: 1,
            validated_version: validation.is_valid().then_some(1),
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        self.shared.stores.workflows.create(workflow.clone()).await?;
        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            valid = validation.is_valid(),
            "Workflow created"
        );
        Ok((workflow, validation))
    }

    pub async fn get(&self, id: &WorkflowId) -> Result<Workflow> {
        self.shared
            .stores
            .workflows
            .get(id)
            .await?
            .ok_or_else(|| CodeflowError::not_found("workflow", id))
    }

    pub async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        self.shared.stores.workflows.list(filter).await
    }

    pub async fn templates(&self) -> Result<Vec<Workflow>> {
        self.list(&WorkflowFilter {
            is_template: Some(true),
            ..Default::default()
        })
        .await
    }

    /// Validate the stored graph and record the outcome for its version.
    pub async fn validate(&self, id: &WorkflowId) -> Result<ValidationResult> {
        let _guard = self.shared.locks.workflow(id).await;
        let mut workflow = self.get(id).await?;
        let validation = workflow.graph.validate();
        let validated = validation.is_valid().then_some(workflow.graph_version);
        if workflow.validated_version != validated {
            workflow.validated_version = validated;
            workflow.updated_at = Utc::now();
            self.shared.stores.workflows.update(workflow).await?;
        }
        Ok(validation)
    }

    /// Replace the whole graph. Bumps `graph_version`; runs already started
    /// keep the graph they were submitted with.
    pub async fn replace_graph(
        &self,
        id: &WorkflowId,
        graph: WorkflowGraph,
    ) -> Result<(Workflow, ValidationResult)> {
        let _guard = self.shared.locks.workflow(id).await;
        let mut workflow = self.get(id).await?;
        let validation = graph.validate();

        workflow.graph = graph;
        workflow.graph_version += 1;
        workflow.validated_version = validation.is_valid().then_some(workflow.graph_version);
        workflow.updated_at = Utc::now();
        self.shared.stores.workflows.update(workflow.clone()).await?;

        if !validation.is_valid() {
            warn!(
                workflow_id = %id,
                version = workflow.graph_version,
                problems = validation.errors.len(),
                "Workflow graph replaced with an invalid graph"
            );
        }
        Ok((workflow, validation))
    }

    /// `Active` permits runs; `Paused` blocks new runs but leaves running
    /// ones alone.
    pub async fn set_status(&self, id: &WorkflowId, status: WorkflowStatus) -> Result<Workflow> {
        let _guard = self.shared.locks.workflow(id).await;
        let mut workflow = self.get(id).await?;
        workflow.status = status;
        workflow.updated_at = Utc::now();
        self.shared.stores.workflows.update(workflow.clone()).await?;
        info!(workflow_id = %id, status = %status, "Workflow status changed");
        Ok(workflow)
    }

    /// Copy a workflow (usually a template) into a new `Draft`.
    pub async fn clone_from(
        &self,
        source: &WorkflowId,
        name: impl Into<String>,
    ) -> Result<(Workflow, ValidationResult)> {
        let source = self.get(source).await?;
        let spec = WorkflowSpec {
            name: name.into(),
            description: source.description,
            graph: source.graph,
            triggers: source.triggers,
            category: source.category,
            is_template: false,
        };
        self.create(spec).await
    }

    /// Delete a workflow with no runs in flight.
    pub async fn delete(&self, id: &WorkflowId) -> Result<()> {
        let _guard = self.shared.locks.workflow(id).await;
        self.get(id).await?;

        let runs = self
            .shared
            .stores
            .runs
            .list(&RunFilter {
                workflow_id: Some(id.clone()),
                status: None,
            })
            .await?;
        let active_runs = runs.iter().filter(|r| !r.status.is_terminal()).count();
        if active_runs > 0 {
            return Err(CodeflowError::WorkflowInUse {
                workflow: id.clone(),
                active_runs,
            });
        }

        self.shared.stores.workflows.delete(id).await?;
        info!(workflow_id = %id, "Workflow deleted");
        Ok(())
    }

    /// Hold the workflow's lock. Locking calls on the same workflow wait
    /// until the guard drops.
    pub(crate) async fn lock(&self, id: &WorkflowId) -> OwnedMutexGuard<()> {
        self.shared.locks.workflow(id).await
    }

    pub async fn touch_last_run(&self, id: &WorkflowId) -> Result<Workflow> {
        let _guard = self.shared.locks.workflow(id).await;
        let mut workflow = self.get(id).await?;
        let now = Utc::now();
        workflow.last_run_at = Some(now);
        workflow.updated_at = now;
        self.shared.stores.workflows.update(workflow.clone()).await?;
        Ok(workflow)
    }
}
