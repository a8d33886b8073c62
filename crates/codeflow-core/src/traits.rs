use std::fmt::Display;
use std::hash::Hash;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::event::Notification;
use crate::types::*;

/// A record kept by the persistence collaborator.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Ord + Display + Send + Sync + 'static;
    type Filter: Clone + Default + Send + Sync + 'static;

    /// Short name used in errors and as the storage namespace.
    const KIND: &'static str;

    fn id(&self) -> &Self::Id;

    fn matches(&self, filter: &Self::Filter) -> bool;
}

/// Persistence collaborator: single-entity atomic CRUD.
///
/// Implementations give no read-modify-write protection; callers that need
/// it serialize on the entity themselves.
pub trait Repository<T: Entity>: Send + Sync + 'static {
    /// Insert a new entity. Fails if the id is taken.
    fn create(&self, entity: T) -> BoxFuture<'_, Result<()>>;

    /// Replace an existing entity. Fails with `NotFound` if absent.
    fn update(&self, entity: T) -> BoxFuture<'_, Result<()>>;

    fn get(&self, id: &T::Id) -> BoxFuture<'_, Result<Option<T>>>;

    /// Entities matching `filter`, ordered by id.
    fn list(&self, filter: &T::Filter) -> BoxFuture<'_, Result<Vec<T>>>;

    /// Remove an entity. Returns whether it existed.
    fn delete(&self, id: &T::Id) -> BoxFuture<'_, Result<bool>>;
}

/// External publish/subscribe transport for outbound notifications.
pub trait EventChannel: Send + Sync + 'static {
    /// Channel name for logs (e.g. "websocket").
    fn name(&self) -> &str;

    /// Deliver one event. An error means the channel is down; the caller
    /// decides whether to retry.
    fn publish(&self, event: &Notification) -> BoxFuture<'_, Result<()>>;
}

impl Entity for Agent {
    type Id = AgentId;
    type Filter = AgentFilter;
    const KIND: &'static str = "agent";

    fn id(&self) -> &AgentId {
        &self.id
    }

    fn matches(&self, filter: &AgentFilter) -> bool {
        filter.status.map_or(true, |s| s == self.status)
            && filter.agent_type.map_or(true, |t| t == self.agent_type)
    }
}

impl Entity for Task {
    type Id = TaskId;
    type Filter = TaskFilter;
    const KIND: &'static str = "task";

    fn id(&self) -> &TaskId {
        &self.id
    }

    fn matches(&self, filter: &TaskFilter) -> bool {
        filter.status.map_or(true, |s| s == self.status)
            && filter.priority.map_or(true, |p| p == self.priority)
            && filter
                .assigned_agent_id
                .as_ref()
                .map_or(true, |a| self.assigned_agent_id.as_ref() == Some(a))
            && filter
                .workflow_id
                .as_ref()
                .map_or(true, |w| self.workflow_id.as_ref() == Some(w))
            && filter
                .run_id
                .as_ref()
                .map_or(true, |r| self.run_id.as_ref() == Some(r))
    }
}

impl Entity for Workflow {
    type Id = WorkflowId;
    type Filter = WorkflowFilter;
    const KIND: &'static str = "workflow";

    fn id(&self) -> &WorkflowId {
        &self.id
    }

    fn matches(&self, filter: &WorkflowFilter) -> bool {
        filter.status.map_or(true, |s| s == self.status)
            && filter
                .category
                .as_ref()
                .map_or(true, |c| self.category.as_ref() == Some(c))
            && filter.is_template.map_or(true, |t| t == self.is_template)
    }
}

impl Entity for WorkflowRun {
    type Id = RunId;
    type Filter = RunFilter;
    const KIND: &'static str = "run";

    fn id(&self) -> &RunId {
        &self.id
    }

    fn matches(&self, filter: &RunFilter) -> bool {
        filter
            .workflow_id
            .as_ref()
            .map_or(true, |w| *w == self.workflow_id)
            && filter.status.map_or(true, |s| s == self.status)
    }
}
