use std::collections::BTreeMap;
use std::sync::RwLock;

use futures::future::BoxFuture;

use codeflow_core::error::{CodeflowError, Result};
use codeflow_core::traits::{Entity, Repository};

/// Process-local repository. Cloned values in, cloned values out.
pub struct MemoryStore<T: Entity> {
    items: RwLock<BTreeMap<T::Id, T>>,
}

impl<T: Entity> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Entity> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned(e: impl std::fmt::Display) -> CodeflowError {
    CodeflowError::Database(format!("memory store lock poisoned: {e}"))
}

impl<T: Entity> Repository<T> for MemoryStore<T> {
    fn create(&self, entity: T) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut items = self.items.write().map_err(poisoned)?;
            let id = entity.id().clone();
            if items.contains_key(&id) {
                return Err(CodeflowError::InvalidRequest(format!(
                    "{} {id} already exists",
                    T::KIND
                )));
            }
            items.insert(id, entity);
            Ok(())
        })
    }

    fn update(&self, entity: T) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut items = self.items.write().map_err(poisoned)?;
            match items.get_mut(entity.id()) {
                Some(slot) => {
                    *slot = entity;
                    Ok(())
                }
                None => Err(CodeflowError::not_found(T::KIND, entity.id())),
            }
        })
    }

    fn get(&self, id: &T::Id) -> BoxFuture<'_, Result<Option<T>>> {
        let id = id.clone();
        Box::pin(async move {
            let items = self.items.read().map_err(poisoned)?;
            Ok(items.get(&id).cloned())
        })
    }

    fn list(&self, filter: &T::Filter) -> BoxFuture<'_, Result<Vec<T>>> {
        let filter = filter.clone();
        Box::pin(async move {
            let items = self.items.read().map_err(poisoned)?;
            Ok(items
                .values()
                .filter(|item| item.matches(&filter))
                .cloned()
                .collect())
        })
    }

    fn delete(&self, id: &T::Id) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move {
            let mut items = self.items.write().map_err(poisoned)?;
            Ok(items.remove(&id).is_some())
        })
    }
}
