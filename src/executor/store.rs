use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::runtime::instance::ProcessInstance;

/// Persistence seam for process instances. Saves carry the version the
/// caller loaded; a stale version fails with a conflict, which the retrying
/// transaction layer treats as transient.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert(&self, instance: ProcessInstance) -> Result<()>;
    async fn load(&self, id: Uuid) -> Result<Option<(ProcessInstance, u64)>>;
    async fn save(&self, instance: ProcessInstance, version: u64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<Uuid, (ProcessInstance, u64)>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert(&self, instance: ProcessInstance) -> Result<()> {
        self.instances.insert(instance.id, (instance, 1));
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<(ProcessInstance, u64)>> {
        Ok(self.instances.get(&id).map(|entry| entry.clone()))
    }

    async fn save(&self, instance: ProcessInstance, version: u64) -> Result<()> {
        let id = instance.id;
        let mut entry = self
            .instances
            .get_mut(&id)
            .ok_or(WorkflowError::UnknownInstance(id))?;
        if entry.1 != version {
            return Err(WorkflowError::Conflict(format!("instance {}", id)));
        }
        *entry = (instance, version + 1);
        Ok(())
    }
}
