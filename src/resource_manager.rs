//! Resource management
//!
//! [ResourceManager] provides a simple way to bound the resources used by
//! concurrent partition tasks. Resource management is performed using a
//! Tokio Semaphore for each type of resource. Permits are owned, so they
//! can travel into spawned tasks and are released when the task drops them.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::QuadStemError;

#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for concurrent partition tasks.
    tasks: Option<Arc<Semaphore>>,

    /// Optional semaphore for memory (bytes).
    memory: Option<Arc<Semaphore>>,

    /// Optional total memory pool in bytes.
    total_memory: Option<usize>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(task_limit: Option<usize>, memory_limit: Option<usize>) -> Self {
        Self {
            tasks: task_limit.map(|n| Arc::new(Semaphore::new(n))),
            memory: memory_limit.map(|n| Arc::new(Semaphore::new(n))),
            total_memory: memory_limit,
        }
    }

    /// Acquire a task resource.
    pub async fn task(&self) -> Result<Option<OwnedSemaphorePermit>, QuadStemError> {
        optional_acquire(&self.tasks, 1).await
    }

    /// Acquire memory resource.
    pub async fn memory(
        &self,
        bytes: usize,
    ) -> Result<Option<OwnedSemaphorePermit>, QuadStemError> {
        if let Some(total_memory) = self.total_memory {
            if bytes > total_memory {
                return Err(QuadStemError::InsufficientMemory {
                    requested: bytes,
                    total: total_memory,
                });
            };
        };
        optional_acquire(&self.memory, bytes).await
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Arc<Semaphore>>,
    n: usize,
) -> Result<Option<OwnedSemaphorePermit>, QuadStemError> {
    let n = n.try_into()?;
    if let Some(sem) = sem {
        sem.clone()
            .acquire_many_owned(n)
            .await
            .map(Some)
            .map_err(|err| err.into())
    } else {
        Ok(None)
    }
}
