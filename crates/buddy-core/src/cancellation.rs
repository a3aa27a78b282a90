use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use buddy_types::TaskId;

/// One cancellation token per running task.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<TaskId, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the task's token, creating it on first use.
    pub async fn create(&self, task_id: &TaskId) -> CancellationToken {
        self.tokens
            .write()
            .await
            .entry(task_id.clone())
            .or_default()
            .clone()
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<CancellationToken> {
        self.tokens.read().await.get(task_id).cloned()
    }

    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        match self.tokens.read().await.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let tokens = self.tokens.read().await;
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    pub async fn remove(&self, task_id: &TaskId) {
        self.tokens.write().await.remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_existing_token() {
        let registry = CancellationRegistry::new();
        let task_id = TaskId::new("task_1");
        let token = registry.create(&task_id).await;
        assert!(registry.cancel(&task_id).await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel(&TaskId::new("task_missing")).await);
    }
}
