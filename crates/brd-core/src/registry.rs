//! Task registry - opaque id to task handle map with add/remove notifications

use brd_types::RegistryEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Keeps running tasks addressable by id
pub struct TaskRegistry<T> {
    tasks: RwLock<HashMap<String, T>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl<T: Clone> TaskRegistry<T> {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            tasks: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Register `task`, generating an id when none is given. Returns the id.
    ///
    /// An existing entry under the same id is replaced.
    pub fn add(&self, task: T, id: Option<String>) -> String {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.tasks.write().insert(id.clone(), task);
        debug!("Registered task {}", id);
        let _ = self.event_tx.send(RegistryEvent::Added { id: id.clone() });
        id
    }

    /// Remove `id`. Unknown ids are ignored.
    pub fn remove(&self, id: &str) -> Option<T> {
        let removed = self.tasks.write().remove(id);
        if removed.is_some() {
            debug!("Removed task {}", id);
            let _ = self.event_tx.send(RegistryEvent::Removed { id: id.to_string() });
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.tasks.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }

    /// Snapshot of every registered task
    pub fn all(&self) -> Vec<(String, T)> {
        self.tasks
            .read()
            .iter()
            .map(|(id, task)| (id.clone(), task.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

impl<T: Clone> Default for TaskRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_generates_id_and_notifies() {
        let registry = TaskRegistry::new();
        let mut rx = registry.subscribe();

        let id = registry.add("task", None);
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(registry.get(&id), Some("task"));
        assert_eq!(rx.recv().await.unwrap(), RegistryEvent::Added { id });
    }

    #[tokio::test]
    async fn test_remove_notifies_once() {
        let registry = TaskRegistry::new();
        let id = registry.add(1u32, Some("fixed".to_string()));
        assert_eq!(id, "fixed");

        let mut rx = registry.subscribe();
        assert_eq!(registry.remove("fixed"), Some(1));
        assert_eq!(registry.remove("fixed"), None);
        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::Removed {
                id: "fixed".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_and_len() {
        let registry = TaskRegistry::new();
        registry.add('a', Some("a".into()));
        registry.add('b', Some("b".into()));
        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.len(), 2);
    }
}
