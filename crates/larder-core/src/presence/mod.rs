//! In-process presence registry with change notifications.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::edit::PresenceChannel;
use crate::error::Result;
use crate::models::{EditSession, ResourceRef};

const EVENT_CAPACITY: usize = 256;

/// Editor list of a resource after a join or leave
#[derive(Debug, Clone, Serialize)]
pub struct PresenceEvent {
    pub resource: ResourceRef,
    pub editors: Vec<EditSession>,
}

/// Active edit sessions grouped by resource.
///
/// Sessions stay until they are untracked; there is no expiry.
#[derive(Clone)]
pub struct PresenceRegistry {
    sessions: Arc<RwLock<HashMap<ResourceRef, Vec<EditSession>>>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Receive every future presence change
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Number of resources with at least one editor
    pub async fn active_resources(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn publish(&self, resource: ResourceRef, editors: Vec<EditSession>) {
        // no receivers is fine
        let _ = self.events.send(PresenceEvent { resource, editors });
    }
}

impl PresenceChannel for PresenceRegistry {
    async fn track(&self, session: &EditSession) -> Result<()> {
        let editors = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions.entry(session.resource.clone()).or_default();
            entry.retain(|existing| existing.session_id != session.session_id);
            entry.push(session.clone());
            entry.clone()
        };
        tracing::debug!(resource = %session.resource, editors = editors.len(), "Editor joined");
        self.publish(session.resource.clone(), editors);
        Ok(())
    }

    async fn untrack(&self, session_id: &str) -> Result<()> {
        let changed = {
            let mut sessions = self.sessions.write().await;
            let resource = sessions.iter().find_map(|(resource, editors)| {
                editors
                    .iter()
                    .any(|session| session.session_id == session_id)
                    .then(|| resource.clone())
            });
            resource.map(|resource| {
                let remaining = sessions
                    .get_mut(&resource)
                    .map(|editors| {
                        editors.retain(|session| session.session_id != session_id);
                        editors.clone()
                    })
                    .unwrap_or_default();
                if remaining.is_empty() {
                    sessions.remove(&resource);
                }
                (resource, remaining)
            })
        };

        if let Some((resource, editors)) = changed {
            tracing::debug!(%resource, editors = editors.len(), "Editor left");
            self.publish(resource, editors);
        }
        Ok(())
    }

    async fn editors(&self, resource: &ResourceRef) -> Result<Vec<EditSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(resource)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProfileSummary;

    fn session(resource: &ResourceRef, user: &str) -> EditSession {
        EditSession::open(
            resource.clone(),
            user,
            ProfileSummary {
                display_name: user.to_uppercase(),
                email: None,
                avatar_url: None,
            },
            "2024-01-01T10:00:00Z",
        )
    }

    #[tokio::test]
    async fn track_and_untrack_publish_events() {
        let registry = PresenceRegistry::new();
        let mut events = registry.subscribe();
        let resource = ResourceRef::new("purchase_orders", "po-9").unwrap();

        let a = session(&resource, "a");
        registry.track(&a).await.unwrap();
        let joined = events.recv().await.unwrap();
        assert_eq!(joined.resource, resource);
        assert_eq!(joined.editors.len(), 1);

        registry.untrack(&a.session_id).await.unwrap();
        let left = events.recv().await.unwrap();
        assert!(left.editors.is_empty());
        assert_eq!(registry.active_resources().await, 0);
    }

    #[tokio::test]
    async fn tracking_twice_does_not_duplicate() {
        let registry = PresenceRegistry::new();
        let resource = ResourceRef::new("employees", "1").unwrap();
        let a = session(&resource, "a");

        registry.track(&a).await.unwrap();
        registry.track(&a).await.unwrap();
        assert_eq!(registry.editors(&resource).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resources_are_isolated() {
        let registry = PresenceRegistry::new();
        let first = ResourceRef::new("employees", "1").unwrap();
        let second = ResourceRef::new("employees", "2").unwrap();

        registry.track(&session(&first, "a")).await.unwrap();
        registry.track(&session(&second, "b")).await.unwrap();

        let editors = registry.editors(&first).await.unwrap();
        assert_eq!(editors.len(), 1);
        assert_eq!(editors[0].user_id, "a");
    }

    #[tokio::test]
    async fn untrack_unknown_session_is_noop() {
        let registry = PresenceRegistry::new();
        registry.untrack("missing").await.unwrap();
        assert_eq!(registry.active_resources().await, 0);
    }
}
