//! Glue between the record store, presence and edit trackers

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::{EditSession, ProfileSummary, ResourceRef};

use super::{EditTracker, PresenceChannel, RecordStore};

/// Opens and closes edits against a record store and a presence channel.
pub struct EditCoordinator<'a, S, P> {
    store: &'a S,
    presence: &'a P,
}

impl<'a, S: RecordStore, P: PresenceChannel> EditCoordinator<'a, S, P> {
    pub const fn new(store: &'a S, presence: &'a P) -> Self {
        Self { store, presence }
    }

    /// Read the record, start tracking it and announce the editor.
    ///
    /// Presence failures are logged and otherwise ignored.
    pub async fn begin(
        &self,
        resource: ResourceRef,
        user_id: &str,
        profile: ProfileSummary,
    ) -> Result<EditTracker> {
        let snapshot = self
            .store
            .fetch(&resource)
            .await?
            .ok_or_else(|| Error::NotFound(resource.to_string()))?;

        let session = EditSession::open(resource, user_id, profile, snapshot.updated_at.clone());
        let mut tracker = EditTracker::new();
        tracker.initialize_edit(session, &snapshot);

        if let Some(session) = tracker.session() {
            if let Err(error) = self.presence.track(session).await {
                tracing::warn!(
                    resource = %session.resource,
                    "Presence unavailable, editing without indicator: {error}"
                );
            }
        }
        Ok(tracker)
    }

    /// Withdraw the editor's presence.
    pub async fn finish(&self, tracker: &EditTracker) {
        let Some(session) = tracker.session() else {
            return;
        };
        if let Err(error) = self.presence.untrack(&session.session_id).await {
            tracing::warn!(resource = %session.resource, "Presence untrack failed: {error}");
        }
    }

    /// Other users editing `resource`, one entry per user, earliest first.
    pub async fn other_editors(&self, resource: &ResourceRef, me: &str) -> Vec<EditSession> {
        let editors = match self.presence.editors(resource).await {
            Ok(editors) => editors,
            Err(error) => {
                tracing::warn!(%resource, "Presence list unavailable: {error}");
                return Vec::new();
            }
        };
        distinct_other_editors(editors, me)
    }

    pub const fn store(&self) -> &S {
        self.store
    }
}

/// Drop the caller and repeated sessions of one user, keeping the oldest.
pub fn distinct_other_editors(mut editors: Vec<EditSession>, me: &str) -> Vec<EditSession> {
    editors.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    let mut seen = HashSet::new();
    editors
        .into_iter()
        .filter(|session| session.user_id != me)
        .filter(|session| seen.insert(session.user_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::{json, Map, Value};

    use super::*;
    use crate::models::{EditState, RecordSnapshot};
    use crate::presence::PresenceRegistry;

    struct SingleRecord {
        row: Mutex<RecordSnapshot>,
    }

    impl RecordStore for SingleRecord {
        async fn fetch(&self, resource: &ResourceRef) -> Result<Option<RecordSnapshot>> {
            let row = self.row.lock().unwrap();
            Ok((row.resource == *resource).then(|| row.clone()))
        }

        async fn update(
            &self,
            _resource: &ResourceRef,
            data: Map<String, Value>,
        ) -> Result<RecordSnapshot> {
            let mut row = self.row.lock().unwrap();
            row.data.extend(data);
            Ok(row.clone())
        }
    }

    struct BrokenPresence;

    impl PresenceChannel for BrokenPresence {
        async fn track(&self, _session: &EditSession) -> Result<()> {
            Err(Error::Presence("channel closed".to_string()))
        }

        async fn untrack(&self, _session_id: &str) -> Result<()> {
            Err(Error::Presence("channel closed".to_string()))
        }

        async fn editors(&self, _resource: &ResourceRef) -> Result<Vec<EditSession>> {
            Err(Error::Presence("channel closed".to_string()))
        }
    }

    fn resource() -> ResourceRef {
        ResourceRef::new("employees", "emp-1").unwrap()
    }

    fn store_at(updated_at: &str) -> SingleRecord {
        SingleRecord {
            row: Mutex::new(RecordSnapshot {
                resource: resource(),
                data: json!({"updated_at": updated_at}).as_object().cloned().unwrap(),
                updated_at: updated_at.to_string(),
            }),
        }
    }

    fn profile(name: &str) -> ProfileSummary {
        ProfileSummary {
            display_name: name.to_string(),
            email: None,
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn begin_captures_server_version_and_tracks_presence() {
        let store = store_at("2024-01-01T10:00:00Z");
        let presence = PresenceRegistry::new();
        let coordinator = EditCoordinator::new(&store, &presence);

        let a = coordinator.begin(resource(), "user-a", profile("A")).await.unwrap();
        let _b = coordinator.begin(resource(), "user-b", profile("B")).await.unwrap();

        assert_eq!(a.state(), EditState::Editing);
        assert_eq!(a.base_version(), Some("2024-01-01T10:00:00Z"));

        let others = coordinator.other_editors(&resource(), "user-a").await;
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].user_id, "user-b");

        coordinator.finish(&a).await;
        let others = coordinator.other_editors(&resource(), "user-b").await;
        assert!(others.is_empty());
    }

    #[tokio::test]
    async fn broken_presence_still_guards_saves() {
        let store = store_at("2024-01-01T10:00:00Z");
        let presence = BrokenPresence;
        let coordinator = EditCoordinator::new(&store, &presence);

        let mut tracker = coordinator
            .begin(resource(), "user-a", profile("A"))
            .await
            .unwrap();
        assert!(coordinator.other_editors(&resource(), "user-a").await.is_empty());

        {
            let mut row = store.row.lock().unwrap();
            row.updated_at = "2024-01-01T10:05:00Z".to_string();
        }

        let result = tracker.check_before_save(coordinator.store()).await.unwrap();
        assert!(!result.can_save);
        coordinator.finish(&tracker).await;
    }

    #[tokio::test]
    async fn begin_on_missing_record_is_not_found() {
        let store = store_at("2024-01-01T10:00:00Z");
        let presence = PresenceRegistry::new();
        let coordinator = EditCoordinator::new(&store, &presence);
        let missing = ResourceRef::new("employees", "other").unwrap();

        let err = coordinator
            .begin(missing, "user-a", profile("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn distinct_other_editors_dedupes_users() {
        let mut sessions = HashMap::new();
        for (user, started) in [("b", "2"), ("b", "1"), ("a", "0"), ("c", "3")] {
            let mut session = EditSession::open(resource(), user, profile(user), "v");
            session.started_at = started.to_string();
            sessions.insert(session.session_id.clone(), session);
        }

        let editors = distinct_other_editors(sessions.into_values().collect(), "a");
        let users: Vec<_> = editors
            .iter()
            .map(|s| (s.user_id.as_str(), s.started_at.as_str()))
            .collect();
        assert_eq!(users, vec![("b", "1"), ("c", "3")]);
    }
}
