//! Edit sessions, conflict checks and presence for record forms.
//!
//! A session lives until the form closes it, its presence socket goes away,
//! or (without a socket) it sees no request for the configured lease.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use larder_core::edit::{distinct_other_editors, EditCoordinator, EditTracker, PresenceChannel};
use larder_core::presence::{PresenceEvent, PresenceRegistry};
use larder_core::{
    ConflictCheckResult, ConflictResolution, EditSession, EditState, ProfileSummary,
    RecordSnapshot, ResourceRef,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::{AuthenticatedUser, PRESENCE_PROTOCOL};
use crate::error::AppError;
use crate::routes::{user_fingerprint, AppState};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

struct OwnedTracker {
    owner: String,
    tracker: Arc<Mutex<EditTracker>>,
    last_seen: Instant,
    /// Presence sockets bound to this session
    sockets: usize,
}

/// Open edit trackers keyed by session id
#[derive(Clone, Default)]
pub struct EditSessionStore {
    sessions: Arc<RwLock<HashMap<String, OwnedTracker>>>,
}

impl EditSessionStore {
    async fn insert(&self, tracker: EditTracker) -> Result<String, AppError> {
        let session = tracker
            .session()
            .ok_or_else(|| AppError::internal("Edit tracker has no session"))?;
        let session_id = session.session_id.clone();
        let owner = session.user_id.clone();
        self.sessions.write().await.insert(
            session_id.clone(),
            OwnedTracker {
                owner,
                tracker: Arc::new(Mutex::new(tracker)),
                last_seen: Instant::now(),
                sockets: 0,
            },
        );
        Ok(session_id)
    }

    fn owned<'a>(
        sessions: &'a mut HashMap<String, OwnedTracker>,
        session_id: &str,
        user_id: &str,
    ) -> Result<&'a mut OwnedTracker, AppError> {
        let entry = sessions.get_mut(session_id).ok_or_else(|| {
            AppError::not_found(format!("Edit session {session_id} does not exist"))
        })?;
        if entry.owner != user_id {
            return Err(AppError::forbidden("Edit session belongs to another user"));
        }
        Ok(entry)
    }

    /// Owner's tracker; counts as activity for the idle lease.
    async fn get(&self, session_id: &str, user_id: &str) -> Result<Arc<Mutex<EditTracker>>, AppError> {
        let mut sessions = self.sessions.write().await;
        let entry = Self::owned(&mut sessions, session_id, user_id)?;
        entry.last_seen = Instant::now();
        Ok(Arc::clone(&entry.tracker))
    }

    async fn remove(&self, session_id: &str, user_id: &str) -> Result<Arc<Mutex<EditTracker>>, AppError> {
        let mut sessions = self.sessions.write().await;
        Self::owned(&mut sessions, session_id, user_id)?;
        sessions
            .remove(session_id)
            .map(|entry| entry.tracker)
            .ok_or_else(|| AppError::internal("Edit session vanished"))
    }

    async fn attach(&self, session_id: &str, user_id: &str) -> Result<(), AppError> {
        let mut sessions = self.sessions.write().await;
        let entry = Self::owned(&mut sessions, session_id, user_id)?;
        entry.sockets += 1;
        entry.last_seen = Instant::now();
        Ok(())
    }

    /// Unbind one socket. The session ends with its last socket.
    async fn detach(&self, session_id: &str) -> Option<Arc<Mutex<EditTracker>>> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(session_id)?;
        entry.sockets = entry.sockets.saturating_sub(1);
        if entry.sockets > 0 {
            return None;
        }
        sessions.remove(session_id).map(|entry| entry.tracker)
    }

    /// Remove socketless sessions idle for at least `lease`
    async fn take_idle(&self, lease: Duration) -> Vec<Arc<Mutex<EditTracker>>> {
        let mut sessions = self.sessions.write().await;
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.sockets == 0 && entry.last_seen.elapsed() >= lease)
            .map(|(session_id, _)| session_id.clone())
            .collect();
        idle.iter()
            .filter_map(|session_id| sessions.remove(session_id))
            .map(|entry| entry.tracker)
            .collect()
    }

    pub async fn open_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Drop a finished session from presence; failures only degrade the badge.
async fn release(presence: &PresenceRegistry, tracker: &Mutex<EditTracker>) {
    let tracker = tracker.lock().await;
    if let Some(session) = tracker.session() {
        if let Err(error) = presence.untrack(&session.session_id).await {
            tracing::warn!(resource = %session.resource, "Presence untrack failed: {error}");
        }
    }
}

/// End socketless sessions that saw no request within `lease`.
pub async fn reap_idle_sessions(state: &AppState, lease: Duration) -> usize {
    let idle = state.edit_sessions.take_idle(lease).await;
    for tracker in &idle {
        release(&state.presence, tracker).await;
    }
    if !idle.is_empty() {
        tracing::info!(sessions = idle.len(), "Expired idle edit sessions");
    }
    idle.len()
}

pub fn spawn_session_reaper(state: AppState) -> JoinHandle<()> {
    let lease = state.config.edit_session_lease;
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(lease / 4);
        loop {
            sweep.tick().await;
            reap_idle_sessions(&state, lease).await;
        }
    })
}

#[derive(Debug, Deserialize)]
pub struct BeginEditRequest {
    #[serde(alias = "resourceType", alias = "table")]
    pub resource_type: String,
    #[serde(alias = "resourceId", alias = "recordId")]
    pub resource_id: String,
    #[serde(default)]
    pub profile: Option<ProfileSummary>,
}

#[derive(Debug, Serialize)]
pub struct BeginEditResponse {
    pub session: EditSession,
    pub state: EditState,
    pub other_editors: Vec<EditSession>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub resolution: ConflictResolution,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub state: EditState,
    /// Snapshot the form should reload, present after `reload_latest`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_data: Option<RecordSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct SavedRequest {
    #[serde(alias = "updatedAt")]
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct SavedResponse {
    pub state: EditState,
    pub base_updated_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PresenceSocketQuery {
    /// Edit session that should end when this socket does
    #[serde(default, alias = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub resource: ResourceRef,
    pub editors: Vec<EditSession>,
}

pub async fn begin_edit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<BeginEditRequest>,
) -> Result<Json<BeginEditResponse>, AppError> {
    let resource = ResourceRef::new(&payload.resource_type, &payload.resource_id)?;
    let profile = payload
        .profile
        .unwrap_or_else(|| user.profile_summary());

    let store = state.records.store_for(&user);
    let coordinator = EditCoordinator::new(&store, &state.presence);
    let tracker = coordinator
        .begin(resource.clone(), &user.user_id, profile)
        .await?;
    let other_editors = coordinator.other_editors(&resource, &user.user_id).await;

    let session = tracker
        .session()
        .cloned()
        .ok_or_else(|| AppError::internal("Edit tracker has no session"))?;
    let edit_state = tracker.state();
    state.edit_sessions.insert(tracker).await?;

    tracing::info!(
        %resource,
        user = user_fingerprint(&user.user_id),
        others = other_editors.len(),
        "Edit session opened"
    );
    Ok(Json(BeginEditResponse {
        session,
        state: edit_state,
        other_editors,
    }))
}

pub async fn check_edit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<String>,
) -> Result<Json<ConflictCheckResult>, AppError> {
    let tracker = state.edit_sessions.get(&session_id, &user.user_id).await?;
    let store = state.records.store_for(&user);
    let result = tracker.lock().await.check_before_save(&store).await?;
    Ok(Json(result))
}

pub async fn resolve_edit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<String>,
    Json(payload): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, AppError> {
    let tracker = state.edit_sessions.get(&session_id, &user.user_id).await?;
    let mut tracker = tracker.lock().await;

    let mut latest_data = None;
    tracker.resolve_conflict(payload.resolution, |latest| {
        latest_data = Some(latest.clone());
    })?;

    // the editor's base moved, let other editors see the new version
    if let Some(session) = tracker.session() {
        if let Err(error) = state.presence.track(session).await {
            tracing::warn!(resource = %session.resource, "Presence refresh failed: {error}");
        }
    }

    Ok(Json(ResolveResponse {
        state: tracker.state(),
        latest_data,
    }))
}

pub async fn mark_edit_saved(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<String>,
    Json(payload): Json<SavedRequest>,
) -> Result<Json<SavedResponse>, AppError> {
    let updated_at = payload.updated_at.trim();
    if updated_at.is_empty() {
        return Err(AppError::bad_request("`updated_at` is required"));
    }

    let tracker = state.edit_sessions.get(&session_id, &user.user_id).await?;
    let mut tracker = tracker.lock().await;
    tracker.mark_saved(updated_at)?;

    Ok(Json(SavedResponse {
        state: tracker.state(),
        base_updated_at: tracker.base_version().map(ToString::to_string),
    }))
}

pub async fn close_edit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let tracker = state.edit_sessions.remove(&session_id, &user.user_id).await?;
    let tracker = tracker.lock().await;

    let store = state.records.store_for(&user);
    EditCoordinator::new(&store, &state.presence)
        .finish(&tracker)
        .await;
    tracing::debug!(session_id = %session_id, "Edit session closed");
    Ok(StatusCode::NO_CONTENT)
}

/// Keep a socketless session alive
pub async fn heartbeat_edit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.edit_sessions.get(&session_id, &user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_presence(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((resource_type, resource_id)): Path<(String, String)>,
) -> Result<Json<PresenceResponse>, AppError> {
    let resource = ResourceRef::new(resource_type, resource_id)?;
    let store = state.records.store_for(&user);
    let editors = EditCoordinator::new(&store, &state.presence)
        .other_editors(&resource, &user.user_id)
        .await;
    Ok(Json(PresenceResponse { resource, editors }))
}

pub async fn presence_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((resource_type, resource_id)): Path<(String, String)>,
    Query(query): Query<PresenceSocketQuery>,
) -> Result<Response, AppError> {
    let resource = ResourceRef::new(resource_type, resource_id)?;
    if let Some(session_id) = query.session_id.as_deref() {
        let tracker = state.edit_sessions.get(session_id, &user.user_id).await?;
        let bound = tracker.lock().await.session().map(|session| session.resource.clone());
        if bound.as_ref() != Some(&resource) {
            return Err(AppError::bad_request("Edit session is for another record"));
        }
    }

    Ok(ws
        .protocols([PRESENCE_PROTOCOL])
        .on_upgrade(move |socket| {
            let (sender, receiver) = socket.split();
            serve_presence(state, sender, receiver, resource, user.user_id, query.session_id)
        })
        .into_response())
}

/// Run one presence socket, ending its bound edit session when it goes away.
async fn serve_presence<S, R>(
    state: AppState,
    mut sender: S,
    receiver: R,
    resource: ResourceRef,
    me: String,
    session_id: Option<String>,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let bound = match session_id {
        Some(session_id) => match state.edit_sessions.attach(&session_id, &me).await {
            Ok(()) => Some(session_id),
            Err(error) => {
                tracing::debug!(%resource, "Presence socket refused: {error}");
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        },
        None => None,
    };

    let events = state.presence.subscribe();
    run_presence_loop(sender, receiver, events, &state.presence, &resource, &me).await;

    if let Some(session_id) = bound {
        if let Some(tracker) = state.edit_sessions.detach(&session_id).await {
            release(&state.presence, &tracker).await;
            tracing::debug!(session_id = %session_id, "Edit session ended with its socket");
        }
    }
}

/// Send the current editors, then every change for one resource, with ping/pong keepalive.
///
/// Exits when the client closes or no pong arrives within [`PONG_TIMEOUT`].
async fn run_presence_loop<S, R>(
    mut sender: S,
    mut receiver: R,
    mut events: broadcast::Receiver<PresenceEvent>,
    presence: &PresenceRegistry,
    resource: &ResourceRef,
    me: &str,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let editors = current_editors(presence, resource, me).await;
    if send_editors(&mut sender, resource, editors).await.is_err() {
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // first tick is immediate
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(%resource, "Presence socket timed out");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = events.recv() => {
                let editors = match result {
                    Ok(event) if event.resource == *resource => {
                        distinct_other_editors(event.editors, me)
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        current_editors(presence, resource, me).await
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if send_editors(&mut sender, resource, editors).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

async fn current_editors(
    presence: &PresenceRegistry,
    resource: &ResourceRef,
    me: &str,
) -> Vec<EditSession> {
    match presence.editors(resource).await {
        Ok(editors) => distinct_other_editors(editors, me),
        Err(error) => {
            tracing::warn!(%resource, "Presence list unavailable: {error}");
            Vec::new()
        }
    }
}

async fn send_editors<S>(
    sender: &mut S,
    resource: &ResourceRef,
    editors: Vec<EditSession>,
) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    let payload = PresenceResponse {
        resource: resource.clone(),
        editors,
    };
    match serde_json::to_string(&payload) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(error) => {
            tracing::warn!(%resource, "Failed to serialize presence update: {error}");
            Ok(())
        }
    }
}
