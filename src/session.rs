//! Participant lifecycle, edits, presence and moderation.
//!
//! Every handler that touches a room holds its [`RoomGuard`] until it is
//! done, awaited storage and sandbox calls included, so a room only ever
//! sees one operation at a time. Outbound messages go through unbounded
//! channels and never block while the guard is held.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::{self, Action, Decision, DenyReason};
use crate::bridge;
use crate::connections::{ConnId, Connections};
use crate::error::JoinError;
use crate::patch::Change;
use crate::persistence::Identity;
use crate::protocol::{ClientEvent, ServerEvent, SettingsUpdate, SettingsView, Snapshot};
use crate::room::{AccessLevel, Participant, Room, RoomGuard};
use crate::sandbox::RunEvent;
use crate::state::AppState;

pub const MAX_ROOM_ID_LEN: usize = 32;

/// What a socket knows about itself.
#[derive(Debug, Clone)]
pub struct Client {
    pub conn: ConnId,
    pub identity: Option<Identity>,
    pub room: Option<String>,
}

impl Client {
    pub fn new(conn: ConnId, identity: Option<Identity>) -> Self {
        Self {
            conn,
            identity,
            room: None,
        }
    }

    pub fn identity_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.id.as_str())
    }

    pub fn display_name(&self) -> String {
        match &self.identity {
            Some(identity) => identity.display_name.clone(),
            None => format!("User-{}", self.conn),
        }
    }

    fn room_matches(&self, room_id: &str) -> bool {
        self.room.as_deref() == Some(room_id)
    }
}

pub fn valid_room_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ROOM_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Dispatches one client event.
pub async fn handle_event(state: &AppState, client: &mut Client, event: ClientEvent) {
    match event {
        ClientEvent::JoinRoom { room_id, password } => {
            if let Some(previous) = client.room.take() {
                leave(state, client.conn, &previous).await;
            }
            match join(state, client, &room_id, password.as_deref()).await {
                Ok(()) => client.room = Some(room_id),
                Err(e) => {
                    info!(conn = %client.conn, room = %room_id, reason = %e, "join refused");
                    state.connections.send(client.conn, ServerEvent::Error { reason: e.to_string() });
                    state.connections.close(client.conn);
                }
            }
        }
        ClientEvent::EditorOp {
            room_id,
            changes,
            base_version,
        } if client.room_matches(&room_id) => {
            edit(state, client, &room_id, changes, base_version).await;
        }
        ClientEvent::LanguageChange { room_id, language } if client.room_matches(&room_id) => {
            change_language(state, client, &room_id, &language).await;
        }
        ClientEvent::CursorMove { room_id, position } if client.room_matches(&room_id) => {
            let event = ServerEvent::CursorUpdate {
                user_id: client.conn,
                position,
            };
            relay(state, client, &room_id, event).await;
        }
        ClientEvent::SelectionChange { room_id, selection } if client.room_matches(&room_id) => {
            let event = ServerEvent::SelectionUpdate {
                user_id: client.conn,
                selection,
            };
            relay(state, client, &room_id, event).await;
        }
        ClientEvent::SelectionClear { room_id } if client.room_matches(&room_id) => {
            relay(state, client, &room_id, ServerEvent::SelectionClear(client.conn)).await;
        }
        ClientEvent::KickUser { target_id } => kick(state, client, target_id).await,
        ClientEvent::DestroyRoom => destroy(state, client).await,
        ClientEvent::UpdateSettings(update) => update_settings(state, client, update).await,
        ClientEvent::RunStart { language, code } => run_start(state, client, &language, &code).await,
        ClientEvent::TermInput { text } => term_input(state, client, &text).await,
        ClientEvent::RunStop => {
            state.sandbox.stop(client.conn).await;
        }
        other => debug!(conn = %client.conn, event = ?other, "event for a room the client is not in"),
    }
}

/// Cleans up after a closed socket.
pub async fn disconnect(state: &AppState, client: &mut Client) {
    if let Some(room) = client.room.take() {
        leave(state, client.conn, &room).await;
    }
    state.sandbox.stop(client.conn).await;
    state.connections.unregister(client.conn);
}

pub async fn join(
    state: &AppState,
    client: &Client,
    room_id: &str,
    password: Option<&str>,
) -> Result<(), JoinError> {
    if !valid_room_id(room_id) {
        return Err(JoinError::InvalidRoomId);
    }

    let mut room = state.rooms.get_or_hydrate(room_id).await?;
    let now = Utc::now();
    let actor = client.identity_id();

    if let Decision::Deny(reason) =
        access::evaluate(&room.policy(), actor, Action::Join { secret: password }, now)
    {
        return Err(JoinError::Denied(reason));
    }

    // The previous socket of this identity leaves the roster before the new
    // one is added, so the roster never holds the identity twice.
    let previous = actor.and_then(|id| room.find_identity(id));
    if let Some(previous) = previous.filter(|conn| *conn != client.conn) {
        evict(state, &mut room, previous).await;
    }

    let participant = Participant {
        conn: client.conn,
        username: client.display_name(),
        identity: actor.map(str::to_string),
    };
    room.add_participant(participant.clone());

    state
        .connections
        .send(client.conn, ServerEvent::SyncSnapshot(snapshot(&room, client.conn, actor, now)));
    state.connections.broadcast(
        room.connections(),
        Some(client.conn),
        &ServerEvent::UserJoined {
            user: participant,
            users: room.participants().to_vec(),
            owner_id: room.owner.clone(),
        },
    );

    info!(
        room = %room_id,
        conn = %client.conn,
        identity = actor.unwrap_or("-"),
        participants = room.participants().len(),
        "participant joined"
    );
    Ok(())
}

async fn evict(state: &AppState, room: &mut Room, previous: ConnId) {
    info!(room = %room.id, conn = %previous, "replacing earlier session of the same identity");
    state.connections.send(previous, ServerEvent::SessionReplaced {});
    state.connections.close(previous);
    state.sandbox.stop(previous).await;
    if let Some(gone) = room.remove_participant(previous) {
        announce_departure(&state.connections, room, &gone);
    }
}

/// Removes `conn` from the room; the last one out flushes and releases it.
pub async fn leave(state: &AppState, conn: ConnId, room_id: &str) {
    let Some(mut room) = state.rooms.get(room_id).await else {
        return;
    };
    let Some(gone) = room.remove_participant(conn) else {
        return;
    };
    state.sandbox.stop(conn).await;
    announce_departure(&state.connections, &room, &gone);
    state
        .connections
        .broadcast(room.connections(), None, &ServerEvent::UserDisconnected(conn));
    debug!(room = %room_id, conn = %conn, remaining = room.participants().len(), "participant left");

    if room.is_empty() {
        match bridge::flush_room(state.repository.as_ref(), &room).await {
            Ok(()) => state.rooms.release(room).await,
            Err(e) => warn!(room = %room_id, error = %e, "flush on last leave failed; keeping room for retry"),
        }
    }
}

fn announce_departure(connections: &Connections, room: &Room, gone: &Participant) {
    connections.broadcast(
        room.connections(),
        None,
        &ServerEvent::UserLeft {
            user_id: gone.conn,
            username: gone.username.clone(),
            users: room.participants().to_vec(),
            owner_id: room.owner.clone(),
        },
    );
}

/// Applies an edit batch in arrival order. `base_version` is informational:
/// batches are never rebased.
pub async fn edit(
    state: &AppState,
    client: &Client,
    room_id: &str,
    changes: Vec<Change>,
    base_version: Option<u64>,
) {
    let Some(mut room) = state.rooms.get(room_id).await else {
        return;
    };
    if room.participant(client.conn).is_none() {
        return;
    }

    let now = Utc::now();
    let actor = client.identity_id();
    if let Decision::Deny(reason) = access::evaluate(&room.policy(), actor, Action::EditContent, now) {
        debug!(room = %room_id, conn = %client.conn, ?reason, "edit rejected");
        let mut snapshot = snapshot(&room, client.conn, actor, now);
        snapshot.access_level = AccessLevel::View;
        state.connections.send(client.conn, ServerEvent::Resync(snapshot));
        return;
    }

    if let Some(base) = base_version.filter(|base| *base != room.version()) {
        debug!(room = %room_id, base, current = room.version(), "edit against stale version");
    }

    let version = room.apply_edit(&changes);
    state.connections.send(client.conn, ServerEvent::Ack { version });
    state.connections.broadcast(
        room.connections(),
        Some(client.conn),
        &ServerEvent::EditorOp { changes, version },
    );
}

async fn change_language(state: &AppState, client: &Client, room_id: &str, language: &str) {
    let Some(mut room) = state.rooms.get(room_id).await else {
        return;
    };
    if room.participant(client.conn).is_none() {
        return;
    }
    let action = Action::ChangeLanguage;
    if let Decision::Deny(reason) =
        access::evaluate(&room.policy(), client.identity_id(), action, Utc::now())
    {
        deny(&state.connections, client.conn, action, reason);
        return;
    }

    room.set_language(language);
    state.connections.broadcast(
        room.connections(),
        Some(client.conn),
        &ServerEvent::LanguageUpdate(language.to_string()),
    );
    if let Err(e) = bridge::flush_room(state.repository.as_ref(), &room).await {
        warn!(room = %room_id, error = %e, "failed to persist language change");
    }
}

/// Forwards a presence event to everyone else in the room.
async fn relay(state: &AppState, client: &Client, room_id: &str, event: ServerEvent) {
    let Some(room) = state.rooms.get(room_id).await else {
        return;
    };
    if room.participant(client.conn).is_some() {
        state
            .connections
            .broadcast(room.connections(), Some(client.conn), &event);
    }
}

/// Locks the client's room and checks that the client may moderate it.
async fn moderated_room(state: &AppState, client: &Client) -> Option<RoomGuard> {
    let room = state.rooms.get(client.room.as_deref()?).await?;
    room.participant(client.conn)?;
    let decision =
        access::evaluate(&room.policy(), client.identity_id(), Action::Moderate, Utc::now());
    match decision {
        Decision::Allow => Some(room),
        Decision::Deny(reason) => {
            deny(&state.connections, client.conn, Action::Moderate, reason);
            None
        }
    }
}

async fn kick(state: &AppState, client: &Client, target: ConnId) {
    if target == client.conn {
        return;
    }
    let Some(mut room) = moderated_room(state, client).await else {
        return;
    };
    let Some(gone) = room.remove_participant(target) else {
        return;
    };

    if let Some(identity) = gone.identity.as_deref() {
        if room.mark_banned(identity) {
            if let Err(e) = state.repository.add_ban(&room.id, identity).await {
                warn!(room = %room.id, identity, error = %e, "failed to persist ban");
            }
        }
    }
    state.sandbox.stop(target).await;

    state.connections.send(
        target,
        ServerEvent::Kicked {
            reason: "You were removed by the room owner".to_string(),
        },
    );
    state.connections.close(target);
    announce_departure(&state.connections, &room, &gone);
    info!(room = %room.id, target = %target, banned = ?gone.identity, "participant kicked");
}

async fn destroy(state: &AppState, client: &Client) {
    if let Some(room) = moderated_room(state, client).await {
        teardown_room(state, room, "The owner closed this room").await;
    }
}

/// Ends a room for good: notifies and disconnects everyone, deletes the
/// record, removes the execution environment and drops it from memory.
pub async fn teardown_room(state: &AppState, room: RoomGuard, reason: &str) {
    let members: Vec<ConnId> = room.connections().collect();
    state.connections.broadcast(
        members.iter().copied(),
        None,
        &ServerEvent::RoomDestroyed {
            reason: reason.to_string(),
        },
    );
    for conn in &members {
        state.connections.close(*conn);
    }

    if let Err(e) = state.repository.delete_room(&room.id).await {
        warn!(room = %room.id, error = %e, "failed to delete room record");
    }
    state.sandbox.teardown(&room.id).await;
    info!(room = %room.id, participants = members.len(), reason, "room torn down");
    state.rooms.release(room).await;
}

async fn update_settings(state: &AppState, client: &Client, update: SettingsUpdate) {
    let Some(mut room) = moderated_room(state, client).await else {
        return;
    };
    let now = Utc::now();
    if let Some(level) = update.access_level {
        room.access_level = level;
    }
    if let Some(is_private) = update.is_private {
        room.is_private = is_private;
    }
    if let Some(password) = update.password {
        room.password = (!password.is_empty()).then_some(password);
    }
    if let Some(expiry) = update.expiry {
        room.expires_at = expiry.resolve(now);
    }

    let view = settings_view(&room, now);
    state
        .connections
        .broadcast(room.connections(), None, &ServerEvent::RoomSettings(view));
    if let Err(e) = bridge::flush_room(state.repository.as_ref(), &room).await {
        warn!(room = %room.id, error = %e, "failed to persist room settings");
    }
    info!(room = %room.id, private = room.is_private, access = ?room.access_level, "room settings updated");
}

async fn run_start(state: &AppState, client: &Client, language: &str, code: &str) {
    let Some(room_id) = client.room.as_deref() else {
        state.connections.send(
            client.conn,
            ServerEvent::Error {
                reason: "join a room before running code".to_string(),
            },
        );
        return;
    };
    // Held across the sandbox call so a teardown cannot interleave with
    // environment startup.
    let Some(room) = state.rooms.get(room_id).await else {
        return;
    };
    if room.participant(client.conn).is_none() {
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(forward_terminal(state.connections.clone(), client.conn, rx));
    match state
        .sandbox
        .run(room_id, client.conn, language, code, tx.clone())
        .await
    {
        Ok(run) => debug!(room = %room_id, conn = %client.conn, run, language, "run started"),
        Err(e) => {
            warn!(room = %room_id, conn = %client.conn, error = %e, "run failed");
            let _ = tx.send(RunEvent::Failed(e.to_string()));
        }
    }
    drop(room);
}

async fn term_input(state: &AppState, client: &Client, text: &str) {
    match state.sandbox.send_input(client.conn, text).await {
        Ok(()) => state
            .connections
            .send(client.conn, ServerEvent::TermData(echo(text))),
        Err(e) => debug!(conn = %client.conn, error = %e, "terminal input dropped"),
    }
}

/// Renders run progress as terminal output for one connection.
async fn forward_terminal(
    connections: std::sync::Arc<Connections>,
    conn: ConnId,
    mut events: mpsc::UnboundedReceiver<RunEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RunEvent::EnvironmentStarted => connections.send(
                conn,
                ServerEvent::TermData(notice("Starting execution environment...")),
            ),
            RunEvent::Running { command } => {
                connections.send(conn, ServerEvent::TermData(notice(&format!("$ {command}"))))
            }
            RunEvent::Stdout(text) => connections.send(conn, ServerEvent::TermData(crlf(&text))),
            RunEvent::Stderr(text) => connections.send(
                conn,
                ServerEvent::TermData(format!("\x1b[31m{}\x1b[0m", crlf(&text))),
            ),
            RunEvent::Exit { code } => {
                let status = match code {
                    Some(code) => format!("Process exited with code {code}"),
                    None => "Process terminated".to_string(),
                };
                connections.send(conn, ServerEvent::TermData(format!("\r\n{}", notice(&status))));
                connections.send(conn, ServerEvent::RunExit { code });
            }
            RunEvent::Failed(reason) => connections.send(conn, ServerEvent::Error { reason }),
        }
    }
}

fn notice(text: &str) -> String {
    format!("\x1b[33m{text}\x1b[0m\r\n")
}

fn crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Pipes do not echo, so typed input is mirrored back to the terminal.
fn echo(text: &str) -> String {
    crlf(&text.replace("\r\n", "\n").replace('\r', "\n"))
}

fn deny(connections: &Connections, conn: ConnId, action: Action<'_>, reason: DenyReason) {
    connections.send(
        conn,
        ServerEvent::Denied {
            action: action.name().to_string(),
            reason,
            message: reason.to_string(),
        },
    );
}

pub fn snapshot(room: &Room, conn: ConnId, actor: Option<&str>, now: DateTime<Utc>) -> Snapshot {
    Snapshot {
        room_id: room.id.clone(),
        name: room.name.clone(),
        content: room.content().to_string(),
        version: room.version(),
        language: room.language.clone(),
        access_level: room.effective_access(actor, now),
        is_owner: room.is_owner(actor),
        expiry: room.expires_at,
        remaining_seconds: room.remaining_seconds(now),
        is_time_bounded: room.expires_at.is_some(),
        users: room.participants().to_vec(),
        owner_id: room.owner.clone(),
        you: conn,
    }
}

fn settings_view(room: &Room, now: DateTime<Utc>) -> SettingsView {
    SettingsView {
        access_level: room.access_level,
        is_private: room.is_private,
        expiry: room.expires_at,
        remaining_seconds: room.remaining_seconds(now),
        is_time_bounded: room.expires_at.is_some(),
    }
}
