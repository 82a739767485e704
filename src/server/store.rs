//! The room store: single source of truth for sessions and rooms
//!
//! All mutable relay state lives behind one task that consumes commands in
//! order. Each command is applied atomically and acknowledged through a
//! oneshot, so a connection actor can order its own frames by awaiting the
//! ack before reading the next one. Broadcasts emitted by a command are
//! posted before the next command is taken.
//!
//! Dispatch to recipients goes through per-session bounded queues with
//! non-blocking sends. A full queue drops typing frames first, then
//! file-progress frames; a full queue for a delivery frame marks the
//! session unhealthy and it is evicted once the current command's side
//! effects are complete.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_CODE_ALPHABET};
use crate::error::{RelayError, Result};
use crate::protocol::events::{
    DeleteMessageData, FileStatusData, FrameClass, JoinProfile, SendMessageData, ServerEvent,
    SignalData, SignalKind, TypingData,
};
use crate::server::rooms::{Room, RoomId, RoomSet, SessionId, TypingState, WaitingPool};

/// How often the store sweeps typing expiry and the waiting pool
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Store-side configuration, split from [`Config`] so tests can shrink the
/// timeouts.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub match_timeout: Duration,
    pub typing_expiry: Duration,
    pub enable_couple: bool,
    pub code_len: usize,
    pub code_alphabet: String,
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            match_timeout: Duration::from_secs(60),
            typing_expiry: Duration::from_secs(5),
            enable_couple: true,
            code_len: 6,
            code_alphabet: DEFAULT_CODE_ALPHABET.to_string(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl From<&Config> for StoreConfig {
    fn from(config: &Config) -> Self {
        Self {
            match_timeout: config.match_timeout,
            typing_expiry: config.typing_expiry,
            enable_couple: config.enable_couple,
            code_len: config.code_len,
            code_alphabet: config.code_alphabet.clone(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unjoined,
    Waiting,
    Joined(RoomId),
}

/// Server-side representation of one connected channel
struct UserSession {
    user_id: String,
    username: String,
    /// Stated matching preference, display-only
    #[allow(dead_code)]
    preference: String,
    state: SessionState,
    outbound: mpsc::Sender<Bytes>,
    last_seen: Instant,
}

/// Commands accepted by the store
enum Command {
    Connect {
        outbound: mpsc::Sender<Bytes>,
        res_tx: oneshot::Sender<SessionId>,
    },
    Disconnect {
        session: SessionId,
    },
    JoinChat {
        session: SessionId,
        profile: JoinProfile,
        res_tx: oneshot::Sender<()>,
    },
    SendMessage {
        session: SessionId,
        data: SendMessageData,
        res_tx: oneshot::Sender<()>,
    },
    TypingStart {
        session: SessionId,
        data: TypingData,
        res_tx: oneshot::Sender<()>,
    },
    TypingStop {
        session: SessionId,
        data: TypingData,
        res_tx: oneshot::Sender<()>,
    },
    DeleteMessage {
        session: SessionId,
        data: DeleteMessageData,
        res_tx: oneshot::Sender<()>,
    },
    FileSendingStart {
        session: SessionId,
        data: FileStatusData,
        res_tx: oneshot::Sender<()>,
    },
    FileSendingEnd {
        session: SessionId,
        data: FileStatusData,
        res_tx: oneshot::Sender<()>,
    },
    Signal {
        session: SessionId,
        kind: SignalKind,
        data: SignalData,
        res_tx: oneshot::Sender<()>,
    },
    DisconnectChat {
        session: SessionId,
        res_tx: oneshot::Sender<()>,
    },
    Stats {
        res_tx: oneshot::Sender<StoreStats>,
    },
}

/// Point-in-time store counters
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub sessions: usize,
    pub rooms: usize,
    pub codes: usize,
    pub waiting: usize,
}

/// Command sender for the room store
#[derive(Clone)]
pub struct StoreHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl StoreHandle {
    fn submit(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| RelayError::internal("room store unavailable"))
    }

    async fn acked(&self, res_rx: oneshot::Receiver<()>) -> Result<()> {
        res_rx
            .await
            .map_err(|_| RelayError::internal("room store dropped command"))
    }

    /// Register an outbound queue and obtain a session id
    pub async fn connect(&self, outbound: mpsc::Sender<Bytes>) -> Result<SessionId> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::Connect { outbound, res_tx })?;
        res_rx
            .await
            .map_err(|_| RelayError::internal("room store dropped command"))
    }

    /// Channel closed: remove the session entirely. Fire-and-forget so the
    /// actor can issue it from any exit path.
    pub fn disconnect(&self, session: SessionId) {
        let _ = self.cmd_tx.send(Command::Disconnect { session });
    }

    pub async fn join_chat(&self, session: SessionId, profile: JoinProfile) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::JoinChat {
            session,
            profile,
            res_tx,
        })?;
        self.acked(res_rx).await
    }

    pub async fn send_message(&self, session: SessionId, data: SendMessageData) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::SendMessage {
            session,
            data,
            res_tx,
        })?;
        self.acked(res_rx).await
    }

    pub async fn typing_start(&self, session: SessionId, data: TypingData) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::TypingStart {
            session,
            data,
            res_tx,
        })?;
        self.acked(res_rx).await
    }

    pub async fn typing_stop(&self, session: SessionId, data: TypingData) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::TypingStop {
            session,
            data,
            res_tx,
        })?;
        self.acked(res_rx).await
    }

    pub async fn delete_message(&self, session: SessionId, data: DeleteMessageData) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::DeleteMessage {
            session,
            data,
            res_tx,
        })?;
        self.acked(res_rx).await
    }

    pub async fn file_sending_start(&self, session: SessionId, data: FileStatusData) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::FileSendingStart {
            session,
            data,
            res_tx,
        })?;
        self.acked(res_rx).await
    }

    pub async fn file_sending_end(&self, session: SessionId, data: FileStatusData) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::FileSendingEnd {
            session,
            data,
            res_tx,
        })?;
        self.acked(res_rx).await
    }

    pub async fn signal(
        &self,
        session: SessionId,
        kind: SignalKind,
        data: SignalData,
    ) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::Signal {
            session,
            kind,
            data,
            res_tx,
        })?;
        self.acked(res_rx).await
    }

    /// Leave the current room but keep the channel registered
    pub async fn disconnect_chat(&self, session: SessionId) -> Result<()> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::DisconnectChat { session, res_tx })?;
        self.acked(res_rx).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let (res_tx, res_rx) = oneshot::channel();
        self.submit(Command::Stats { res_tx })?;
        res_rx
            .await
            .map_err(|_| RelayError::internal("room store dropped command"))
    }
}

/// The store itself. Owns every session, room, code, waiter, and typing
/// entry in the process.
pub struct RoomStore {
    config: StoreConfig,
    sessions: HashMap<SessionId, UserSession>,
    rooms: RoomSet,
    waiting: WaitingPool,
    typing: TypingState,
    /// Sessions found unhealthy while dispatching the current command
    evictions: Vec<SessionId>,
}

impl RoomStore {
    fn new(config: StoreConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            rooms: RoomSet::new(),
            waiting: WaitingPool::new(),
            typing: TypingState::new(),
            evictions: Vec::new(),
        }
    }

    /// Spawn the store task and return its handle
    pub fn spawn(config: StoreConfig) -> StoreHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let store = Self::new(config);
        tokio::spawn(store.run(cmd_rx));
        StoreHandle { cmd_tx }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut sweep = interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        self.apply(cmd);
                        self.drain_evictions();
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    self.on_sweep(Instant::now());
                    self.drain_evictions();
                }
            }
        }
        debug!("room store stopped");
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { outbound, res_tx } => {
                let session_id = Uuid::new_v4().to_string();
                self.sessions.insert(
                    session_id.clone(),
                    UserSession {
                        user_id: String::new(),
                        username: String::new(),
                        preference: String::new(),
                        state: SessionState::Unjoined,
                        outbound,
                        last_seen: Instant::now(),
                    },
                );
                debug!(session = %session_id, "session registered");
                let _ = res_tx.send(session_id);
            }
            Command::Disconnect { session } => {
                self.leave(&session, true);
            }
            Command::JoinChat {
                session,
                profile,
                res_tx,
            } => {
                self.handle_join(&session, profile);
                let _ = res_tx.send(());
            }
            Command::SendMessage {
                session,
                data,
                res_tx,
            } => {
                self.handle_send(&session, data);
                let _ = res_tx.send(());
            }
            Command::TypingStart {
                session,
                data,
                res_tx,
            } => {
                self.handle_typing_start(&session, data);
                let _ = res_tx.send(());
            }
            Command::TypingStop {
                session,
                data,
                res_tx,
            } => {
                self.handle_typing_stop(&session, data);
                let _ = res_tx.send(());
            }
            Command::DeleteMessage {
                session,
                data,
                res_tx,
            } => {
                self.handle_delete(&session, data);
                let _ = res_tx.send(());
            }
            Command::FileSendingStart {
                session,
                data,
                res_tx,
            } => {
                self.handle_file_status(&session, data, true);
                let _ = res_tx.send(());
            }
            Command::FileSendingEnd {
                session,
                data,
                res_tx,
            } => {
                self.handle_file_status(&session, data, false);
                let _ = res_tx.send(());
            }
            Command::Signal {
                session,
                kind,
                data,
                res_tx,
            } => {
                self.handle_signal(&session, kind, data);
                let _ = res_tx.send(());
            }
            Command::DisconnectChat { session, res_tx } => {
                self.leave(&session, false);
                let _ = res_tx.send(());
            }
            Command::Stats { res_tx } => {
                let _ = res_tx.send(StoreStats {
                    sessions: self.sessions.len(),
                    rooms: self.rooms.len(),
                    codes: self.rooms.code_count(),
                    waiting: self.waiting.len(),
                });
            }
        }
    }

    // -------------------------------------------------------------------
    // Join / matchmaking
    // -------------------------------------------------------------------

    fn handle_join(&mut self, sid: &SessionId, profile: JoinProfile) {
        let Some(sess) = self.sessions.get_mut(sid) else {
            return;
        };
        if sess.state != SessionState::Unjoined {
            warn!(session = %sid, "join_chat while joined or waiting, dropping");
            return;
        }

        let username = if profile.username.is_empty() {
            let prefix: String = profile.user_id.chars().take(5).collect();
            format!("User-{}", prefix)
        } else {
            profile.username.clone()
        };
        sess.user_id = profile.user_id;
        sess.username = username;
        sess.preference = profile.preference;
        sess.last_seen = Instant::now();

        if profile.room_type == "group" {
            match profile.group_join_method.as_deref() {
                Some("create") => self.create_group(sid),
                Some("join") => match profile.group_code {
                    Some(code) => self.join_group_by_code(sid, &code),
                    None => self.join_random_group(sid),
                },
                _ => self.join_random_group(sid),
            }
        } else {
            self.pair_or_wait(sid);
        }
    }

    fn create_group(&mut self, sid: &SessionId) {
        let code = match self
            .rooms
            .allocate_code(&self.config.code_alphabet, self.config.code_len)
        {
            Some(code) => code,
            None => {
                warn!(session = %sid, "group code space exhausted, dropping join");
                return;
            }
        };

        let room_id = self.rooms.insert_group(code.clone(), sid.clone());
        let username = match self.sessions.get_mut(sid) {
            Some(sess) => {
                sess.state = SessionState::Joined(room_id);
                sess.username.clone()
            }
            None => return,
        };

        info!(session = %sid, code = %code, "group created");
        self.post(
            sid,
            &ServerEvent::ChatStarted {
                group_code: Some(code),
            },
        );
        self.post(sid, &ServerEvent::GroupMembersUpdate(vec![username]));
    }

    fn join_group_by_code(&mut self, sid: &SessionId, code: &str) {
        let Some(room_id) = self.rooms.id_by_code(code) else {
            debug!(session = %sid, "group code not found");
            self.post(sid, &ServerEvent::GroupNotFound);
            return;
        };

        let prior: Vec<SessionId> = self
            .rooms
            .get(room_id)
            .map(|room| room.member_ids().to_vec())
            .unwrap_or_default();

        if let Some(group) = self.rooms.group_mut(room_id) {
            group.members.push(sid.clone());
        }
        let username = match self.sessions.get_mut(sid) {
            Some(sess) => {
                sess.state = SessionState::Joined(room_id);
                sess.username.clone()
            }
            None => return,
        };

        info!(session = %sid, code = %code, "joined group");
        for member in &prior {
            self.post(member, &ServerEvent::UserJoinedGroup(username.clone()));
        }
        self.post(
            sid,
            &ServerEvent::ChatStarted {
                group_code: Some(code.to_string()),
            },
        );
        let roster = self.room_usernames(room_id);
        self.broadcast(room_id, &ServerEvent::GroupMembersUpdate(roster), None);
    }

    fn join_random_group(&mut self, sid: &SessionId) {
        let code = self
            .rooms
            .random_group_id()
            .and_then(|id| self.rooms.get(id))
            .and_then(|room| room.code().map(str::to_string));
        match code {
            Some(code) => self.join_group_by_code(sid, &code),
            None => self.create_group(sid),
        }
    }

    fn pair_or_wait(&mut self, sid: &SessionId) {
        if !self.config.enable_couple {
            self.post(sid, &ServerEvent::NoMatchFound);
            return;
        }

        // skip waiters that left or got matched while queued
        let peer = loop {
            match self.waiting.pop() {
                Some(candidate) => {
                    let waiting = self
                        .sessions
                        .get(&candidate)
                        .map(|s| s.state == SessionState::Waiting)
                        .unwrap_or(false);
                    if waiting {
                        break Some(candidate);
                    }
                }
                None => break None,
            }
        };

        match peer {
            Some(peer) => {
                let room_id = self.rooms.insert_couple(peer.clone(), sid.clone());
                if let Some(sess) = self.sessions.get_mut(&peer) {
                    sess.state = SessionState::Joined(room_id);
                }
                if let Some(sess) = self.sessions.get_mut(sid) {
                    sess.state = SessionState::Joined(room_id);
                }
                info!(session = %sid, peer = %peer, "couple paired");
                self.post(&peer, &ServerEvent::ChatStarted { group_code: None });
                self.post(sid, &ServerEvent::ChatStarted { group_code: None });
            }
            None => {
                if let Some(sess) = self.sessions.get_mut(sid) {
                    sess.state = SessionState::Waiting;
                }
                self.waiting.push(sid.clone(), Instant::now());
                self.post(sid, &ServerEvent::WaitingForMatch);
            }
        }
    }

    // -------------------------------------------------------------------
    // Relay commands
    // -------------------------------------------------------------------

    fn handle_send(&mut self, sid: &SessionId, data: SendMessageData) {
        let Some((room_id, sender)) = self.joined(sid) else {
            debug!(session = %sid, "send_message while unjoined, dropping");
            return;
        };
        if !self.claim_matches(room_id, data.is_group_chat, data.group_code.as_deref()) {
            warn!(session = %sid, "send_message room claim mismatch, dropping");
            return;
        }

        let event = ServerEvent::ReceiveMessage {
            sender,
            message: data.message,
            reply_to: data.reply_to_id,
        };
        self.broadcast(room_id, &event, Some(sid));
    }

    fn handle_typing_start(&mut self, sid: &SessionId, data: TypingData) {
        let Some((room_id, sender)) = self.joined(sid) else {
            return;
        };
        if !self.claim_matches(room_id, data.is_group_chat, data.group_code.as_deref()) {
            return;
        }
        if self.typing.start(room_id, sid.clone(), Instant::now()) {
            self.broadcast(room_id, &ServerEvent::TypingStarted { sender }, Some(sid));
        }
    }

    fn handle_typing_stop(&mut self, sid: &SessionId, data: TypingData) {
        let Some((room_id, _)) = self.joined(sid) else {
            return;
        };
        if !self.claim_matches(room_id, data.is_group_chat, data.group_code.as_deref()) {
            return;
        }
        if self.typing.stop(room_id, sid) {
            self.broadcast(room_id, &ServerEvent::TypingStopped, Some(sid));
        }
    }

    fn handle_delete(&mut self, sid: &SessionId, data: DeleteMessageData) {
        let Some((room_id, _)) = self.joined(sid) else {
            debug!(session = %sid, "delete_message while unjoined, dropping");
            return;
        };
        // messages are not persisted, so there is no ownership to verify;
        // clients enforce deletion rights
        let event = ServerEvent::MessageDeleted {
            message_id: data.message_id,
        };
        self.broadcast(room_id, &event, Some(sid));
    }

    fn handle_file_status(&mut self, sid: &SessionId, data: FileStatusData, started: bool) {
        let Some((room_id, _)) = self.joined(sid) else {
            return;
        };
        if !self.claim_matches(room_id, data.is_group_chat, data.group_code.as_deref()) {
            return;
        }
        let username = self
            .sessions
            .get(sid)
            .map(|s| s.username.clone())
            .unwrap_or_default();
        let event = if started {
            ServerEvent::FileSendingStarted {
                file_id: data.file_id,
                username,
            }
        } else {
            ServerEvent::FileSendingEnded {
                file_id: data.file_id,
                username,
            }
        };
        self.broadcast(room_id, &event, Some(sid));
    }

    fn handle_signal(&mut self, sid: &SessionId, kind: SignalKind, data: SignalData) {
        let Some((room_id, sender_id)) = self.joined(sid) else {
            debug!(session = %sid, "signaling frame while unjoined, dropping");
            return;
        };

        let SignalData {
            target_id,
            mut payload,
            ..
        } = data;

        // the sender identity on the relayed frame is stamped here, never
        // taken from the client
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("sender_id".to_string(), json!(sender_id));
        }
        let event = ServerEvent::Signal {
            kind,
            data: payload,
        };

        match target_id {
            Some(target) => {
                let target_sid = self.rooms.get(room_id).and_then(|room| {
                    room.member_ids()
                        .iter()
                        .find(|m| {
                            self.sessions
                                .get(*m)
                                .map(|s| s.user_id == target)
                                .unwrap_or(false)
                        })
                        .cloned()
                });
                match target_sid {
                    Some(target_sid) => self.post(&target_sid, &event),
                    None => {
                        debug!(session = %sid, "signal target not in room, dropping")
                    }
                }
            }
            None => self.broadcast(room_id, &event, Some(sid)),
        }
    }

    // -------------------------------------------------------------------
    // Departure
    // -------------------------------------------------------------------

    /// Remove a session from its room, notifying the remaining members.
    /// `remove_session` distinguishes a closed channel from a
    /// `disconnect_chat` that keeps the channel registered.
    fn leave(&mut self, sid: &SessionId, remove_session: bool) {
        self.waiting.remove(sid);

        let Some(sess) = self.sessions.get(sid) else {
            return;
        };
        let state = sess.state;
        let username = sess.username.clone();

        if let SessionState::Joined(room_id) = state {
            let is_couple = matches!(self.rooms.get(room_id), Some(Room::Couple(_)));
            if is_couple {
                // any departure terminates the room; the partner is
                // notified and unjoined
                let peer = match self.rooms.remove(room_id) {
                    Some(Room::Couple(room)) => room.members.into_iter().find(|m| m != sid),
                    _ => None,
                };
                self.typing.drop_room(room_id);
                if let Some(peer) = peer {
                    if let Some(peer_sess) = self.sessions.get_mut(&peer) {
                        peer_sess.state = SessionState::Unjoined;
                    }
                    self.post(&peer, &ServerEvent::PartnerDisconnected);
                }
                info!(session = %sid, "couple room terminated");
            } else if let Some(group) = self.rooms.group_mut(room_id) {
                group.members.retain(|m| m != sid);
                let destroyed = group.is_empty();
                self.typing.forget(room_id, sid);
                if destroyed {
                    self.rooms.remove(room_id);
                    self.typing.drop_room(room_id);
                    info!(session = %sid, "group destroyed on last departure");
                } else {
                    self.broadcast(room_id, &ServerEvent::UserLeftGroup(username), None);
                    let roster = self.room_usernames(room_id);
                    self.broadcast(room_id, &ServerEvent::GroupMembersUpdate(roster), None);
                }
            }
        }

        if remove_session {
            self.sessions.remove(sid);
            debug!(session = %sid, "session removed");
        } else if let Some(sess) = self.sessions.get_mut(sid) {
            sess.state = SessionState::Unjoined;
        }
    }

    // -------------------------------------------------------------------
    // Sweeping
    // -------------------------------------------------------------------

    fn on_sweep(&mut self, now: Instant) {
        for (room_id, sender) in self.typing.expire(self.config.typing_expiry, now) {
            self.broadcast(room_id, &ServerEvent::TypingStopped, Some(&sender));
        }

        let expired = self.waiting.expire(self.config.match_timeout, now);
        for waiter in expired {
            let reset = match self.sessions.get_mut(&waiter) {
                Some(sess) if sess.state == SessionState::Waiting => {
                    sess.state = SessionState::Unjoined;
                    true
                }
                _ => false,
            };
            if reset {
                debug!(session = %waiter, "match timeout");
                self.post(&waiter, &ServerEvent::NoMatchFound);
            }
        }
    }

    // -------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------

    /// Session's room and user id when joined
    fn joined(&self, sid: &SessionId) -> Option<(RoomId, String)> {
        let sess = self.sessions.get(sid)?;
        match sess.state {
            SessionState::Joined(room_id) => Some((room_id, sess.user_id.clone())),
            _ => None,
        }
    }

    /// Validate the client's room claim against the room it is actually in
    fn claim_matches(&self, room_id: RoomId, is_group_chat: bool, code: Option<&str>) -> bool {
        match self.rooms.get(room_id) {
            Some(Room::Group(group)) => {
                is_group_chat && code.map_or(true, |c| c == group.code)
            }
            Some(Room::Couple(_)) => !is_group_chat,
            None => false,
        }
    }

    fn room_usernames(&self, room_id: RoomId) -> Vec<String> {
        match self.rooms.get(room_id) {
            Some(room) => room
                .member_ids()
                .iter()
                .filter_map(|m| self.sessions.get(m).map(|s| s.username.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn post(&mut self, target: &SessionId, event: &ServerEvent) {
        self.post_encoded(
            target,
            event.encode(),
            event.frame_class(),
            event.event_name(),
        );
    }

    fn post_encoded(&mut self, target: &SessionId, bytes: Bytes, class: FrameClass, name: &str) {
        let Some(sess) = self.sessions.get(target) else {
            return;
        };
        match sess.outbound.try_send(bytes) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => match class {
                FrameClass::Typing | FrameClass::FileProgress => {
                    debug!(session = %target, event = name, "queue full, dropping soft frame");
                }
                FrameClass::Delivery => {
                    warn!(session = %target, event = name, "queue full, evicting session");
                    self.evictions.push(target.clone());
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.evictions.push(target.clone());
            }
        }
    }

    fn broadcast(&mut self, room_id: RoomId, event: &ServerEvent, exclude: Option<&SessionId>) {
        let recipients: Vec<SessionId> = match self.rooms.get(room_id) {
            Some(room) => room
                .member_ids()
                .iter()
                .filter(|m| exclude.map_or(true, |ex| *m != ex))
                .cloned()
                .collect(),
            None => return,
        };

        // encode once, share the bytes across recipients
        let bytes = event.encode();
        let class = event.frame_class();
        let name = event.event_name();
        for target in recipients {
            self.post_encoded(&target, bytes.clone(), class, name);
        }
    }

    fn drain_evictions(&mut self) {
        while let Some(sid) = self.evictions.pop() {
            if self.sessions.contains_key(&sid) {
                self.leave(&sid, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::events::EncryptedPayload;
    use crate::protocol::Frame;
    use serde_json::Value;
    use tokio::time::timeout;

    fn profile(user_id: &str, username: &str) -> JoinProfile {
        JoinProfile {
            user_id: user_id.to_string(),
            username: username.to_string(),
            preference: "group".to_string(),
            gender: "na".to_string(),
            room_type: "group".to_string(),
            group_join_method: Some("create".to_string()),
            group_code: None,
        }
    }

    fn join_profile(user_id: &str, username: &str, code: &str) -> JoinProfile {
        JoinProfile {
            group_join_method: Some("join".to_string()),
            group_code: Some(code.to_string()),
            ..profile(user_id, username)
        }
    }

    async fn connect(
        handle: &StoreHandle,
        depth: usize,
    ) -> (SessionId, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth);
        let sid = handle.connect(tx).await.unwrap();
        (sid, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<Bytes>) -> (String, Value) {
        let bytes = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        let frame = Frame::decode_complete(&bytes).unwrap();
        let envelope: Value = serde_json::from_str(frame.as_text().unwrap()).unwrap();
        (
            envelope["event"].as_str().unwrap().to_string(),
            envelope["data"].clone(),
        )
    }

    async fn create_group(handle: &StoreHandle, rx: &mut mpsc::Receiver<Bytes>, sid: &SessionId)
        -> String
    {
        handle
            .join_chat(sid.clone(), profile("u-create", "Creator"))
            .await
            .unwrap();
        let (event, data) = next_event(rx).await;
        assert_eq!(event, "chat_started");
        let code = data["groupCode"].as_str().unwrap().to_string();
        let (event, _) = next_event(rx).await;
        assert_eq!(event, "group_members_update");
        code
    }

    fn message(encrypted: &str) -> SendMessageData {
        SendMessageData {
            message: EncryptedPayload {
                encrypted: encrypted.to_string(),
                nonce: "N1".to_string(),
            },
            is_group_chat: true,
            group_code: None,
            reply_to_id: None,
        }
    }

    #[tokio::test]
    async fn test_send_fans_out_to_all_other_members() {
        let handle = RoomStore::spawn(StoreConfig::default());
        let (a, mut rx_a) = connect(&handle, 32).await;
        let (b, mut rx_b) = connect(&handle, 32).await;
        let (c, mut rx_c) = connect(&handle, 32).await;

        let code = create_group(&handle, &mut rx_a, &a).await;
        handle
            .join_chat(b.clone(), join_profile("u-b", "Bob", &code))
            .await
            .unwrap();
        handle
            .join_chat(c.clone(), join_profile("u-c", "Cal", &code))
            .await
            .unwrap();

        // drain membership traffic
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_a.recv()).await {}
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_b.recv()).await {}
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_c.recv()).await {}

        handle.send_message(b.clone(), message("E1")).await.unwrap();

        // exactly N-1 receive_message events, none to the sender
        let (event, data) = next_event(&mut rx_a).await;
        assert_eq!(event, "receive_message");
        assert_eq!(data["sender"], "u-b");
        assert_eq!(data["message"]["encrypted"], "E1");

        let (event, _) = next_event(&mut rx_c).await;
        assert_eq!(event, "receive_message");

        assert!(timeout(Duration::from_millis(200), rx_b.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_group_not_found_for_unknown_code() {
        let handle = RoomStore::spawn(StoreConfig::default());
        let (c, mut rx_c) = connect(&handle, 32).await;

        handle
            .join_chat(c.clone(), join_profile("u-c", "Cat", "ZZZZZZ"))
            .await
            .unwrap();

        let (event, _) = next_event(&mut rx_c).await;
        assert_eq!(event, "group_not_found");

        // the session stayed unjoined: a send goes nowhere and is not an error
        handle.send_message(c, message("E2")).await.unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.rooms, 0);
    }

    #[tokio::test]
    async fn test_room_claim_mismatch_dropped() {
        let handle = RoomStore::spawn(StoreConfig::default());
        let (a, mut rx_a) = connect(&handle, 32).await;
        let (b, mut rx_b) = connect(&handle, 32).await;

        let code = create_group(&handle, &mut rx_a, &a).await;
        handle
            .join_chat(b.clone(), join_profile("u-b", "Bob", &code))
            .await
            .unwrap();
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_a.recv()).await {}
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_b.recv()).await {}

        // wrong code
        let mut bad = message("E1");
        bad.group_code = Some("WRONG1".to_string());
        handle.send_message(b.clone(), bad).await.unwrap();

        // group member claiming a couple chat
        let mut bad = message("E2");
        bad.is_group_chat = false;
        handle.send_message(b.clone(), bad).await.unwrap();

        assert!(timeout(Duration::from_millis(200), rx_a.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_join_while_joined_is_dropped() {
        let handle = RoomStore::spawn(StoreConfig::default());
        let (a, mut rx_a) = connect(&handle, 32).await;
        let _code = create_group(&handle, &mut rx_a, &a).await;

        handle
            .join_chat(a.clone(), profile("u-a2", "Again"))
            .await
            .unwrap();

        // no second chat_started, no new room
        assert!(timeout(Duration::from_millis(200), rx_a.recv())
            .await
            .is_err());
        assert_eq!(handle.stats().await.unwrap().rooms, 1);
    }

    #[tokio::test]
    async fn test_queue_overflow_evicts_session() {
        let handle = RoomStore::spawn(StoreConfig::default());
        let (a, mut rx_a) = connect(&handle, 32).await;
        // b's queue only fits its own join traffic and is never drained
        let (b, _rx_b) = connect(&handle, 2).await;

        let code = create_group(&handle, &mut rx_a, &a).await;
        handle
            .join_chat(b.clone(), join_profile("u-b", "Bob", &code))
            .await
            .unwrap();
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_a.recv()).await {}

        // the delivery frame overflows b's full queue
        handle.send_message(a.clone(), message("E1")).await.unwrap();

        // b was evicted, so a sees the departure
        let (event, data) = next_event(&mut rx_a).await;
        assert_eq!(event, "user_left_group");
        assert_eq!(data, Value::String("Bob".to_string()));

        let (event, data) = next_event(&mut rx_a).await;
        assert_eq!(event, "group_members_update");
        assert_eq!(data, serde_json::json!(["Creator"]));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
    }

    #[tokio::test]
    async fn test_typing_frames_dropped_before_eviction() {
        let handle = RoomStore::spawn(StoreConfig::default());
        let (a, mut rx_a) = connect(&handle, 32).await;
        let (b, _rx_b) = connect(&handle, 2).await;

        let code = create_group(&handle, &mut rx_a, &a).await;
        handle
            .join_chat(b.clone(), join_profile("u-b", "Bob", &code))
            .await
            .unwrap();
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_a.recv()).await {}

        // b's queue is already full of join traffic; the typing frame is
        // shed without evicting the session
        handle
            .typing_start(
                a.clone(),
                TypingData {
                    is_group_chat: true,
                    group_code: None,
                },
            )
            .await
            .unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.rooms, 1);
    }

    #[tokio::test]
    async fn test_delete_message_relayed_without_checks() {
        let handle = RoomStore::spawn(StoreConfig::default());
        let (a, mut rx_a) = connect(&handle, 32).await;
        let (b, mut rx_b) = connect(&handle, 32).await;

        let code = create_group(&handle, &mut rx_a, &a).await;
        handle
            .join_chat(b.clone(), join_profile("u-b", "Bob", &code))
            .await
            .unwrap();
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_a.recv()).await {}
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), rx_b.recv()).await {}

        handle
            .delete_message(
                b.clone(),
                DeleteMessageData {
                    message_id: "m-42".to_string(),
                    is_group_chat: true,
                    group_code: Some(code),
                },
            )
            .await
            .unwrap();

        let (event, data) = next_event(&mut rx_a).await;
        assert_eq!(event, "message_deleted");
        assert_eq!(data["messageId"], "m-42");
        // not echoed to the requester
        assert!(timeout(Duration::from_millis(200), rx_b.recv())
            .await
            .is_err());
    }
}
