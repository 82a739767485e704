//! Room state for the relay
//!
//! This module holds the passive data structures the room store owns: the
//! room arena with its code index, the couple waiting pool, and the typing
//! tracker. All mutation goes through the store's command loop; nothing in
//! here is shared.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

/// Server-assigned, opaque session identifier
pub type SessionId = String;

/// Room identifier within the arena
pub type RoomId = u64;

/// How many codes to try at the configured length before widening
const CODE_RETRIES: usize = 8;

/// How much a code widens after repeated collisions (6 -> 8 with defaults)
const CODE_WIDENING: usize = 2;

/// A two-person room. Terminal on any departure.
#[derive(Debug)]
pub struct CoupleRoom {
    pub id: RoomId,
    pub members: [SessionId; 2],
    pub created_at: Instant,
}

/// A code-identified group room. Member order is insertion order and is
/// preserved for display.
#[derive(Debug)]
pub struct GroupRoom {
    pub id: RoomId,
    pub code: String,
    pub members: Vec<SessionId>,
    pub created_at: Instant,
}

impl GroupRoom {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A live room
#[derive(Debug)]
pub enum Room {
    Couple(CoupleRoom),
    Group(GroupRoom),
}

impl Room {
    pub fn id(&self) -> RoomId {
        match self {
            Room::Couple(r) => r.id,
            Room::Group(r) => r.id,
        }
    }

    /// Member session ids in display order
    pub fn member_ids(&self) -> &[SessionId] {
        match self {
            Room::Couple(r) => &r.members,
            Room::Group(r) => &r.members,
        }
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.member_ids().iter().any(|m| m == session)
    }

    /// The group code, if this is a group room
    pub fn code(&self) -> Option<&str> {
        match self {
            Room::Couple(_) => None,
            Room::Group(r) => Some(&r.code),
        }
    }
}

/// The room arena plus the code -> room index.
///
/// Invariants: a code maps to at most one live room, and every indexed code
/// belongs to a live group room. Entries leave the index atomically with
/// room destruction.
#[derive(Debug, Default)]
pub struct RoomSet {
    rooms: HashMap<RoomId, Room>,
    code_index: HashMap<String, RoomId>,
    next_id: RoomId,
}

impl RoomSet {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            code_index: HashMap::new(),
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> RoomId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Create a couple room with exactly two members
    pub fn insert_couple(&mut self, a: SessionId, b: SessionId) -> RoomId {
        let id = self.next_id();
        self.rooms.insert(
            id,
            Room::Couple(CoupleRoom {
                id,
                members: [a, b],
                created_at: Instant::now(),
            }),
        );
        id
    }

    /// Create a group room under `code` with its first member.
    /// The code must not be in use.
    pub fn insert_group(&mut self, code: String, creator: SessionId) -> RoomId {
        debug_assert!(!self.code_index.contains_key(&code));
        let id = self.next_id();
        self.code_index.insert(code.clone(), id);
        self.rooms.insert(
            id,
            Room::Group(GroupRoom {
                id,
                code,
                members: vec![creator],
                created_at: Instant::now(),
            }),
        );
        id
    }

    pub fn get(&self, id: RoomId) -> Option<&Room> {
        self.rooms.get(&id)
    }

    /// Get a group room mutably; None for couple rooms or unknown ids
    pub fn group_mut(&mut self, id: RoomId) -> Option<&mut GroupRoom> {
        match self.rooms.get_mut(&id) {
            Some(Room::Group(room)) => Some(room),
            _ => None,
        }
    }

    pub fn id_by_code(&self, code: &str) -> Option<RoomId> {
        self.code_index.get(code).copied()
    }

    /// Destroy a room, removing its code index entry in the same step
    pub fn remove(&mut self, id: RoomId) -> Option<Room> {
        let room = self.rooms.remove(&id)?;
        if let Room::Group(ref group) = room {
            self.code_index.remove(&group.code);
        }
        Some(room)
    }

    /// Pick a random live group room id, if any exist
    pub fn random_group_id(&self) -> Option<RoomId> {
        let group_ids: Vec<RoomId> = self
            .rooms
            .values()
            .filter_map(|room| match room {
                Room::Group(g) if !g.is_empty() => Some(g.id),
                _ => None,
            })
            .collect();
        if group_ids.is_empty() {
            None
        } else {
            Some(group_ids[thread_rng().gen_range(0..group_ids.len())])
        }
    }

    /// Allocate a fresh group code: `len` characters drawn uniformly from
    /// `alphabet`, retried on collision, widened after repeated collisions.
    pub fn allocate_code(&self, alphabet: &str, len: usize) -> Option<String> {
        let symbols: Vec<char> = alphabet.chars().collect();
        if symbols.is_empty() {
            return None;
        }

        let mut rng = thread_rng();
        for width in [len, len + CODE_WIDENING] {
            for _ in 0..CODE_RETRIES {
                let code: String = (0..width)
                    .map(|_| symbols[rng.gen_range(0..symbols.len())])
                    .collect();
                if !self.code_index.contains_key(&code) {
                    return Some(code);
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn code_count(&self) -> usize {
        self.code_index.len()
    }
}

/// FIFO of sessions awaiting a couple partner
#[derive(Debug, Default)]
pub struct WaitingPool {
    queue: VecDeque<(SessionId, Instant)>,
}

impl WaitingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, session: SessionId, now: Instant) {
        self.queue.push_back((session, now));
    }

    /// Pop the longest-waiting session
    pub fn pop(&mut self) -> Option<SessionId> {
        self.queue.pop_front().map(|(session, _)| session)
    }

    pub fn remove(&mut self, session: &SessionId) {
        self.queue.retain(|(id, _)| id != session);
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.queue.iter().any(|(id, _)| id == session)
    }

    /// Drain sessions that have waited longer than `timeout`
    pub fn expire(&mut self, timeout: Duration, now: Instant) -> Vec<SessionId> {
        let mut expired = Vec::new();
        while let Some((_, since)) = self.queue.front() {
            if now.duration_since(*since) < timeout {
                break;
            }
            // front is the oldest entry, so expiry stops at the first
            // waiter still within the bound
            if let Some((session, _)) = self.queue.pop_front() {
                expired.push(session);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Per-room typing state with a soft expiry per sender
#[derive(Debug, Default)]
pub struct TypingState {
    by_room: HashMap<RoomId, HashMap<SessionId, Instant>>,
}

impl TypingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a typing start. Returns true when the sender was not already
    /// typing (a broadcast is due); redundant starts only refresh the timer.
    pub fn start(&mut self, room: RoomId, session: SessionId, now: Instant) -> bool {
        self.by_room
            .entry(room)
            .or_default()
            .insert(session, now)
            .is_none()
    }

    /// Record a typing stop. Returns true when the sender was typing.
    pub fn stop(&mut self, room: RoomId, session: &SessionId) -> bool {
        match self.by_room.get_mut(&room) {
            Some(senders) => {
                let was_typing = senders.remove(session).is_some();
                if senders.is_empty() {
                    self.by_room.remove(&room);
                }
                was_typing
            }
            None => false,
        }
    }

    /// Forget a sender without emitting anything (departures)
    pub fn forget(&mut self, room: RoomId, session: &SessionId) {
        self.stop(room, session);
    }

    /// Drop all state for a destroyed room
    pub fn drop_room(&mut self, room: RoomId) {
        self.by_room.remove(&room);
    }

    /// Collect senders whose typing indicator has outlived `ttl`; each is
    /// removed and owed a synthetic stop broadcast.
    pub fn expire(&mut self, ttl: Duration, now: Instant) -> Vec<(RoomId, SessionId)> {
        let mut expired = Vec::new();
        for (room, senders) in &mut self.by_room {
            senders.retain(|session, since| {
                if now.duration_since(*since) >= ttl {
                    expired.push((*room, session.clone()));
                    false
                } else {
                    true
                }
            });
        }
        self.by_room.retain(|_, senders| !senders.is_empty());
        expired
    }

    pub fn is_typing(&self, room: RoomId, session: &SessionId) -> bool {
        self.by_room
            .get(&room)
            .map(|senders| senders.contains_key(session))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u32) -> SessionId {
        format!("session-{}", n)
    }

    #[test]
    fn test_group_lifecycle() {
        let mut rooms = RoomSet::new();
        let code = rooms.allocate_code("ABC123", 6).unwrap();
        assert_eq!(code.len(), 6);

        let id = rooms.insert_group(code.clone(), sid(1));
        assert_eq!(rooms.id_by_code(&code), Some(id));
        assert!(rooms.get(id).unwrap().contains(&sid(1)));

        rooms.group_mut(id).unwrap().members.push(sid(2));
        assert_eq!(rooms.get(id).unwrap().member_ids().len(), 2);

        let removed = rooms.remove(id).unwrap();
        assert_eq!(removed.code(), Some(code.as_str()));
        // the index entry leaves with the room
        assert_eq!(rooms.id_by_code(&code), None);
        assert_eq!(rooms.code_count(), 0);
    }

    #[test]
    fn test_codes_are_unique_while_live() {
        let mut rooms = RoomSet::new();
        let mut seen = std::collections::HashSet::new();
        for n in 0..100 {
            let code = rooms.allocate_code("AB", 6).unwrap();
            assert!(seen.insert(code.clone()));
            rooms.insert_group(code, sid(n));
        }
    }

    #[test]
    fn test_code_widens_after_collisions() {
        let mut rooms = RoomSet::new();
        // exhaust the one-character space so allocation must widen
        rooms.insert_group("A".to_string(), sid(1));
        rooms.insert_group("B".to_string(), sid(2));

        let code = rooms.allocate_code("AB", 1).unwrap();
        assert_eq!(code.len(), 3);
    }

    #[test]
    fn test_allocate_code_empty_alphabet() {
        let rooms = RoomSet::new();
        assert!(rooms.allocate_code("", 6).is_none());
    }

    #[test]
    fn test_couple_room() {
        let mut rooms = RoomSet::new();
        let id = rooms.insert_couple(sid(1), sid(2));
        let room = rooms.get(id).unwrap();
        assert_eq!(room.member_ids(), &[sid(1), sid(2)]);
        assert!(room.code().is_none());
        assert!(rooms.remove(id).is_some());
        assert!(rooms.is_empty());
    }

    #[test]
    fn test_waiting_pool_fifo() {
        let now = Instant::now();
        let mut pool = WaitingPool::new();
        pool.push(sid(1), now);
        pool.push(sid(2), now);

        assert_eq!(pool.pop(), Some(sid(1)));
        assert_eq!(pool.pop(), Some(sid(2)));
        assert!(pool.pop().is_none());
    }

    #[test]
    fn test_waiting_pool_remove_and_expire() {
        let start = Instant::now();
        let mut pool = WaitingPool::new();
        pool.push(sid(1), start);
        pool.push(sid(2), start + Duration::from_secs(30));

        pool.remove(&sid(1));
        assert!(!pool.contains(&sid(1)));

        let expired = pool.expire(Duration::from_secs(60), start + Duration::from_secs(95));
        assert_eq!(expired, vec![sid(2)]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_expire_keeps_recent_waiters() {
        let start = Instant::now();
        let mut pool = WaitingPool::new();
        pool.push(sid(1), start);
        pool.push(sid(2), start + Duration::from_secs(50));

        let expired = pool.expire(Duration::from_secs(60), start + Duration::from_secs(70));
        assert_eq!(expired, vec![sid(1)]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_typing_idempotent_start() {
        let now = Instant::now();
        let mut typing = TypingState::new();

        assert!(typing.start(1, sid(1), now));
        // repeated start refreshes but does not warrant a new broadcast
        assert!(!typing.start(1, sid(1), now + Duration::from_secs(1)));

        assert!(typing.stop(1, &sid(1)));
        assert!(!typing.stop(1, &sid(1)));
    }

    #[test]
    fn test_typing_expiry() {
        let start = Instant::now();
        let mut typing = TypingState::new();
        typing.start(1, sid(1), start);
        typing.start(1, sid(2), start + Duration::from_secs(4));

        let expired = typing.expire(Duration::from_secs(5), start + Duration::from_secs(6));
        assert_eq!(expired, vec![(1, sid(1))]);
        assert!(typing.is_typing(1, &sid(2)));

        // a refreshed start pushes expiry out
        typing.start(1, sid(2), start + Duration::from_secs(8));
        let expired = typing.expire(Duration::from_secs(5), start + Duration::from_secs(10));
        assert!(expired.is_empty());
    }

    #[test]
    fn test_typing_drop_room() {
        let now = Instant::now();
        let mut typing = TypingState::new();
        typing.start(1, sid(1), now);
        typing.drop_room(1);
        assert!(!typing.is_typing(1, &sid(1)));
    }
}
