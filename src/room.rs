//! Rooms and the room registry
//!
//! Lock layout:
//! - `RoomRegistry::rooms` guards only the name → room map.
//! - `Room::members` guards one room's membership and its broadcasts.
//!
//! Registry-wide operations take the registry lock and then visit rooms one
//! at a time; no code path holds two room locks at once. Rooms are created
//! on first use and never removed.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::info;

use crate::client::{Client, Delivery};
use crate::message::{Envelope, Rendered, RoomSummary};
use crate::types::{ClientId, LOBBY};

/// Named multicast group
///
/// Members are held weakly: a room never keeps a client alive.
#[derive(Debug)]
pub struct Room {
    name: String,
    members: RwLock<HashMap<ClientId, Weak<Client>>>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ClientId, Weak<Client>>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ClientId, Weak<Client>>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a member
    pub(crate) fn insert(&self, client: &Arc<Client>) {
        self.write().insert(client.id(), Arc::downgrade(client));
    }

    /// Remove a member, returning whether it was present
    pub(crate) fn remove(&self, id: ClientId) -> bool {
        self.write().remove(&id).is_some()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.read().contains_key(&id)
    }

    /// Number of live members
    pub fn len(&self) -> usize {
        self.read().values().filter(|m| m.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted usernames of live members
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .map(|c| c.username().to_string())
            .collect();
        names.sort_unstable_by_key(|n| n.to_lowercase());
        names
    }

    /// Deliver to every member except `except`
    ///
    /// Rendered once per transport. Never waits on a recipient; full
    /// mailboxes drop the message. Holds the exclusive lock so every member
    /// sees this room's broadcasts in the same order. Returns how many
    /// mailboxes accepted it.
    pub fn broadcast(&self, envelope: &Envelope, except: Option<ClientId>) -> usize {
        let rendered = Rendered::new(envelope);
        let members = self.write();
        let mut queued = 0;
        for (id, member) in members.iter() {
            if Some(*id) == except {
                continue;
            }
            let Some(member) = member.upgrade() else {
                continue;
            };
            if member.deliver_rendered(&rendered) == Delivery::Queued {
                queued += 1;
            }
        }
        queued
    }

    /// Push this room's member list to every structured-transport member
    pub fn push_user_list(&self) {
        let snapshot = Envelope::users(self.name.clone(), self.usernames());
        let rendered = Rendered::new(&snapshot);
        let members = self.write();
        for member in members.values().filter_map(Weak::upgrade) {
            if member.transport().is_structured() {
                member.deliver_rendered(&rendered);
            }
        }
    }

    /// Deliver to every member whose name matches case-insensitively
    ///
    /// Returns the number of matching members.
    pub fn deliver_to_username(&self, username: &str, envelope: &Envelope) -> usize {
        let wanted = username.to_lowercase();
        let rendered = Rendered::new(envelope);
        let members = self.read();
        let mut matched = 0;
        for member in members.values().filter_map(Weak::upgrade) {
            if member.username().to_lowercase() == wanted {
                member.deliver_rendered(&rendered);
                matched += 1;
            }
        }
        matched
    }
}

/// Directory of all rooms
///
/// Created once at startup with the lobby already present.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        let mut rooms = HashMap::new();
        rooms.insert(LOBBY.to_string(), Arc::new(Room::new(LOBBY)));
        Self {
            rooms: RwLock::new(rooms),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a room without creating it
    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.read().get(name).cloned()
    }

    /// Return the named room, creating it if needed
    pub fn get_or_create(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.get(name) {
            return room;
        }
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(rooms.entry(name.to_string()).or_insert_with(|| {
            info!("Room created: #{}", name);
            Arc::new(Room::new(name))
        }))
    }

    /// Room names with live member counts, sorted by name
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        let rooms = self.read();
        let mut summaries: Vec<RoomSummary> = rooms
            .values()
            .map(|room| RoomSummary {
                name: room.name().to_string(),
                count: room.len(),
            })
            .collect();
        summaries.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Deliver to every member of every room whose username matches
    ///
    /// Returns the number of recipients.
    pub fn deliver_to_username(&self, username: &str, envelope: &Envelope) -> usize {
        let rooms = self.read();
        rooms
            .values()
            .map(|room| room.deliver_to_username(username, envelope))
            .sum()
    }

    /// Number of rooms
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
