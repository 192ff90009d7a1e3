//! ChatServer: shared state and command dispatch
//!
//! One `ChatServer` is created at startup and handed to every connection
//! handler as `Arc<ChatServer>`. All operations here are synchronous and
//! hold locks only for in-memory work, never across socket I/O.
//!
//! Lock order: client room slot → registry → one room → mailbox.

use std::sync::Arc;

use tracing::{debug, info};

use crate::client::Client;
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::message::{Command, Envelope};
use crate::room::{Room, RoomRegistry};
use crate::types::normalize_room_name;

/// What the connection handler should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Process-wide chat state
#[derive(Debug)]
pub struct ChatServer {
    config: ServerConfig,
    registry: RoomRegistry,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: RoomRegistry::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Run one client command
    ///
    /// User errors are reported to the client and never end the connection.
    pub fn dispatch(&self, client: &Arc<Client>, command: Command) -> Flow {
        let result = match command {
            Command::Say(text) => self.say(client, &text),
            Command::Join(room) => match normalize_room_name(&room) {
                Some(room) => self.join(client, &room),
                None => Err(AppError::Usage("/join <room>")),
            },
            Command::Rooms => {
                client.deliver(&Envelope::rooms(self.registry.list_rooms()));
                Ok(())
            }
            Command::Users(room) => self.list_users(client, room.as_deref()),
            Command::Direct { target, text } => self.direct_message(client, &target, &text),
            Command::Login(_) => Err(AppError::AlreadyLoggedIn),
            Command::Quit => {
                client.deliver(&Envelope::system("👋  Goodbye!"));
                return Flow::Quit;
            }
        };

        if let Err(err) = result {
            debug!("{} ({}): {}", client.username(), client.id(), err);
            client.deliver(&err.into());
        }
        Flow::Continue
    }

    /// Move `client` into `room_name`, creating the room if needed
    ///
    /// Leaves the previous room first; the client's room slot stays locked
    /// for the whole move so it is never in two rooms.
    pub fn join(&self, client: &Arc<Client>, room_name: &str) -> Result<(), AppError> {
        let mut slot = client.room_slot();
        if let Some(current) = slot.as_ref() {
            if current.name() == room_name {
                return Err(AppError::AlreadyInRoom(room_name.to_string()));
            }
        }
        if let Some(previous) = slot.take() {
            self.depart(client, &previous);
        }

        let room = self.registry.get_or_create(room_name);
        room.insert(client);
        *slot = Some(Arc::clone(&room));
        drop(slot);

        client.deliver(&Envelope::system(format!("✅  Joined #{room_name}")));
        room.broadcast(
            &Envelope::system(format!("📢  {} joined #{}", client.username(), room_name)),
            Some(client.id()),
        );
        room.push_user_list();

        info!("[{}] joined #{}", client.username(), room_name);
        Ok(())
    }

    /// Take `client` out of its current room, if any
    pub fn leave(&self, client: &Arc<Client>) {
        let mut slot = client.room_slot();
        if let Some(room) = slot.take() {
            self.depart(client, &room);
        }
    }

    fn depart(&self, client: &Client, room: &Room) {
        if !room.remove(client.id()) {
            return;
        }
        room.broadcast(
            &Envelope::system(format!("🚪  {} left #{}", client.username(), room.name())),
            Some(client.id()),
        );
        room.push_user_list();
        info!("[{}] left #{}", client.username(), room.name());
    }

    /// Tear down a disconnected client: leave its room, close its mailbox
    pub fn disconnect(&self, client: &Arc<Client>) {
        self.leave(client);
        client.close();
    }

    /// Broadcast a room message and echo it back to the sender
    pub fn say(&self, client: &Arc<Client>, text: &str) -> Result<(), AppError> {
        let room = client.current_room().ok_or(AppError::NotInRoom)?;

        let envelope = Envelope::msg(client.username(), room.name(), text);
        info!("#{} <{}> {}", room.name(), client.username(), text);
        room.broadcast(&envelope, Some(client.id()));

        let echo_from = if client.transport().is_structured() {
            client.username()
        } else {
            "you"
        };
        client.deliver(&Envelope::msg(echo_from, room.name(), text));
        Ok(())
    }

    /// Send `text` to every connected client named `target`
    pub fn direct_message(
        &self,
        sender: &Arc<Client>,
        target: &str,
        text: &str,
    ) -> Result<(), AppError> {
        let delivered = self
            .registry
            .deliver_to_username(target, &Envelope::dm(sender.username(), text));
        if delivered == 0 {
            return Err(AppError::UserNotFound(target.to_string()));
        }
        debug!("DM {} -> {} ({} recipients)", sender.username(), target, delivered);
        sender.deliver(&Envelope::system(format!("🔒  [DM to {target}]: {text}")));
        Ok(())
    }

    /// Send the member list of `room` (or the current room) to `client`
    pub fn list_users(&self, client: &Arc<Client>, room: Option<&str>) -> Result<(), AppError> {
        let room = match room {
            Some(name) => {
                let name = normalize_room_name(name).unwrap_or_default();
                self.registry
                    .get(&name)
                    .ok_or(AppError::RoomNotFound(name))?
            }
            None => client.current_room().ok_or(AppError::NotInRoom)?,
        };
        client.deliver(&Envelope::users(room.name(), room.usernames()));
        Ok(())
    }
}
