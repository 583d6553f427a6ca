// Contact and message persistence.
//
// Repositories are synchronous and infallible from the caller's side; backing
// store errors are logged by the implementation.

use crate::models::{Contact, ContactStatus, DeliveryStatus, Message};

pub mod json;
pub mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

/// Fields to change on an existing contact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactUpdate {
    pub name: Option<String>,
    pub status: Option<ContactStatus>,
}

impl ContactUpdate {
    pub fn status(status: ContactStatus) -> Self {
        ContactUpdate { name: None, status: Some(status) }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn apply(&self, contact: &mut Contact) {
        if let Some(name) = &self.name {
            contact.name = name.clone();
        }
        if let Some(status) = self.status {
            contact.status = status;
        }
    }
}

pub trait ContactRepository: Send + Sync {
    /// Insert `contact` with `status`. Returns false if a live record for the
    /// peer already exists; a deleted record is overwritten.
    fn add(&self, contact: Contact, status: ContactStatus) -> bool;
    fn get(&self, peer_id: &str) -> Option<Contact>;
    fn get_all(&self) -> Vec<Contact>;
    /// Returns false if there is no such contact.
    fn update(&self, peer_id: &str, update: ContactUpdate) -> bool;
    /// Remove the record entirely.
    fn remove(&self, peer_id: &str) -> bool;
    /// Mark the record deleted, keeping it (and its history) around.
    fn soft_delete(&self, peer_id: &str) -> bool {
        self.update(peer_id, ContactUpdate::status(ContactStatus::Deleted))
    }
}

pub trait MessageRepository: Send + Sync {
    /// Append, or replace the message with the same id.
    fn save_message(&self, user_id: &str, peer_id: &str, message: &Message);
    /// Conversation history in insertion order.
    fn get_messages(&self, user_id: &str, peer_id: &str) -> Vec<Message>;
    /// Move a message forward. Returns false if it is unknown or the change
    /// would move its status backwards.
    fn update_message_status(&self, user_id: &str, peer_id: &str, message_id: &str, status: DeliveryStatus) -> bool;
    /// Messages authored by `user_id` still waiting to go out.
    fn get_pending_messages(&self, user_id: &str, peer_id: &str) -> Vec<Message> {
        self.get_messages(user_id, peer_id)
            .into_iter()
            .filter(|m| m.sender_id == user_id && m.status == DeliveryStatus::Pending)
            .collect()
    }
    fn clear_messages(&self, user_id: &str, peer_id: &str);
}

/// Shared upsert rule for conversation vectors.
pub(crate) fn upsert_message(messages: &mut Vec<Message>, message: &Message) {
    match messages.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message.clone(),
        None => messages.push(message.clone()),
    }
}

/// Shared forward-only status rule.
pub(crate) fn advance_status(messages: &mut [Message], message_id: &str, status: DeliveryStatus) -> bool {
    match messages.iter_mut().find(|m| m.id == message_id) {
        Some(message) if message.status.can_advance_to(status) => {
            message.status = status;
            true
        }
        Some(message) => {
            log::warn!(
                "Refusing to move message {} from {:?} back to {:?}",
                message_id,
                message.status,
                status
            );
            false
        }
        None => false,
    }
}
