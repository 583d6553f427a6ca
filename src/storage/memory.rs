use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::{conversation_key, Contact, ContactStatus, DeliveryStatus, Message};

use super::{advance_status, upsert_message, ContactRepository, ContactUpdate, MessageRepository};

/// Process-local store, used by tests and when no data directory is configured.
#[derive(Default)]
pub struct MemoryStore {
    contacts: RwLock<Vec<Contact>>,
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContactRepository for MemoryStore {
    fn add(&self, mut contact: Contact, status: ContactStatus) -> bool {
        let Ok(mut contacts) = self.contacts.write() else { return false };
        contact.status = status;
        match contacts.iter_mut().find(|c| c.peer_id == contact.peer_id) {
            Some(existing) if existing.is_live() => false,
            Some(existing) => {
                *existing = contact;
                true
            }
            None => {
                contacts.push(contact);
                true
            }
        }
    }

    fn get(&self, peer_id: &str) -> Option<Contact> {
        self.contacts.read().ok()?.iter().find(|c| c.peer_id == peer_id).cloned()
    }

    fn get_all(&self) -> Vec<Contact> {
        self.contacts.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn update(&self, peer_id: &str, update: ContactUpdate) -> bool {
        let Ok(mut contacts) = self.contacts.write() else { return false };
        match contacts.iter_mut().find(|c| c.peer_id == peer_id) {
            Some(contact) => {
                update.apply(contact);
                true
            }
            None => false,
        }
    }

    fn remove(&self, peer_id: &str) -> bool {
        let Ok(mut contacts) = self.contacts.write() else { return false };
        let before = contacts.len();
        contacts.retain(|c| c.peer_id != peer_id);
        contacts.len() != before
    }
}

impl MessageRepository for MemoryStore {
    fn save_message(&self, user_id: &str, peer_id: &str, message: &Message) {
        if let Ok(mut conversations) = self.conversations.write() {
            let messages = conversations.entry(conversation_key(user_id, peer_id)).or_default();
            upsert_message(messages, message);
        }
    }

    fn get_messages(&self, user_id: &str, peer_id: &str) -> Vec<Message> {
        self.conversations
            .read()
            .ok()
            .and_then(|c| c.get(&conversation_key(user_id, peer_id)).cloned())
            .unwrap_or_default()
    }

    fn update_message_status(&self, user_id: &str, peer_id: &str, message_id: &str, status: DeliveryStatus) -> bool {
        let Ok(mut conversations) = self.conversations.write() else { return false };
        match conversations.get_mut(&conversation_key(user_id, peer_id)) {
            Some(messages) => advance_status(messages, message_id, status),
            None => false,
        }
    }

    fn clear_messages(&self, user_id: &str, peer_id: &str) {
        if let Ok(mut conversations) = self.conversations.write() {
            conversations.remove(&conversation_key(user_id, peer_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: &str, sender: &str, receiver: &str, status: DeliveryStatus) -> Message {
        Message {
            id: id.to_string(),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            content: format!("content of {}", id),
            timestamp: Utc::now(),
            status,
        }
    }

    #[test]
    fn add_refuses_live_duplicates_but_revives_deleted() {
        let store = MemoryStore::new();
        assert!(store.add(Contact::new("XYZ-999", "Bob", ContactStatus::Pending), ContactStatus::RequestSent));
        assert!(!store.add(Contact::new("XYZ-999", "Robert", ContactStatus::Pending), ContactStatus::Pending));
        assert_eq!(store.get("XYZ-999").unwrap().status, ContactStatus::RequestSent);

        assert!(store.soft_delete("XYZ-999"));
        assert!(store.add(Contact::new("XYZ-999", "Robert", ContactStatus::Pending), ContactStatus::Pending));
        let contact = store.get("XYZ-999").unwrap();
        assert_eq!(contact.name, "Robert");
        assert_eq!(contact.status, ContactStatus::Pending);
        assert_eq!(store.get_all().len(), 1);
    }

    #[test]
    fn update_and_remove() {
        let store = MemoryStore::new();
        assert!(!store.update("nobody", ContactUpdate::status(ContactStatus::Accepted)));
        store.add(Contact::new("AAA-111", "AAA-111", ContactStatus::Pending), ContactStatus::Pending);
        assert!(store.update("AAA-111", ContactUpdate::status(ContactStatus::Accepted).with_name("Alice")));
        let contact = store.get("AAA-111").unwrap();
        assert_eq!((contact.name.as_str(), contact.status), ("Alice", ContactStatus::Accepted));
        assert!(store.remove("AAA-111"));
        assert!(store.get("AAA-111").is_none());
    }

    #[test]
    fn conversation_is_shared_by_both_directions() {
        let store = MemoryStore::new();
        store.save_message("ABC-123", "XYZ-999", &message("1", "ABC-123", "XYZ-999", DeliveryStatus::Pending));
        store.save_message("XYZ-999", "ABC-123", &message("2", "XYZ-999", "ABC-123", DeliveryStatus::Delivered));
        let history = store.get_messages("ABC-123", "XYZ-999");
        assert_eq!(history.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);

        // Same id replaces in place
        store.save_message("ABC-123", "XYZ-999", &message("1", "ABC-123", "XYZ-999", DeliveryStatus::Sent));
        assert_eq!(store.get_messages("XYZ-999", "ABC-123").len(), 2);
    }

    #[test]
    fn pending_filter_and_monotonic_status() {
        let store = MemoryStore::new();
        store.save_message("ABC-123", "XYZ-999", &message("1", "ABC-123", "XYZ-999", DeliveryStatus::Pending));
        store.save_message("ABC-123", "XYZ-999", &message("2", "XYZ-999", "ABC-123", DeliveryStatus::Pending));
        store.save_message("ABC-123", "XYZ-999", &message("3", "ABC-123", "XYZ-999", DeliveryStatus::Sent));

        let pending = store.get_pending_messages("ABC-123", "XYZ-999");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "1");

        assert!(store.update_message_status("ABC-123", "XYZ-999", "1", DeliveryStatus::Sent));
        assert!(!store.update_message_status("ABC-123", "XYZ-999", "1", DeliveryStatus::Pending));
        assert!(!store.update_message_status("ABC-123", "XYZ-999", "missing", DeliveryStatus::Sent));
        assert!(store.get_pending_messages("ABC-123", "XYZ-999").is_empty());

        store.clear_messages("XYZ-999", "ABC-123");
        assert!(store.get_messages("ABC-123", "XYZ-999").is_empty());
    }
}
