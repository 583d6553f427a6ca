// File-backed store: contacts in `contacts.json`, each conversation in its own
// `<conversation key>.json`, both as pretty-printed JSON.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{conversation_key, Contact, ContactStatus, DeliveryStatus, Message};

use super::{advance_status, upsert_message, ContactRepository, ContactUpdate, MessageRepository};

const CONTACTS_FILE: &str = "contacts.json";

pub struct JsonStore {
    dir: PathBuf,
    // Serialises read-modify-write cycles on the files
    io: Mutex<()>,
}

impl JsonStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        }
        info!("Using data directory {}", dir.display());
        Ok(JsonStore { dir, io: Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn contacts_path(&self) -> PathBuf {
        self.dir.join(CONTACTS_FILE)
    }

    fn conversation_path(&self, user_id: &str, peer_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", conversation_key(user_id, peer_id)))
    }

    fn with_contacts<T>(&self, f: impl FnOnce(&mut Vec<Contact>) -> (T, bool)) -> Option<T> {
        let _io = self.io.lock().ok()?;
        let path = self.contacts_path();
        let mut contacts: Vec<Contact> = log_err(read_json(&path), &path)?.unwrap_or_default();
        let (result, dirty) = f(&mut contacts);
        if dirty {
            log_err(write_json(&path, &contacts), &path)?;
        }
        Some(result)
    }

    fn with_conversation<T>(
        &self,
        user_id: &str,
        peer_id: &str,
        f: impl FnOnce(&mut Vec<Message>) -> (T, bool),
    ) -> Option<T> {
        let _io = self.io.lock().ok()?;
        let path = self.conversation_path(user_id, peer_id);
        let mut messages: Vec<Message> = log_err(read_json(&path), &path)?.unwrap_or_default();
        let (result, dirty) = f(&mut messages);
        if dirty {
            log_err(write_json(&path, &messages), &path)?;
        }
        Some(result)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let value = serde_json::from_str(&contents)?;
    Ok(Some(value))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

fn log_err<T>(result: Result<T>, path: &Path) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!("Storage error on {}: {}", path.display(), e);
            None
        }
    }
}

impl ContactRepository for JsonStore {
    fn add(&self, mut contact: Contact, status: ContactStatus) -> bool {
        contact.status = status;
        self.with_contacts(|contacts| match contacts.iter_mut().find(|c| c.peer_id == contact.peer_id) {
            Some(existing) if existing.is_live() => (false, false),
            Some(existing) => {
                *existing = contact;
                (true, true)
            }
            None => {
                contacts.push(contact);
                (true, true)
            }
        })
        .unwrap_or(false)
    }

    fn get(&self, peer_id: &str) -> Option<Contact> {
        self.with_contacts(|contacts| (contacts.iter().find(|c| c.peer_id == peer_id).cloned(), false))
            .flatten()
    }

    fn get_all(&self) -> Vec<Contact> {
        self.with_contacts(|contacts| (contacts.clone(), false)).unwrap_or_default()
    }

    fn update(&self, peer_id: &str, update: ContactUpdate) -> bool {
        self.with_contacts(|contacts| match contacts.iter_mut().find(|c| c.peer_id == peer_id) {
            Some(contact) => {
                update.apply(contact);
                (true, true)
            }
            None => (false, false),
        })
        .unwrap_or(false)
    }

    fn remove(&self, peer_id: &str) -> bool {
        self.with_contacts(|contacts| {
            let before = contacts.len();
            contacts.retain(|c| c.peer_id != peer_id);
            let removed = contacts.len() != before;
            (removed, removed)
        })
        .unwrap_or(false)
    }
}

impl MessageRepository for JsonStore {
    fn save_message(&self, user_id: &str, peer_id: &str, message: &Message) {
        self.with_conversation(user_id, peer_id, |messages| {
            upsert_message(messages, message);
            ((), true)
        });
    }

    fn get_messages(&self, user_id: &str, peer_id: &str) -> Vec<Message> {
        self.with_conversation(user_id, peer_id, |messages| (messages.clone(), false))
            .unwrap_or_default()
    }

    fn update_message_status(&self, user_id: &str, peer_id: &str, message_id: &str, status: DeliveryStatus) -> bool {
        self.with_conversation(user_id, peer_id, |messages| {
            let changed = advance_status(messages, message_id, status);
            (changed, changed)
        })
        .unwrap_or(false)
    }

    fn clear_messages(&self, user_id: &str, peer_id: &str) {
        let Ok(_io) = self.io.lock() else { return };
        let path = self.conversation_path(user_id, peer_id);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                error!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn contacts_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = JsonStore::open(dir.path()).unwrap();
            assert!(store.add(Contact::new("AAA-111", "Alice", ContactStatus::Pending), ContactStatus::Pending));
            assert!(store.update("AAA-111", ContactUpdate::status(ContactStatus::Accepted)));
        }
        let store = JsonStore::open(dir.path()).unwrap();
        let alice = store.get("AAA-111").expect("contact should be persisted");
        assert_eq!(alice.status, ContactStatus::Accepted);
        assert_eq!(alice.name, "Alice");

        let raw = fs::read_to_string(dir.path().join(CONTACTS_FILE)).unwrap();
        assert!(raw.contains("\"peerId\": \"AAA-111\""));
        assert!(raw.contains("\"status\": \"accepted\""));
    }

    #[test]
    fn conversation_file_is_keyed_symmetrically() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let message = Message {
            id: "m1".into(),
            sender_id: "XYZ-999".into(),
            receiver_id: "ABC-123".into(),
            content: "hi".into(),
            timestamp: Utc::now(),
            status: DeliveryStatus::Pending,
        };
        store.save_message("XYZ-999", "ABC-123", &message);
        assert!(dir.path().join("p2p_chat_messages_ABC-123_XYZ-999.json").exists());

        assert!(store.update_message_status("ABC-123", "XYZ-999", "m1", DeliveryStatus::Sent));
        assert!(!store.update_message_status("ABC-123", "XYZ-999", "m1", DeliveryStatus::Failed));
        let history = store.get_messages("ABC-123", "XYZ-999");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DeliveryStatus::Sent);

        store.clear_messages("ABC-123", "XYZ-999");
        assert!(store.get_messages("XYZ-999", "ABC-123").is_empty());
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONTACTS_FILE), "{ not json").unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(store.get_all().is_empty());
        assert!(!store.add(Contact::new("AAA-111", "Alice", ContactStatus::Pending), ContactStatus::Pending));
    }
}
