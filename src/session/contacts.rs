// Contact handshake: requests, responses and removal, on top of the contact
// repository and the signaling transport.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::models::{Contact, ContactStatus};
use crate::signaling::{SignalingMessage, SignalingTransport};
use crate::storage::{ContactRepository, ContactUpdate};

#[derive(Clone)]
pub struct ContactService {
    user_id: String,
    display_name: String,
    repository: Arc<dyn ContactRepository>,
    signaling: SignalingTransport,
}

impl ContactService {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        repository: Arc<dyn ContactRepository>,
        signaling: SignalingTransport,
    ) -> Self {
        ContactService {
            user_id: user_id.into(),
            display_name: display_name.into(),
            repository,
            signaling,
        }
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.repository.get_all()
    }

    pub fn contact(&self, peer: &str) -> Option<Contact> {
        self.repository.get(peer)
    }

    /// Record `peer` as a contact we asked. Returns false for ourselves or a
    /// peer that is already a live contact.
    pub fn add_contact(&self, peer: &str, name: &str) -> bool {
        if peer == self.user_id {
            warn!("Refusing to add ourselves as a contact");
            return false;
        }
        let name = if name.trim().is_empty() { peer } else { name };
        let added = self
            .repository
            .add(Contact::new(peer, name, ContactStatus::RequestSent), ContactStatus::RequestSent);
        if added {
            info!("Added contact {} ({})", peer, name);
        } else {
            debug!("{} is already a contact", peer);
        }
        added
    }

    /// Ask `peer` to add us, introducing ourselves by display name.
    pub async fn send_contact_request(&self, peer: &str) {
        let request = SignalingMessage::ContactRequest {
            from: self.user_id.clone(),
            to: peer.to_string(),
            name: self.display_name.clone(),
        };
        self.signaling.send(request, peer).await;
    }

    pub async fn accept_contact(&self, peer: &str, name: &str) -> bool {
        let mut update = ContactUpdate::status(ContactStatus::Accepted);
        if !name.trim().is_empty() {
            update = update.with_name(name);
        }
        if !self.repository.update(peer, update) {
            warn!("Cannot accept unknown contact {}", peer);
            return false;
        }
        let response = SignalingMessage::ContactResponse {
            from: self.user_id.clone(),
            to: peer.to_string(),
            accepted: true,
            name: Some(self.display_name.clone()),
        };
        self.signaling.send(response, peer).await;
        info!("Accepted contact {}", peer);
        true
    }

    pub async fn decline_contact(&self, peer: &str) -> bool {
        if !self.repository.update(peer, ContactUpdate::status(ContactStatus::Deleted)) {
            warn!("Cannot decline unknown contact {}", peer);
            return false;
        }
        let response = SignalingMessage::ContactResponse {
            from: self.user_id.clone(),
            to: peer.to_string(),
            accepted: false,
            name: None,
        };
        self.signaling.send(response, peer).await;
        info!("Declined contact {}", peer);
        true
    }

    /// Soft delete. The conversation is kept and the peer is not told.
    pub fn remove_contact(&self, peer: &str) -> bool {
        let removed = self.repository.soft_delete(peer);
        if removed {
            info!("Removed contact {}", peer);
        }
        removed
    }

    /// Create a pending contact for an unknown (or deleted) sender.
    ///
    /// # Returns
    ///
    /// The new contact, or `None` if a live one already existed
    pub fn ensure_contact_exists(&self, peer: &str, name: Option<&str>) -> Option<Contact> {
        if self.repository.get(peer).map(|c| c.is_live()).unwrap_or(false) {
            return None;
        }
        let contact = Contact::new(peer, name.unwrap_or(peer), ContactStatus::Pending);
        if self.repository.add(contact.clone(), ContactStatus::Pending) {
            info!("New pending contact {} ({})", peer, contact.name);
            Some(contact)
        } else {
            None
        }
    }

    /// Apply the peer's answer to our request.
    pub fn apply_contact_response(&self, peer: &str, accepted: bool, name: Option<&str>) -> bool {
        let status = if accepted { ContactStatus::Accepted } else { ContactStatus::Deleted };
        let mut update = ContactUpdate::status(status);
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            update = update.with_name(name);
        }
        let updated = self.repository.update(peer, update);
        if updated {
            info!("{} {} our contact request", peer, if accepted { "accepted" } else { "declined" });
        } else {
            warn!("Contact response from unknown peer {}", peer);
        }
        updated
    }

    pub fn mark_remotely_deleted(&self, peer: &str) -> bool {
        let updated = self
            .repository
            .update(peer, ContactUpdate::status(ContactStatus::RemotelyDeleted));
        if updated {
            info!("{} removed us from their contacts", peer);
        }
        updated
    }
}
