// Peer-to-peer chat core: broker signaling, WebRTC data channels, contacts and
// message delivery.

pub mod config;
pub mod events;
pub mod identity;
pub mod models;
pub mod retry;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod storage;

// Re-export main types for convenience
pub use models::*;
pub use session::{ChatCoordinator, CoordinatorBuilder, CoordinatorError};
