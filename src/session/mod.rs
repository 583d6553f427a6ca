// Chat session layer: connection lifecycle, message delivery, contacts and the
// coordinator that ties them to signaling and negotiation.

pub mod contacts;
pub mod coordinator;
pub mod delivery;
pub mod lifecycle;

pub use contacts::ContactService;
pub use coordinator::{
    ChatCoordinator, ContactRequest, ContactResponse, CoordinatorBuilder, CoordinatorConfig, CoordinatorError,
    CoordinatorEvents,
};
pub use delivery::{DeliveryConfig, DeliveryError, MessagePipeline};
pub use lifecycle::{ConnectionLifecycle, LifecycleConfig};
