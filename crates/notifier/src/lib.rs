//! Notification delivery: per-destination ordering and the apprise transport.

pub mod format;
pub mod serializer;
pub mod transport;

pub use serializer::NotificationSerializer;
pub use transport::AppriseTransport;
