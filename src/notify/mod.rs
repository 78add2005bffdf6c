//! Notification hub: fans backend events out to independently registered subscribers.

pub mod events;
pub mod hub;

pub use events::NotificationEvent;
pub use hub::{EventReceiver, NotificationHub};
