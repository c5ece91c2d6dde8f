//! Pane lifecycle: PTY, ring buffer, screen snapshot, registries.

pub mod pane;
pub mod pty;
pub mod registry;
pub mod ring_buffer;
pub mod snapshot;
pub mod subscriptions;

pub use pane::{Pane, PaneId, PaneSpec};
pub use registry::PaneRegistry;
pub use subscriptions::SubscriptionRegistry;
