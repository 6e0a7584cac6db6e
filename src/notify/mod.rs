//! Notification collaborator.
//!
//! # Data Flow
//! ```text
//! store (terminal, not notified, due)
//!     → notifier.rs (scan, attempt, backoff bookkeeping)
//!     → publisher.rs (log or webhook)
//! ```

pub mod notifier;
pub mod publisher;

pub use notifier::Notifier;
pub use publisher::{LogPublisher, Notification, NotifyError, Publisher, WebhookPublisher};
