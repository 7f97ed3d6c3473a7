use message::Message;
use thiserror::Error;

pub mod config;
pub mod maintainer;
pub mod manager;
#[allow(clippy::module_inception)]
pub mod queue;

pub use self::config::QueueConfig;
pub use self::manager::QueueManager;
pub use self::queue::{Queue, QueueHandle};

#[derive(Error, Debug)]
#[error("The Ready Queue is full")]
pub struct ReadyQueueFull;

#[must_use]
enum InsertResult {
    Delayed,
    Ready(Message),
}

/// Whether a requeue operation counts as a delivery attempt
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IncrementAttempts {
    No,
    Yes,
}
