pub mod bus;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod queue;
pub mod resolver;
pub mod types;

pub use bus::EventBus;
pub use classifier::{Classification, ItemChange, classify};
pub use config::DispatchConfig;
pub use dispatcher::{ChangeDispatcher, Consumers, DispatchReport};
pub use queue::{
    NotificationReceiver, Notifier, QueueStats, spawn_dispatch_loop,
};
pub use resolver::{ChangeSet, ancestor_change_set, item_change_set};
pub use types::*;
