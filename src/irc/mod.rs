//! IRC side of the bridge.

pub mod codec;
pub mod connection;
pub mod line;
pub mod listener;
pub mod manager;

pub use listener::{IrcListener, Listener};
pub use manager::{IrcManager, SpawningFactory};
