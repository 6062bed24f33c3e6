//! Bridge coordination between IRC and Discord.
//!
//! ## Module Structure
//!
//! - `mapping`: IRC <-> Discord channel pairs (`MappingRegistry`)
//! - `channels`: Event queues and the control handle
//! - `orchestrator`: The coordinator event loop (`Bridge` struct)

pub mod channels;
pub mod mapping;
pub mod orchestrator;

pub use channels::{BridgeHandle, ChannelBundle};
pub use mapping::Mapping;
pub use orchestrator::{Bridge, Collaborators};
