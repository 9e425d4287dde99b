//! Supervised duplex channel to the orchestration backend.
//!
//! One logical connection, length-prefixed JSON frames, automatic
//! reconnection with linear backoff, and typed dispatch of inbound
//! messages to registered handlers.

pub mod message;
pub mod supervisor;
pub mod wire;

pub use self::message::{Inbound, MessageKind, Outbound};
pub use self::supervisor::{ChannelError, ChannelState, ChannelSupervisor, HandlerId};
