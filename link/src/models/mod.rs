//! Wire messages and configuration models for cable-link.

pub mod cable_options;
pub mod client_command;
pub mod history;
pub mod message_meta;
pub mod monitor_options;
pub mod server_message;


pub use cable_options::{CableOptions, HistoryTimestamp, PerformFailures, ProtocolVersion};
pub use client_command::ClientCommand;
pub use history::{HistoryRequest, StreamPosition};
pub use message_meta::MessageMeta;
pub use monitor_options::{BackoffOptions, MonitorOptions};
pub use server_message::{MessageType, ServerMessage};
