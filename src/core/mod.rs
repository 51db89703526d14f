//! Core shared types for packet metering
//!
//! Provides the data structures the rest of the pipeline is built on:
//! - `PacketDescriptor`: normalized view of one captured packet
//! - `parser`: raw frame dissection
//! - `stats`: online distribution statistics

pub mod packet;
pub mod parser;
pub mod stats;

pub use packet::{Direction, IpProtocol, PacketDescriptor, TcpFlags};
pub use parser::{dissect_ethernet, dissect_ip, DissectSkip};
pub use stats::RunningStats;
