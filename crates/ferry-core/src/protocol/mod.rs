//! Protocol engine: connections, channels and the per-channel state machine

mod active;
mod auth;
mod blacklist;
mod block;
mod connection;
mod control;
mod data;
mod framing;
mod fsm;
mod network;
mod packet;
pub(crate) mod requester;
mod responder;
mod tls;

pub use active::{Abort, ActiveChannels, ActiveGuard, ChannelControl};
pub use block::BlockOptions;
pub use connection::{Channel, ChannelAcceptor, Connection};
pub use control::{request as control_request, ControlReply, ControlRequest};
pub use fsm::{transition, Action, ChannelState};
pub use network::NetworkTransaction;
pub use packet::{InfoKind, Packet, PacketType, PROTOCOL_VERSION};
pub use responder::Responder;
