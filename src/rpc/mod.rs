//! Request/reply transport between governors and from agents.
//!
//! Frames are length-delimited JSON. A connection starts with a [`Hello`]
//! naming its channel; after that the client sends [`RequestFrame`]s and the
//! server answers each with one [`ReplyFrame`] carrying the same id.
//!
//! [`Hello`]: messages::Hello
//! [`RequestFrame`]: messages::RequestFrame
//! [`ReplyFrame`]: messages::ReplyFrame

pub mod client;
pub mod codec;
pub mod messages;
pub mod server;

pub use client::{AgentClient, RpcConnection, TcpPeerClient};
pub use messages::{AgentRequest, GovernorRequest, Reply};
pub use server::serve;
