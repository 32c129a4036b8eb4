//! The host↔guest agent RPC.
//!
//! A session speaks line-delimited JSON over the stdio of one guest process,
//! the `pid1d` agent. The host side lives in [`session`], the guest side in
//! [`server`], and the wire format in [`protocol`].

pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{Request, Response};
pub use session::{AgentSession, ChildStdioTransport, Transport};
