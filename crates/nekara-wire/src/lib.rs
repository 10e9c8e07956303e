//! Nekara node protocol: peer-to-peer request/response correlation.
//!
//! A node invokes named functions on a remote peer and receives the result
//! asynchronously, without knowing how bytes move between processes.
//!
//! ## Architecture
//!
//! - **Node**: correlation engine (`request`, `respond`, `handle_message`)
//! - **PendingTable**: outstanding requests, each settled exactly once
//! - **MethodRegistry / PeerRegistry**: exposed functions and known peers
//! - **RequestMessage / ResponseMessage**: the JSON wire shapes
//! - **Transport**: the send capability a node is built on
//!   ([`MemoryNetwork`] in-process, [`TcpTransport`] over framed TCP)

pub mod error;
pub mod handler;
pub mod message;
pub mod node;
pub mod peer;
pub mod pending;
pub mod registry;
pub mod tcp;
pub mod transport;

pub use error::{RemoteError, RequestError, WireError, WireResult};
pub use handler::{IncomingCall, RemoteMethod, Responder};
pub use message::{Inbound, Message, RequestMessage, ResponseMessage};
pub use node::Node;
pub use peer::PeerHandle;
pub use pending::{CancelHandle, PendingCall, PendingTable, Settlement};
pub use registry::{MethodRegistry, PeerRegistry};
pub use tcp::TcpTransport;
pub use transport::{MemoryNetwork, Transport};
