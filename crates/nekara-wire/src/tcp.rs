//! Framed TCP transport between nodes on different hosts.
//!
//! A [`TcpTransport`] binds a local listener and accepts connections from
//! other nodes; it also dials out with [`TcpTransport::connect`]. Every
//! connection opens with a hello frame in each direction carrying the node
//! id, after which the connection is addressable by that id both ways and
//! carries protocol payloads. Frames are a 4-byte big-endian length header
//! followed by the UTF-8 JSON body.

use crate::error::{WireError, WireResult};
use crate::message::{decode_length, encode_frame};
use crate::node::Node;
use crate::transport::Transport;
use async_trait::async_trait;
use nekara_types::config::WireConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// First frame on every connection, in both directions.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    node_id: String,
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Transport over length-prefixed JSON frames on TCP.
pub struct TcpTransport {
    local_addr: SocketAddr,
    max_message_size: u32,
    node: RwLock<Option<Weak<Node>>>,
    connections: RwLock<HashMap<String, SharedWriter>>,
}

impl TcpTransport {
    /// Bind the configured listen address and start accepting connections.
    pub async fn bind(config: &WireConfig) -> WireResult<(Arc<Self>, JoinHandle<()>)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            node_name = %config.node_name,
            "TCP transport listening"
        );

        let transport = Arc::new(Self {
            local_addr,
            max_message_size: config.max_message_size,
            node: RwLock::new(None),
            connections: RwLock::new(HashMap::new()),
        });

        let accepting = Arc::clone(&transport);
        let accept_handle = tokio::spawn(async move {
            accepting.accept_loop(listener).await;
        });

        Ok((transport, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Deliver inbound payloads to `node`. Only a weak reference is kept.
    pub fn attach(&self, node: &Arc<Node>) {
        let mut slot = self.node.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::downgrade(node));
    }

    fn node(&self) -> Option<Arc<Node>> {
        let slot = self.node.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().and_then(Weak::upgrade)
    }

    /// Ids of peers with an open connection, sorted.
    pub fn connected_peers(&self) -> Vec<String> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Dial a peer, exchange hellos and return the peer's node id.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> WireResult<String> {
        let local_id = self
            .node()
            .map(|node| node.id().to_string())
            .ok_or_else(|| WireError::HandshakeFailed("no node attached".to_string()))?;

        info!(addr = %addr, "Connecting to peer");
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_hello(&mut writer, &local_id, self.max_message_size).await?;
        let peer_id = read_hello(&mut reader, self.max_message_size).await?;
        info!(peer = %peer_id, addr = %addr, "Connected to peer");

        let writer = self.register_connection(&peer_id, writer);
        let transport = Arc::clone(self);
        let reader_peer = peer_id.clone();
        tokio::spawn(async move {
            transport.read_loop(&reader_peer, reader, writer).await;
        });

        Ok(peer_id)
    }

    /// Accept loop, run in a spawned task.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(addr = %addr, "Accepted connection");
                    let transport = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = transport.handle_inbound(stream, addr).await {
                            debug!(addr = %addr, error = %e, "Inbound connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Handle a single inbound connection: exchange hellos, then read frames.
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> WireResult<()> {
        let (mut reader, mut writer) = stream.into_split();

        let peer_id = read_hello(&mut reader, self.max_message_size).await?;
        let local_id = self
            .node()
            .map(|node| node.id().to_string())
            .ok_or_else(|| WireError::HandshakeFailed("no node attached".to_string()))?;
        write_hello(&mut writer, &local_id, self.max_message_size).await?;
        info!(peer = %peer_id, addr = %addr, "Peer connected");

        let writer = self.register_connection(&peer_id, writer);
        self.read_loop(&peer_id, reader, writer).await;
        Ok(())
    }

    fn register_connection(&self, peer_id: &str, writer: OwnedWriteHalf) -> SharedWriter {
        let writer = Arc::new(Mutex::new(writer));
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.insert(peer_id.to_string(), Arc::clone(&writer));
        writer
    }

    /// Read frames until the connection closes, feeding each to the node.
    async fn read_loop(&self, peer_id: &str, mut reader: OwnedReadHalf, writer: SharedWriter) {
        loop {
            let payload = match read_frame(&mut reader, self.max_message_size).await {
                Ok(payload) => payload,
                Err(WireError::ConnectionClosed) => break,
                Err(e) => {
                    debug!(peer = %peer_id, error = %e, "Connection read failed");
                    break;
                }
            };
            let Some(node) = self.node() else {
                break;
            };
            if let Err(e) = node.handle_message(&payload) {
                debug!(peer = %peer_id, error = %e, "Inbound payload rejected");
            }
        }

        // A newer connection for the same peer may have replaced this one.
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if connections
            .get(peer_id)
            .is_some_and(|current| Arc::ptr_eq(current, &writer))
        {
            connections.remove(peer_id);
        }
        info!(peer = %peer_id, "Peer disconnected");
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, recipient: &str, payload: String) -> WireResult<()> {
        // Payloads for the attached node itself never touch the network.
        if let Some(node) = self.node().filter(|node| node.id() == recipient) {
            if let Err(e) = node.handle_message(&payload) {
                debug!(error = %e, "Loopback payload rejected");
            }
            return Ok(());
        }

        let writer = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            connections.get(recipient).cloned()
        };
        let writer = writer.ok_or_else(|| WireError::UnknownRecipient(recipient.to_string()))?;
        let mut writer = writer.lock().await;
        write_frame(&mut *writer, &payload, self.max_message_size).await
    }
}

/// Write a framed payload (4-byte length + body).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &str,
    max: u32,
) -> WireResult<()> {
    let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if size > max {
        return Err(WireError::MessageTooLarge { size, max });
    }
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed payload (4-byte length + body).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max: u32) -> WireResult<String> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max {
        return Err(WireError::MessageTooLarge { size: len, max });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    String::from_utf8(body)
        .map_err(|e| WireError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

async fn write_hello<W: AsyncWrite + Unpin>(writer: &mut W, node_id: &str, max: u32) -> WireResult<()> {
    let hello = serde_json::to_string(&Hello {
        node_id: node_id.to_string(),
    })?;
    write_frame(writer, &hello, max).await
}

async fn read_hello<R: AsyncRead + Unpin>(reader: &mut R, max: u32) -> WireResult<String> {
    let frame = read_frame(reader, max).await?;
    let hello: Hello = serde_json::from_str(&frame)
        .map_err(|e| WireError::HandshakeFailed(format!("invalid hello: {e}")))?;
    if hello.node_id.is_empty() {
        return Err(WireError::HandshakeFailed("empty node id".to_string()));
    }
    Ok(hello.node_id)
}
