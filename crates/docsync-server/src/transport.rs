//! A length-prefixed `postcard` framing over a `tokio::net::TcpStream`: each frame is a
//! little-endian `u32` byte length followed by the encoded payload.
//!
//! This is one demonstration adapter, not part of the core's public contract — the core accepts
//! any [`docsync_core::Transport`].

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use docsync_core::{CoreError, Transport};
use docsync_proto::{Message, PermissiveResolver};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

pub async fn write_frame(writer: &mut OwnedWriteHalf, payload: &[u8]) -> std::io::Result<()> {
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(payload).await
}

pub async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<Bytes>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// The write half of a TCP connection, serialized behind a mutex since the kernel socket
/// itself offers no write atomicity across concurrent callers.
pub struct TcpTransport {
    peer: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    pub fn new(peer: SocketAddr, writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self {
            peer,
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: Message) -> Result<(), CoreError> {
        let encoded = docsync_proto::encode(&message).map_err(|e| CoreError::Transport(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut writer, &encoded)
            .await
            .map_err(|e| CoreError::Transport(format!("{} ({})", e, self.peer)))
    }
}

/// Reads frames from `reader` until the connection closes, decoding each as a [`Message`] and
/// handing it to `on_message`. Decode errors terminate the connection (client ingress, per the
/// error taxonomy, is not forgiving of malformed frames the way the replication path is).
pub async fn read_loop<F, Fut>(mut reader: BufReader<OwnedReadHalf>, mut on_message: F)
where
    F: FnMut(Message) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(bytes)) => match docsync_proto::decode(&bytes, &PermissiveResolver) {
                Ok(message) => on_message(message).await,
                Err(err) => {
                    warn!(error = %err, "dropping connection on decode error");
                    return;
                }
            },
            Ok(None) => {
                debug!("connection closed by peer");
                return;
            }
            Err(err) => {
                warn!(error = %err, "read error, closing connection");
                return;
            }
        }
    }
}
