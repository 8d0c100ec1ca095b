//! Binary encode/decode for [`Message`], plus the RPC method resolver hook.
//!
//! Grounded on `crates/broker/broker/src/ipc.rs`'s test helpers, which frame `postcard`-encoded
//! IPC messages with a little-endian `u32` length prefix. The framing itself (length prefix
//! over a byte stream) is a transport concern and lives in `docsync-server`; this module only
//! covers the payload codec.

use bytes::Bytes;

use crate::error::DecodeError;
use crate::message::{Message, MessagePayload};

/// Lets a node tell the codec which RPC methods it has handlers for, so that decode can flag
/// unknown methods without needing to fully resolve their payload shape.
pub trait RpcResolver: Send + Sync {
    fn is_known_method(&self, method: &str) -> bool;
}

/// A resolver that treats every method as known; suitable for replication paths where method
/// dispatch has already happened on the originating node.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveResolver;

impl RpcResolver for PermissiveResolver {
    fn is_known_method(&self, _method: &str) -> bool {
        true
    }
}

/// Encodes a message to its canonical wire form.
pub fn encode(message: &Message) -> Result<Bytes, DecodeError> {
    let bytes = postcard::to_allocvec(message)?;
    Ok(Bytes::from(bytes))
}

/// Decodes a message, tagging any RPC payload with whether `resolver` recognizes its method.
pub fn decode(bytes: &[u8], resolver: &dyn RpcResolver) -> Result<Message, DecodeError> {
    let mut message: Message = postcard::from_bytes(bytes)?;
    if let MessagePayload::Rpc(rpc) = &mut message.payload {
        rpc.method_known = resolver.is_known_method(&rpc.method);
    }
    Ok(message)
}
