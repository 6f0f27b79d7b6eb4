//! Pieces shared by both endpoints: the error type, the user-facing command
//! call, and the per-connection serialization context.

use std::rc::Rc;

use crate::codec::{
    CodecError, Decoder, Encoder, ReadArena, TypeDesc, Value, decode_value, encode_value,
};
use crate::command::{CallReply, CommandDictionary, CommandHandle, DictionaryError, ReplyFn};
use crate::protocol::PacketError;
use crate::token::TokenError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("network io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Dictionary(#[from] DictionaryError),
    #[error("client id is stale or unknown")]
    InvalidClient,
    #[error("no client at that local index")]
    InvalidLocalIndex,
    #[error("command handle is not registered")]
    UnknownCommand,
    #[error("endpoint is not connected")]
    NotConnected,
    #[error("no server is running")]
    NoServer,
    #[error("server is full")]
    ServerFull,
}

/// One outgoing command invocation. Attach a completion with `with_reply`
/// to receive the remote result (or a cancellation).
pub struct Call {
    pub handle: CommandHandle,
    pub args: Value,
    pub on_reply: Option<ReplyFn>,
}

impl Call {
    pub fn new(handle: CommandHandle, args: Value) -> Self {
        Self {
            handle,
            args,
            on_reply: None,
        }
    }

    pub fn with_reply(mut self, callback: impl FnOnce(CallReply) + 'static) -> Self {
        self.on_reply = Some(Box::new(callback));
        self
    }
}

/// Shared dictionary plus this connection's decode arena and encode
/// scratch. One per connection; the dictionary itself is shared.
pub struct SerializationContext {
    dictionary: Rc<CommandDictionary>,
    arena: ReadArena,
}

impl SerializationContext {
    pub fn new(dictionary: Rc<CommandDictionary>) -> Self {
        Self {
            dictionary,
            arena: ReadArena::new(),
        }
    }

    pub fn dictionary(&self) -> &CommandDictionary {
        &self.dictionary
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let mut enc = Encoder::new(self.dictionary.mphf());
        encode_value(&mut enc, value)?;
        Ok(enc.finish())
    }

    pub fn decode(&mut self, desc: &TypeDesc, payload: &[u8]) -> Result<Value, CodecError> {
        let mut dec = Decoder::new(&mut self.arena, self.dictionary.mphf(), payload)?;
        decode_value(&mut dec, desc)
    }

    /// Encodes an optional command result; absent results travel as an
    /// empty payload.
    pub fn encode_result(&self, result: &Option<Value>) -> Result<Vec<u8>, CodecError> {
        match result {
            Some(value) => self.encode(value),
            None => Ok(Vec::new()),
        }
    }

    pub fn decode_result(
        &mut self,
        desc: &Option<TypeDesc>,
        payload: &[u8],
    ) -> Result<Option<Value>, CodecError> {
        match desc {
            Some(desc) if !payload.is_empty() => Ok(Some(self.decode(desc, payload)?)),
            _ => Ok(None),
        }
    }
}
