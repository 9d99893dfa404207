use thiserror::Error;

use super::message::Message;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Converts one message to and from its payload bytes. Framing is the
/// transport's job.
pub trait MessageCodec: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, message: &Message) -> CodecResult<Vec<u8>>;
    fn decode(&self, payload: &[u8]) -> CodecResult<Message>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, message: &Message) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(message).map_err(CodecError::Encode)
    }

    fn decode(&self, payload: &[u8]) -> CodecResult<Message> {
        serde_json::from_slice(payload).map_err(CodecError::Decode)
    }
}
