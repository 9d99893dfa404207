//! Session-id handshake.
//!
//! The client writes a 4-byte little-endian length followed by that many
//! bytes of session id. The server validates the id and echoes the same
//! bytes back. Ids must be 1 to 255 bytes of UTF-8 and not blank.

use thiserror::Error;
use tracing::{debug, instrument};

use super::transport::{MessageTransport, TransportError};

pub const MAX_SESSION_ID_LENGTH: usize = 255;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Session id length {0} is outside 1..=255")]
    InvalidLength(usize),
    #[error("Session id is blank")]
    BlankId,
    #[error("Session id is not valid UTF-8")]
    InvalidEncoding,
    #[error("Server echoed {received:?}, expected {sent:?}")]
    Mismatch { sent: String, received: String },
    #[error("Handshake timed out")]
    Timeout,
    #[error("Transport error during handshake: {0}")]
    Transport(#[from] TransportError),
}

fn validate(bytes: &[u8]) -> Result<String, NegotiationError> {
    if bytes.is_empty() || bytes.len() > MAX_SESSION_ID_LENGTH {
        return Err(NegotiationError::InvalidLength(bytes.len()));
    }
    let id = std::str::from_utf8(bytes).map_err(|_| NegotiationError::InvalidEncoding)?;
    if id.trim().is_empty() {
        return Err(NegotiationError::BlankId);
    }
    Ok(id.to_string())
}

fn encode(bytes: &[u8]) -> Vec<u8> {
    let mut frame = (bytes.len() as u32).to_le_bytes().to_vec();
    frame.extend_from_slice(bytes);
    frame
}

async fn read_frame(transport: &dyn MessageTransport) -> Result<Vec<u8>, NegotiationError> {
    let header = transport.read_raw(4).await?;
    let mut length = [0u8; 4];
    length.copy_from_slice(&header);
    let length = u32::from_le_bytes(length) as usize;
    if length == 0 || length > MAX_SESSION_ID_LENGTH {
        return Err(NegotiationError::InvalidLength(length));
    }
    Ok(transport.read_raw(length).await?)
}

#[instrument(skip(transport))]
pub async fn negotiate_client(
    transport: &dyn MessageTransport,
    session_id: &str,
) -> Result<(), NegotiationError> {
    let sent = validate(session_id.as_bytes())?;
    transport.write_raw(&encode(sent.as_bytes())).await?;

    let echoed = read_frame(transport).await?;
    let received = validate(&echoed)?;
    if received != sent {
        return Err(NegotiationError::Mismatch { sent, received });
    }
    debug!("Client handshake complete");
    Ok(())
}

/// Reads and echoes the client's session id.
#[instrument(skip(transport))]
pub async fn negotiate_server(transport: &dyn MessageTransport) -> Result<String, NegotiationError> {
    let bytes = read_frame(transport).await?;
    let id = validate(&bytes)?;
    transport.write_raw(&encode(&bytes)).await?;
    debug!(session_id = %id, "Server handshake complete");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transport::memory_pair;

    #[tokio::test]
    async fn test_handshake_echoes_id() {
        let (client, server) = memory_pair(1024);
        let server_task = tokio::spawn(async move { negotiate_server(&server).await });
        negotiate_client(&client, "session-42").await.unwrap();
        assert_eq!(server_task.await.unwrap().unwrap(), "session-42");
    }

    #[tokio::test]
    async fn test_blank_id_is_rejected_by_server() {
        let (client, server) = memory_pair(1024);
        client.write_raw(&encode(b"   ")).await.unwrap();
        assert!(matches!(
            negotiate_server(&server).await,
            Err(NegotiationError::BlankId)
        ));
    }

    #[tokio::test]
    async fn test_length_out_of_range_is_rejected() {
        let (client, server) = memory_pair(1024);
        client.write_raw(&0u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            negotiate_server(&server).await,
            Err(NegotiationError::InvalidLength(0))
        ));

        let long = "x".repeat(MAX_SESSION_ID_LENGTH + 1);
        assert!(matches!(
            negotiate_client(&client, &long).await,
            Err(NegotiationError::InvalidLength(256))
        ));
    }
}
