//! Wire format of the pairing handshake: short newline-terminated text tokens.

use std::fmt;
use std::io;
use std::time::Duration;

use libp2p::StreamProtocol;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MATCH_PROTOCOL: StreamProtocol = StreamProtocol::new("/match/1.0.0/chat-public-111");

/// Upper bound on one handshake message, newline included.
pub const MAX_TOKEN_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeToken {
    Match,
    Accept,
    Accepted,
    Reject,
}

impl HandshakeToken {
    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeToken::Match => "MATCH",
            HandshakeToken::Accept => "ACCEPT",
            HandshakeToken::Accepted => "ACCEPTED",
            HandshakeToken::Reject => "REJECT",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "MATCH" => Some(HandshakeToken::Match),
            "ACCEPT" => Some(HandshakeToken::Accept),
            "ACCEPTED" => Some(HandshakeToken::Accepted),
            "REJECT" => Some(HandshakeToken::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for HandshakeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("stream closed by remote")]
    Closed,
    #[error("message longer than {} bytes", MAX_TOKEN_LEN)]
    TooLong,
    #[error("expected {expected}, got {got:?}")]
    Unexpected {
        expected: HandshakeToken,
        got: String,
    },
    #[error("remote rejected the request")]
    Rejected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub async fn write_token<W>(writer: &mut W, token: HandshakeToken) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(token.as_str().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one line of at most [`MAX_TOKEN_LEN`] bytes within `deadline` and
/// returns it trimmed. Reads byte by byte so nothing past the newline is
/// consumed.
pub async fn read_line<R>(reader: &mut R, deadline: Duration) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let mut buf = Vec::with_capacity(16);
        loop {
            let mut byte = [0u8; 1];
            let n = reader.read(&mut byte).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Err(HandshakeError::Closed);
                }
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
            if buf.len() >= MAX_TOKEN_LEN {
                return Err(HandshakeError::TooLong);
            }
        }
        Ok(String::from_utf8_lossy(&buf).trim().to_string())
    };

    tokio::time::timeout(deadline, read)
        .await
        .map_err(|_| HandshakeError::Timeout(deadline))?
}

/// Reads the next message and checks it is `expected`. A `REJECT` in its
/// place is reported as [`HandshakeError::Rejected`].
pub async fn expect_token<R>(
    reader: &mut R,
    expected: HandshakeToken,
    deadline: Duration,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let line = read_line(reader, deadline).await?;
    match HandshakeToken::parse(&line) {
        Some(token) if token == expected => Ok(()),
        Some(HandshakeToken::Reject) => Err(HandshakeError::Rejected),
        _ => Err(HandshakeError::Unexpected { expected, got: line }),
    }
}
