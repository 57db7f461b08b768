//! Duplex message channels carrying handshake tokens.
//!
//! The handshake needs only ordered, reliable delivery with preserved message
//! boundaries. [`MemoryClaimStream`] connects two in-process parties;
//! [`LineClaimStream`] runs over any async byte stream as newline-delimited
//! JSON.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use trellis_sigchain::SignedClaim;

use crate::error::{HandshakeError, Result};

/// One handshake step on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSignMessage {
    #[serde(
        rename = "signedTokenEncoded",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub signed_token_encoded: Option<String>,
}

impl CrossSignMessage {
    pub fn from_token(token: &SignedClaim) -> Result<Self> {
        Ok(Self {
            signed_token_encoded: Some(token.encode()?),
        })
    }

    /// Decodes the carried token. An absent or empty token is malformed.
    pub fn decode_token(&self) -> Result<SignedClaim> {
        let encoded = match self.signed_token_encoded.as_deref() {
            Some(encoded) if !encoded.is_empty() => encoded,
            _ => {
                return Err(HandshakeError::MalformedMessage(
                    "message carries no signed token".to_string(),
                ))
            }
        };
        SignedClaim::decode(encoded).map_err(|e| HandshakeError::MalformedMessage(e.to_string()))
    }
}

#[async_trait]
pub trait ClaimStream: Send {
    async fn send(&mut self, message: CrossSignMessage) -> Result<()>;

    /// Next message from the peer.
    ///
    /// `Ok(None)` means the peer closed its side cleanly. An abort from the
    /// peer surfaces as [`HandshakeError::Remote`].
    async fn recv(&mut self) -> Result<Option<CrossSignMessage>>;

    /// Signal that nothing more will be sent.
    async fn close(&mut self) -> Result<()>;

    /// Tell the peer the handshake failed, then close.
    async fn abort(&mut self, reason: &str) -> Result<()>;
}

#[derive(Debug)]
enum Frame {
    Message(CrossSignMessage),
    Abort(String),
}

/// In-process channel endpoint backed by tokio mpsc.
#[derive(Debug)]
pub struct MemoryClaimStream {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryClaimStream {
    /// Two connected endpoints.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(8)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(a_tx),
                rx: a_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(HandshakeError::ChannelClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| HandshakeError::ChannelClosed)
    }
}

#[async_trait]
impl ClaimStream for MemoryClaimStream {
    async fn send(&mut self, message: CrossSignMessage) -> Result<()> {
        self.send_frame(Frame::Message(message)).await
    }

    async fn recv(&mut self) -> Result<Option<CrossSignMessage>> {
        match self.rx.recv().await {
            Some(Frame::Message(message)) => Ok(Some(message)),
            Some(Frame::Abort(reason)) => Err(HandshakeError::Remote(reason)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }

    async fn abort(&mut self, reason: &str) -> Result<()> {
        // Peer may already be gone.
        let _ = self.send_frame(Frame::Abort(reason.to_string())).await;
        self.tx = None;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signed_token_encoded: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Newline-delimited JSON framing over an async byte stream.
///
/// Each line is one `{"signedTokenEncoded": ...}` object; an abort is sent as
/// `{"error": <reason>}`. Closing shuts down the write half.
pub struct LineClaimStream<R, W> {
    lines: Lines<BufReader<R>>,
    writer: Option<W>,
}

impl<R, W> LineClaimStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer: Some(writer),
        }
    }

    async fn write_frame(&mut self, frame: &WireFrame) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(HandshakeError::ChannelClosed)?;
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<R, W> ClaimStream for LineClaimStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: CrossSignMessage) -> Result<()> {
        self.write_frame(&WireFrame {
            signed_token_encoded: message.signed_token_encoded,
            error: None,
        })
        .await
    }

    async fn recv(&mut self) -> Result<Option<CrossSignMessage>> {
        let Some(line) = self.lines.next_line().await? else {
            return Ok(None);
        };
        let frame: WireFrame = serde_json::from_str(&line)
            .map_err(|e| HandshakeError::MalformedMessage(e.to_string()))?;
        if let Some(reason) = frame.error {
            return Err(HandshakeError::Remote(reason));
        }
        Ok(Some(CrossSignMessage {
            signed_token_encoded: frame.signed_token_encoded,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown().await
    }

    async fn abort(&mut self, reason: &str) -> Result<()> {
        let _ = self
            .write_frame(&WireFrame {
                signed_token_encoded: None,
                error: Some(reason.to_string()),
            })
            .await;
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> CrossSignMessage {
        CrossSignMessage {
            signed_token_encoded: Some(text.to_string()),
        }
    }

    #[test]
    fn test_wire_field_name() {
        let json = serde_json::to_string(&message("abc")).unwrap();
        assert_eq!(json, r#"{"signedTokenEncoded":"abc"}"#);
        let empty: CrossSignMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, CrossSignMessage::default());
    }

    #[test]
    fn test_empty_message_is_malformed() {
        let err = CrossSignMessage::default().decode_token().unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedMessage(_)));
        assert!(err.is_untrusted());
        assert!(message("").decode_token().is_err());
        assert!(message("@@@").decode_token().is_err());
    }

    #[tokio::test]
    async fn test_memory_pair_delivers_in_order() {
        let (mut a, mut b) = MemoryClaimStream::pair();
        a.send(message("one")).await.unwrap();
        a.send(message("two")).await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(message("one")));
        assert_eq!(b.recv().await.unwrap(), Some(message("two")));
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(matches!(
            a.send(message("three")).await,
            Err(HandshakeError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_memory_abort_reaches_peer() {
        let (mut a, mut b) = MemoryClaimStream::pair();
        a.abort("bad claim").await.unwrap();
        match b.recv().await {
            Err(HandshakeError::Remote(reason)) => assert_eq!(reason, "bad claim"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_line_stream_over_duplex() {
        let (left, right) = tokio::io::duplex(4096);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let mut a = LineClaimStream::new(lr, lw);
        let mut b = LineClaimStream::new(rr, rw);

        a.send(message("one")).await.unwrap();
        a.send(CrossSignMessage::default()).await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(message("one")));
        assert_eq!(b.recv().await.unwrap(), Some(CrossSignMessage::default()));
        assert_eq!(b.recv().await.unwrap(), None);

        b.abort("nope").await.unwrap();
        assert!(matches!(a.recv().await, Err(HandshakeError::Remote(_))));
    }
}
