//! A framed connection over an upgraded byte stream.
//!
//! `ConnectionChannel` owns the stream and the reassembly state for
//! fragmented messages. Control frames are answered inside `receive`:
//! pings get a pong, pongs are dropped, and a close is echoed before the
//! stream is shut down.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use super::frame::{
    encode_message, is_disconnect, read_frame, FrameError, OpCode, Role, DEFAULT_MAX_MESSAGE_SIZE,
};

/// Outcome of `ConnectionChannel::receive`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A complete application message.
    Data { opcode: OpCode, payload: Bytes },
    /// The peer closed the connection or the stream ended.
    Closed,
}

impl Message {
    pub fn is_closed(&self) -> bool {
        matches!(self, Message::Closed)
    }

    /// Message payload, or `None` for `Closed`.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Message::Data { payload, .. } => Some(payload),
            Message::Closed => None,
        }
    }
}

/// A fragmented message that has not seen its final frame yet.
#[derive(Debug)]
struct Fragment {
    opcode: OpCode,
    buffer: BytesMut,
}

/// One upgraded connection.
///
/// Meant for a single owner: `send` and `receive` take `&mut self`, so
/// concurrent use needs external synchronization.
pub struct ConnectionChannel<S> {
    stream: BufReader<S>,
    role: Role,
    fragment: Option<Fragment>,
    max_message_size: usize,
    close_sent: bool,
    closed: bool,
}

impl<S> ConnectionChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream whose upgrade handshake has already completed.
    pub fn new(stream: S, role: Role) -> Self {
        Self::from_buffered(BufReader::new(stream), role)
    }

    /// Wrap a buffered stream, keeping any bytes read past the handshake.
    pub(crate) fn from_buffered(stream: BufReader<S>, role: Role) -> Self {
        Self {
            stream,
            role,
            fragment: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            close_sent: false,
            closed: false,
        }
    }

    /// Cap the size of a single frame and of a reassembled message.
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send a message, split into `fragment`-byte frames if requested.
    pub async fn send(
        &mut self,
        payload: &[u8],
        opcode: OpCode,
        fragment: Option<usize>,
    ) -> Result<(), FrameError> {
        if self.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }

        let bytes = encode_message(payload, opcode, self.role, fragment);
        let stream = self.stream.get_mut();
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        if opcode == OpCode::Close {
            self.close_sent = true;
        }
        Ok(())
    }

    /// Send a single unfragmented text message.
    pub async fn send_text(&mut self, text: &str) -> Result<(), FrameError> {
        self.send(text.as_bytes(), OpCode::Text, None).await
    }

    /// Wait for the next application message.
    ///
    /// Handles control frames and reassembles fragments along the way. A
    /// stream that ends or resets, even mid-frame, yields `Message::Closed`.
    pub async fn receive(&mut self) -> Result<Message, FrameError> {
        if self.closed {
            return Ok(Message::Closed);
        }

        loop {
            let frame = match read_frame(&mut self.stream, self.max_message_size).await? {
                Some(frame) => frame,
                None => {
                    trace!(role = ?self.role, "Stream ended");
                    self.closed = true;
                    return Ok(Message::Closed);
                }
            };

            if frame.mask.is_some() != self.role.expects_masked() {
                debug!(
                    role = ?self.role,
                    masked = frame.mask.is_some(),
                    "Frame masking does not match peer role"
                );
            }

            match frame.opcode {
                OpCode::Close => {
                    trace!(role = ?self.role, "Close frame received");
                    // A close we started is already answered by this frame.
                    if !self.close_sent {
                        if let Err(e) = self.send(&frame.payload, OpCode::Close, None).await {
                            debug!(error = %e, "Failed to echo close frame");
                        }
                    }
                    self.close().await;
                    return Ok(Message::Closed);
                }

                OpCode::Ping => {
                    trace!(len = frame.payload.len(), "Ping received");
                    match self.send(&frame.payload, OpCode::Pong, None).await {
                        Ok(()) => {}
                        Err(FrameError::Io(e)) if is_disconnect(&e) => {
                            self.closed = true;
                            return Ok(Message::Closed);
                        }
                        Err(e) => return Err(e),
                    }
                }

                OpCode::Pong => {}

                OpCode::Continuation => {
                    // Without a start frame the message type is unknown, so
                    // it is delivered as `Continuation`.
                    let mut fragment = self.fragment.take().unwrap_or_else(|| {
                        trace!(role = ?self.role, "Continuation without a start frame");
                        Fragment {
                            opcode: OpCode::Continuation,
                            buffer: BytesMut::new(),
                        }
                    });

                    let size = fragment.buffer.len() + frame.payload.len();
                    if size > self.max_message_size {
                        return Err(FrameError::PayloadTooLarge {
                            size: size as u64,
                            max: self.max_message_size,
                        });
                    }
                    fragment.buffer.extend_from_slice(&frame.payload);

                    if frame.fin {
                        return Ok(Message::Data {
                            opcode: fragment.opcode,
                            payload: fragment.buffer.freeze(),
                        });
                    }
                    self.fragment = Some(fragment);
                }

                OpCode::Text | OpCode::Binary => {
                    if frame.fin {
                        return Ok(Message::Data {
                            opcode: frame.opcode,
                            payload: frame.payload,
                        });
                    }

                    if self.fragment.is_some() {
                        return Err(FrameError::FragmentInProgress);
                    }
                    self.fragment = Some(Fragment {
                        opcode: frame.opcode,
                        buffer: BytesMut::from(&frame.payload[..]),
                    });
                }
            }
        }
    }

    /// Shut down the underlying stream. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.fragment = None;
        if let Err(e) = self.stream.get_mut().shutdown().await {
            trace!(error = %e, "Stream shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::frame::encode_frame;
    use tokio::io::duplex;

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    /// A frame as a client would put it on the wire.
    fn client_frame(opcode: OpCode, payload: &[u8], fin: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, Some(MASK));
        buf.to_vec()
    }

    /// A frame as a server would put it on the wire.
    fn server_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, true, None);
        buf.to_vec()
    }

    fn text(payload: &[u8]) -> Message {
        Message::Data {
            opcode: OpCode::Text,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[tokio::test]
    async fn test_client_to_server_message() {
        let (a, b) = duplex(64 * 1024);
        let mut client = ConnectionChannel::new(a, Role::Client);
        let mut server = ConnectionChannel::new(b, Role::Server);

        client.send_text("hello").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), text(b"hello"));

        server.send(b"\x00\x01", OpCode::Binary, None).await.unwrap();
        assert_eq!(
            client.receive().await.unwrap(),
            Message::Data {
                opcode: OpCode::Binary,
                payload: Bytes::from_static(b"\x00\x01"),
            }
        );
    }

    #[tokio::test]
    async fn test_fragment_reassembly_all_chunk_sizes() {
        let payload = b"abcdefghij";

        for chunk in 1..=payload.len() + 1 {
            let (a, b) = duplex(64 * 1024);
            let mut client = ConnectionChannel::new(a, Role::Client);
            let mut server = ConnectionChannel::new(b, Role::Server);

            client
                .send(payload, OpCode::Text, Some(chunk))
                .await
                .unwrap();
            assert_eq!(server.receive().await.unwrap(), text(payload), "chunk {chunk}");
            assert!(server.fragment.is_none());
        }
    }

    #[tokio::test]
    async fn test_large_message() {
        let (a, b) = duplex(256 * 1024);
        let mut client = ConnectionChannel::new(a, Role::Client);
        let mut server = ConnectionChannel::new(b, Role::Server);

        let big = vec![b'a'; 100_000];
        client.send(&big, OpCode::Text, None).await.unwrap();
        assert_eq!(server.receive().await.unwrap(), text(&big));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let stream = tokio_test::io::Builder::new()
            .read(&client_frame(OpCode::Ping, b"are you there", true))
            .write(&server_frame(OpCode::Pong, b"are you there"))
            .read(&client_frame(OpCode::Text, b"metric", true))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert_eq!(server.receive().await.unwrap(), text(b"metric"));
    }

    #[tokio::test]
    async fn test_pong_discarded() {
        let stream = tokio_test::io::Builder::new()
            .read(&client_frame(OpCode::Pong, b"late", true))
            .read(&client_frame(OpCode::Text, b"metric", true))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert_eq!(server.receive().await.unwrap(), text(b"metric"));
    }

    #[tokio::test]
    async fn test_control_frames_between_fragments() {
        let stream = tokio_test::io::Builder::new()
            .read(&client_frame(OpCode::Text, b"ab", false))
            .read(&client_frame(OpCode::Ping, b"", true))
            .write(&server_frame(OpCode::Pong, b""))
            .read(&client_frame(OpCode::Continuation, b"cd", true))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert_eq!(server.receive().await.unwrap(), text(b"abcd"));
    }

    #[tokio::test]
    async fn test_close_echoed_then_closed() {
        let stream = tokio_test::io::Builder::new()
            .read(&client_frame(OpCode::Close, b"", true))
            .write(&server_frame(OpCode::Close, b""))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert_eq!(server.receive().await.unwrap(), Message::Closed);
        assert!(server.is_closed());
        assert_eq!(server.receive().await.unwrap(), Message::Closed);
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_reply_not_echoed_by_initiator() {
        // Any write after the first close frame would fail the mock.
        let stream = tokio_test::io::Builder::new()
            .write(&server_frame(OpCode::Close, b""))
            .read(&client_frame(OpCode::Close, b"", true))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        server.send(b"", OpCode::Close, None).await.unwrap();
        assert_eq!(server.receive().await.unwrap(), Message::Closed);
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_close_handshake_between_channels() {
        let (a, b) = duplex(64 * 1024);
        let mut client = ConnectionChannel::new(a, Role::Client);
        let mut server = ConnectionChannel::new(b, Role::Server);

        client.send(b"", OpCode::Close, None).await.unwrap();
        assert_eq!(server.receive().await.unwrap(), Message::Closed);
        assert_eq!(client.receive().await.unwrap(), Message::Closed);
        assert!(server.send_text("too late").await.is_err());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_closed() {
        let frame = client_frame(OpCode::Text, b"partial", true);
        let stream = tokio_test::io::Builder::new().read(&frame[..4]).build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert_eq!(server.receive().await.unwrap(), Message::Closed);
    }

    #[tokio::test]
    async fn test_connection_reset_is_closed() {
        let stream = tokio_test::io::Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert_eq!(server.receive().await.unwrap(), Message::Closed);
    }

    #[tokio::test]
    async fn test_unknown_opcode_is_error() {
        let stream = tokio_test::io::Builder::new()
            .read(&[0x83, 0x80, 0, 0, 0, 0])
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert!(matches!(
            server.receive().await,
            Err(FrameError::UnknownOpcode(0x3))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_fragment_start_is_error() {
        let stream = tokio_test::io::Builder::new()
            .read(&client_frame(OpCode::Text, b"first", false))
            .read(&client_frame(OpCode::Binary, b"second", false))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert!(matches!(
            server.receive().await,
            Err(FrameError::FragmentInProgress)
        ));
    }

    #[tokio::test]
    async fn test_continuation_without_start_is_delivered() {
        let stream = tokio_test::io::Builder::new()
            .read(&client_frame(OpCode::Continuation, b"orphan", true))
            .read(&client_frame(OpCode::Continuation, b"or", false))
            .read(&client_frame(OpCode::Continuation, b"phans", true))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        let orphan = |payload: &'static [u8]| Message::Data {
            opcode: OpCode::Continuation,
            payload: Bytes::from_static(payload),
        };
        assert_eq!(server.receive().await.unwrap(), orphan(b"orphan"));
        assert!(server.fragment.is_none());
        assert_eq!(server.receive().await.unwrap(), orphan(b"orphans"));
        assert!(server.fragment.is_none());
    }

    #[tokio::test]
    async fn test_final_data_frame_during_fragment_leaves_it_intact() {
        let stream = tokio_test::io::Builder::new()
            .read(&client_frame(OpCode::Text, b"ab", false))
            .read(&client_frame(OpCode::Text, b"whole", true))
            .read(&client_frame(OpCode::Continuation, b"cd", true))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server);

        assert_eq!(server.receive().await.unwrap(), text(b"whole"));
        assert!(server.fragment.is_some());
        assert_eq!(server.receive().await.unwrap(), text(b"abcd"));
        assert!(server.fragment.is_none());
    }

    #[tokio::test]
    async fn test_reassembled_message_respects_limit() {
        let stream = tokio_test::io::Builder::new()
            .read(&client_frame(OpCode::Binary, &[1; 6], false))
            .read(&client_frame(OpCode::Continuation, &[2; 6], true))
            .build();
        let mut server = ConnectionChannel::new(stream, Role::Server).with_max_message_size(10);

        assert!(matches!(
            server.receive().await,
            Err(FrameError::PayloadTooLarge { size: 12, max: 10 })
        ));
    }
}
