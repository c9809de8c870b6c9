//! Frame transport over TCP.
//!
//! A [`FrameTransport`] turns one socket into a stream of decoded
//! [`Message`]s. Each `connect()` spawns a single I/O task that owns the
//! socket, the accumulation buffer and, for encrypted links, the noise
//! session. Callers talk to the task over a command channel and hear back
//! through [`TransportEvent`]s.
//!
//! Every connect attempt ends with exactly one [`TransportEvent::Closed`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use protocol::framing::{NoiseFrameCodec, PlaintextCodec, RawFrame};
use protocol::{EncryptionKey, Message, NoiseSession, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Initial capacity of the read buffer.
const READ_BUFFER_SIZE: usize = 4096;

/// Chosen-protocol byte a device must answer the noise hello with.
const NOISE_PROTOCOL_VERSION: u8 = 0x01;

/// Events reported by the I/O task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The socket is open and, for encrypted links, the handshake is done.
    Connected,
    /// One decoded inbound message.
    Message(Message),
    /// A failure. Fatal failures are followed by `Closed`.
    Error(TransportError),
    /// The connect attempt is over.
    Closed,
}

/// Settings for a transport, resolved from a connection configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    /// Pre-shared key; selects the encrypted variant when present.
    pub encryption_key: Option<EncryptionKey>,
    pub expected_server_name: Option<String>,
    pub connect_timeout: Duration,
}

enum Command {
    Send(RawFrame),
    End,
    Destroy,
}

struct Link {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    ready: bool,
}

#[derive(Default)]
struct LinkSlot {
    generation: u64,
    link: Option<Link>,
}

struct Shared {
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    slot: Mutex<LinkSlot>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, LinkSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver is gone once the owning connection is dropped.
        let _ = self.events.send(event);
    }
}

/// Per-link codec state.
enum Codec {
    Plaintext(PlaintextCodec),
    Noise(Box<NoiseSession>, NoiseFrameCodec),
}

impl Codec {
    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Codec::Plaintext(codec) => codec.encode(frame),
            Codec::Noise(session, codec) => {
                let plaintext = codec.encode_message(frame)?;
                let ciphertext = session.encrypt(&plaintext)?;
                codec.encode_frame(&ciphertext)
            }
        }
    }

    /// Takes one whole frame off the head of `buffer`, if one is there.
    fn next_frame(&mut self, buffer: &mut BytesMut) -> Result<Option<RawFrame>, ProtocolError> {
        match self {
            Codec::Plaintext(codec) => match codec.try_decode(buffer)? {
                Some((frame, used)) => {
                    buffer.advance(used);
                    Ok(Some(frame))
                }
                None => Ok(None),
            },
            Codec::Noise(session, codec) => match codec.try_decode_frame(buffer)? {
                Some((ciphertext, used)) => {
                    buffer.advance(used);
                    let plaintext = session.decrypt(&ciphertext)?;
                    codec.decode_message(&plaintext).map(Some)
                }
                None => Ok(None),
            },
        }
    }
}

/// Framed, optionally encrypted transport to one device.
pub struct FrameTransport {
    shared: Arc<Shared>,
}

impl FrameTransport {
    /// Creates an idle transport and the receiver for its events.
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            events,
            slot: Mutex::new(LinkSlot::default()),
        });
        (Self { shared }, rx)
    }

    /// Whether this transport uses the encrypted variant.
    pub fn is_encrypted(&self) -> bool {
        self.shared.config.encryption_key.is_some()
    }

    /// Starts a connect attempt. Must be called within a tokio runtime.
    pub fn connect(&self) -> Result<(), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut slot = self.shared.slot();
            if slot.link.is_some() {
                return Err(TransportError::AlreadyConnecting);
            }
            slot.generation += 1;
            slot.link = Some(Link {
                generation: slot.generation,
                commands: tx,
                ready: false,
            });
            slot.generation
        };

        tracing::debug!(
            host = %self.shared.config.host,
            port = self.shared.config.port,
            encrypted = self.is_encrypted(),
            "Opening transport"
        );
        tokio::spawn(run_link(Arc::clone(&self.shared), generation, rx));
        Ok(())
    }

    /// Whether a link is established and accepting frames.
    pub fn is_ready(&self) -> bool {
        self.shared.slot().link.as_ref().is_some_and(|link| link.ready)
    }

    /// Queues `message` for writing. Fails without side effects when no link
    /// is ready.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        let slot = self.shared.slot();
        let link = slot
            .link
            .as_ref()
            .filter(|link| link.ready)
            .ok_or(TransportError::NotConnected)?;
        link.commands
            .send(Command::Send(message.to_frame()))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Flushes queued frames, then closes the socket.
    pub fn end(&self) {
        self.command(Command::End);
    }

    /// Closes the socket without flushing anything queued after this call.
    pub fn destroy(&self) {
        self.command(Command::Destroy);
    }

    fn command(&self, command: Command) {
        if let Some(link) = self.shared.slot().link.as_ref() {
            let _ = link.commands.send(command);
        }
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for FrameTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTransport")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("encrypted", &self.is_encrypted())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Resolves once a stop command arrives or every command sender is gone.
async fn wait_for_stop(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, Command::End | Command::Destroy) {
            return;
        }
    }
}

async fn run_link(
    shared: Arc<Shared>,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let established = tokio::select! {
        result = tokio::time::timeout(shared.config.connect_timeout, establish(&shared.config)) => {
            match result {
                Ok(Ok(link)) => Some(link),
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Connect attempt failed");
                    shared.emit(TransportEvent::Error(e));
                    None
                }
                Err(_) => {
                    let e = TransportError::Protocol(ProtocolError::Timeout(
                        "connect and handshake".to_string(),
                    ));
                    shared.emit(TransportEvent::Error(e));
                    None
                }
            }
        }
        _ = wait_for_stop(&mut commands) => None,
    };

    if let Some((stream, codec, buffer)) = established {
        let accepted = {
            let mut slot = shared.slot();
            match slot.link.as_mut() {
                Some(link) if link.generation == generation => {
                    link.ready = true;
                    true
                }
                _ => false,
            }
        };
        if accepted {
            shared.emit(TransportEvent::Connected);
            run_io(&shared, stream, codec, buffer, &mut commands).await;
        }
    }

    finish(&shared, generation);
}

fn finish(shared: &Shared, generation: u64) {
    {
        let mut slot = shared.slot();
        if slot
            .link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
        {
            slot.link = None;
        }
    }
    shared.emit(TransportEvent::Closed);
}

async fn establish(
    config: &TransportConfig,
) -> Result<(TcpStream, Codec, BytesMut), TransportError> {
    let mut stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
    stream.set_nodelay(true)?;
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let codec = match &config.encryption_key {
        None => Codec::Plaintext(PlaintextCodec::new()),
        Some(key) => {
            let session = noise_handshake(
                &mut stream,
                &mut buffer,
                key,
                config.expected_server_name.as_deref(),
            )
            .await?;
            Codec::Noise(Box::new(session), NoiseFrameCodec::new())
        }
    };

    Ok((stream, codec, buffer))
}

async fn noise_handshake(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    key: &EncryptionKey,
    expected_server_name: Option<&str>,
) -> Result<NoiseSession, TransportError> {
    let codec = NoiseFrameCodec::new();
    let mut session = NoiseSession::new_initiator(key)?;

    let message1 = session.write_handshake_message(&[])?;
    let mut handshake = Vec::with_capacity(1 + message1.len());
    handshake.push(0x00);
    handshake.extend_from_slice(&message1);

    let mut out = codec.encode_frame(&[])?;
    out.extend_from_slice(&codec.encode_frame(&handshake)?);
    stream.write_all(&out).await?;
    tracing::debug!("Sent noise hello and handshake");

    let server_hello = read_noise_frame(stream, buffer, &codec).await?;
    let server_name = parse_server_hello(&server_hello)?;
    tracing::debug!(server_name = %server_name, "Received noise server hello");
    if let Some(expected) = expected_server_name {
        if !expected.is_empty() && expected != server_name {
            return Err(ProtocolError::ServerNameMismatch {
                expected: expected.to_string(),
                got: server_name,
            }
            .into());
        }
    }

    let reply = read_noise_frame(stream, buffer, &codec).await?;
    match reply.split_first() {
        Some((0x00, message2)) => {
            session.read_handshake_message(message2)?;
        }
        Some((_, reason)) => {
            let reason = String::from_utf8_lossy(reason).into_owned();
            return Err(if reason.contains("MAC failure") {
                ProtocolError::InvalidEncryptionKey(format!("device rejected key: {}", reason))
            } else {
                ProtocolError::HandshakeFailed(reason)
            }
            .into());
        }
        None => {
            return Err(ProtocolError::HandshakeFailed("empty handshake reply".to_string()).into());
        }
    }

    session.into_transport()?;
    tracing::debug!("Noise handshake complete");
    Ok(session)
}

/// Reads one whole encrypted-transport frame, buffering any excess.
async fn read_noise_frame(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    codec: &NoiseFrameCodec,
) -> Result<Vec<u8>, TransportError> {
    loop {
        if let Some((payload, used)) = codec.try_decode_frame(buffer)? {
            buffer.advance(used);
            return Ok(payload);
        }
        if stream.read_buf(buffer).await? == 0 {
            return Err(
                ProtocolError::ConnectionClosed("device closed during handshake".to_string())
                    .into(),
            );
        }
    }
}

/// Returns the server name from `[protocol][name NUL][mac NUL]`.
fn parse_server_hello(payload: &[u8]) -> Result<String, ProtocolError> {
    let Some((&chosen, rest)) = payload.split_first() else {
        return Err(ProtocolError::HandshakeFailed("empty server hello".to_string()));
    };
    if chosen != NOISE_PROTOCOL_VERSION {
        return Err(ProtocolError::HandshakeFailed(format!(
            "unsupported encryption protocol {}",
            chosen
        )));
    }
    let name = rest.split(|b| *b == 0).next().unwrap_or_default();
    Ok(String::from_utf8_lossy(name).into_owned())
}

async fn run_io(
    shared: &Shared,
    mut stream: TcpStream,
    mut codec: Codec,
    mut buffer: BytesMut,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) {
    // Bytes that arrived with the handshake reply.
    if let Err(e) = drain(shared, &mut codec, &mut buffer) {
        shared.emit(TransportEvent::Error(e));
        return;
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    let result = match codec.encode(&frame) {
                        Ok(bytes) => stream.write_all(&bytes).await.map_err(TransportError::from),
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = result {
                        shared.emit(TransportEvent::Error(e));
                        break;
                    }
                }
                Some(Command::End) => {
                    let _ = stream.shutdown().await;
                    break;
                }
                Some(Command::Destroy) | None => break,
            },
            read = stream.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    tracing::debug!("Device closed the connection");
                    break;
                }
                Ok(_) => {
                    if let Err(e) = drain(shared, &mut codec, &mut buffer) {
                        shared.emit(TransportEvent::Error(e));
                        break;
                    }
                }
                Err(e) => {
                    shared.emit(TransportEvent::Error(e.into()));
                    break;
                }
            },
        }
    }
}

/// Decodes every whole frame in `buffer`; a partial tail stays buffered.
///
/// Unknown message types are reported and skipped. Any other failure is
/// returned and ends the link.
fn drain(shared: &Shared, codec: &mut Codec, buffer: &mut BytesMut) -> Result<(), TransportError> {
    while let Some(frame) = codec.next_frame(buffer)? {
        match Message::from_frame(&frame) {
            Ok(message) => shared.emit(TransportEvent::Message(message)),
            Err(e) if !e.is_fatal_decode() => {
                tracing::warn!(type_id = frame.type_id, "Skipping unknown message type");
                shared.emit(TransportEvent::Error(e.into()));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::messages::{PingRequest, PingResponse};
    use tokio::net::TcpListener;

    fn plaintext_config(port: u16) -> TransportConfig {
        TransportConfig {
            host: "127.0.0.1".to_string(),
            port,
            encryption_key: None,
            expected_server_name: None,
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn encode(message: impl Into<Message>) -> Vec<u8> {
        PlaintextCodec::new()
            .encode(&message.into().to_frame())
            .unwrap()
    }

    #[test]
    fn test_parse_server_hello() {
        assert_eq!(parse_server_hello(b"\x01kitchen\0AA:BB\0").unwrap(), "kitchen");
        assert_eq!(parse_server_hello(b"\x01garage").unwrap(), "garage");
        assert!(parse_server_hello(b"\x02kitchen\0").is_err());
        assert!(parse_server_hello(b"").is_err());
    }

    #[test]
    fn test_drain_keeps_partial_tail() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Shared {
            config: plaintext_config(1),
            events: tx,
            slot: Mutex::new(LinkSlot::default()),
        };
        let mut codec = Codec::Plaintext(PlaintextCodec::new());

        let bytes = [encode(PingRequest {}), encode(PingResponse {})].concat();
        let mut buffer = BytesMut::from(&bytes[..bytes.len() - 1]);

        drain(&shared, &mut codec, &mut buffer).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Message(Message::PingRequest(PingRequest {}))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(buffer.len(), 2);

        buffer.extend_from_slice(&bytes[bytes.len() - 1..]);
        drain(&shared, &mut codec, &mut buffer).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Message(Message::PingResponse(PingResponse {}))
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_skips_unknown_type() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Shared {
            config: plaintext_config(1),
            events: tx,
            slot: Mutex::new(LinkSlot::default()),
        };
        let mut codec = Codec::Plaintext(PlaintextCodec::new());

        let unknown = PlaintextCodec::new()
            .encode(&RawFrame::new(9000, vec![1, 2, 3]))
            .unwrap();
        let bytes = [unknown, encode(PingRequest {})].concat();
        let mut buffer = BytesMut::from(&bytes[..]);

        drain(&shared, &mut codec, &mut buffer).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::Error(TransportError::Protocol(ProtocolError::UnknownMessageType(9000)))
        ));
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Message(_)));
    }

    #[test]
    fn test_drain_fails_on_malformed_known_type() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = Shared {
            config: plaintext_config(1),
            events: tx,
            slot: Mutex::new(LinkSlot::default()),
        };
        let mut codec = Codec::Plaintext(PlaintextCodec::new());

        let bad = PlaintextCodec::new()
            .encode(&RawFrame::new(2, vec![0x0a, 0x05, 0x01]))
            .unwrap();
        let mut buffer = BytesMut::from(&bad[..]);

        let err = drain(&shared, &mut codec, &mut buffer).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (transport, mut rx) = FrameTransport::new(plaintext_config(1));
        let err = transport.send(&Message::from(PingRequest {})).unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_emits_error_then_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (transport, mut rx) = FrameTransport::new(plaintext_config(port));
        transport.connect().unwrap();

        assert!(matches!(rx.recv().await, Some(TransportEvent::Error(_))));
        assert_eq!(rx.recv().await, Some(TransportEvent::Closed));
        assert!(!transport.is_ready());
    }

    #[tokio::test]
    async fn test_plaintext_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            // Reply in two writes to force reassembly.
            let reply = encode(PingResponse {});
            socket.write_all(&reply[..1]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(&reply[1..]).await.unwrap();
            buf.truncate(n);
            buf
        });

        let (transport, mut rx) = FrameTransport::new(plaintext_config(port));
        transport.connect().unwrap();
        assert_eq!(transport.connect(), Err(TransportError::AlreadyConnecting));

        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        transport.send(&Message::from(PingRequest {})).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Message(Message::PingResponse(PingResponse {})))
        );
        assert_eq!(device.await.unwrap(), encode(PingRequest {}));

        transport.destroy();
        assert_eq!(rx.recv().await, Some(TransportEvent::Closed));
        assert!(transport.connect().is_ok());
    }
}
