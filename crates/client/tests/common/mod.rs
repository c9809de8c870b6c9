//! A scripted device for driving the client over a loopback socket.

#![allow(dead_code)]

use std::time::Duration;

use bytes::{Buf, BytesMut};
use protocol::messages::{ConnectResponse, HelloResponse};
use protocol::{
    EncryptionKey, Message, NoiseFrameCodec, NoiseSession, PlaintextCodec, RawFrame,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// How long the device waits for client traffic before failing the test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// Listening side of the mock device.
pub struct MockDevice {
    listener: TcpListener,
    pub port: u16,
}

impl MockDevice {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// Accepts one plaintext connection.
    pub async fn accept(&self) -> DeviceLink {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        DeviceLink {
            stream,
            buffer: BytesMut::new(),
            noise: None,
        }
    }

    /// Asserts that no client connects within `window`.
    pub async fn assert_no_connection(&self, window: Duration) {
        let accepted = tokio::time::timeout(window, self.listener.accept()).await;
        assert!(accepted.is_err(), "unexpected connection attempt");
    }

    /// Accepts one encrypted connection and answers its handshake.
    pub async fn accept_noise(&self, key: &EncryptionKey, server_name: &str) -> DeviceLink {
        let mut link = self.accept().await;
        let codec = NoiseFrameCodec::new();

        let hello = link.read_noise_frame().await;
        assert!(hello.is_empty(), "client hello must be empty");

        let handshake = link.read_noise_frame().await;
        assert_eq!(handshake.first(), Some(&0x00));
        let mut session = NoiseSession::new_responder(key).unwrap();
        session.read_handshake_message(&handshake[1..]).unwrap();
        let message2 = session.write_handshake_message(&[]).unwrap();

        let mut server_hello = vec![0x01];
        server_hello.extend_from_slice(server_name.as_bytes());
        server_hello.push(0);
        server_hello.extend_from_slice(b"AA:BB:CC:DD:EE:FF");
        server_hello.push(0);

        let mut reply = vec![0x00];
        reply.extend_from_slice(&message2);

        let mut out = codec.encode_frame(&server_hello).unwrap();
        out.extend_from_slice(&codec.encode_frame(&reply).unwrap());
        link.stream.write_all(&out).await.unwrap();

        session.into_transport().unwrap();
        link.noise = Some(session);
        link
    }

    /// Accepts one encrypted connection and rejects its handshake.
    pub async fn reject_noise(&self, server_name: &str, reason: &str) -> DeviceLink {
        let mut link = self.accept().await;
        let codec = NoiseFrameCodec::new();
        link.read_noise_frame().await;
        link.read_noise_frame().await;

        let mut server_hello = vec![0x01];
        server_hello.extend_from_slice(server_name.as_bytes());
        server_hello.push(0);

        let mut reply = vec![0x01];
        reply.extend_from_slice(reason.as_bytes());

        let mut out = codec.encode_frame(&server_hello).unwrap();
        out.extend_from_slice(&codec.encode_frame(&reply).unwrap());
        link.stream.write_all(&out).await.unwrap();
        link
    }
}

/// One accepted connection, seen from the device.
pub struct DeviceLink {
    stream: TcpStream,
    buffer: BytesMut,
    noise: Option<NoiseSession>,
}

impl DeviceLink {
    /// Receives the next message from the client.
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(STEP_TIMEOUT, self.recv_inner())
            .await
            .expect("client sent nothing")
    }

    async fn recv_inner(&mut self) -> Message {
        let frame = if self.noise.is_some() {
            let ciphertext = self.read_noise_frame().await;
            let session = self.noise.as_mut().unwrap();
            let plaintext = session.decrypt(&ciphertext).unwrap();
            NoiseFrameCodec::new().decode_message(&plaintext).unwrap()
        } else {
            loop {
                if let Some((frame, used)) = PlaintextCodec::new().try_decode(&self.buffer).unwrap() {
                    self.buffer.advance(used);
                    break frame;
                }
                self.fill().await;
            }
        };
        Message::from_frame(&frame).unwrap()
    }

    /// Sends a message to the client.
    pub async fn send(&mut self, message: impl Into<Message>) {
        let frame = message.into().to_frame();
        let bytes = self.encode(&frame);
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Encodes a frame the way this link writes it.
    pub fn encode(&mut self, frame: &RawFrame) -> Vec<u8> {
        match self.noise.as_mut() {
            Some(session) => {
                let codec = NoiseFrameCodec::new();
                let plaintext = codec.encode_message(frame).unwrap();
                let ciphertext = session.encrypt(&plaintext).unwrap();
                codec.encode_frame(&ciphertext).unwrap()
            }
            None => PlaintextCodec::new().encode(frame).unwrap(),
        }
    }

    /// Writes raw bytes to the client.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Answers hello and connect with success.
    pub async fn authorize(&mut self) {
        self.authorize_with(false).await;
    }

    pub async fn authorize_with(&mut self, invalid_password: bool) {
        match self.recv().await {
            Message::HelloRequest(hello) => {
                assert_eq!(hello.api_version_major, 1);
                assert_eq!(hello.api_version_minor, 10);
            }
            other => panic!("expected HelloRequest, got {other:?}"),
        }
        self.send(HelloResponse {
            api_version_major: 1,
            api_version_minor: 10,
            server_info: "mock-device 2024.6.0".to_string(),
            name: "mock".to_string(),
        })
        .await;

        match self.recv().await {
            Message::ConnectRequest(_) => {}
            other => panic!("expected ConnectRequest, got {other:?}"),
        }
        self.send(ConnectResponse { invalid_password }).await;
    }

    /// Waits until the client closes the socket.
    pub async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(STEP_TIMEOUT, async {
            let mut scratch = [0u8; 1024];
            loop {
                match self.stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "client did not close the socket");
    }

    async fn read_noise_frame(&mut self) -> Vec<u8> {
        let codec = NoiseFrameCodec::new();
        loop {
            if let Some((payload, used)) = codec.try_decode_frame(&self.buffer).unwrap() {
                self.buffer.advance(used);
                return payload;
            }
            self.fill().await;
        }
    }

    async fn fill(&mut self) {
        let read = self.stream.read_buf(&mut self.buffer).await.unwrap();
        assert!(read > 0, "client closed the socket");
    }
}

/// Waits for the first event matching `predicate`, skipping others.
pub async fn wait_for<E, F>(events: &mut broadcast::Receiver<E>, mut predicate: F) -> E
where
    E: Clone + std::fmt::Debug,
    F: FnMut(&E) -> bool,
{
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Collects every event published within `window`.
pub async fn collect_for<E: Clone>(events: &mut broadcast::Receiver<E>, window: Duration) -> Vec<E> {
    let deadline = tokio::time::Instant::now() + window;
    let mut collected = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => collected.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
    collected
}
