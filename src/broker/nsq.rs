//! Minimal NSQ TCP client: `PUB` on a shared producer connection and one
//! `SUB` consumer connection per subscription.
//!
//! Wire format (protocol V2): the client opens with the magic `"  V2"`, then
//! sends newline-terminated commands. The server answers with frames
//! `[size: u32 BE][frame type: u32 BE][data]`, where `size` counts the type
//! field plus data. Message frames carry
//! `[timestamp: i64][attempts: u16][id: 16 bytes][body]`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use super::{Broker, BrokerError, Subscription};

pub(crate) const MAGIC_V2: &[u8; 4] = b"  V2";
pub(crate) const FRAME_TYPE_RESPONSE: u32 = 0;
pub(crate) const FRAME_TYPE_ERROR: u32 = 1;
pub(crate) const FRAME_TYPE_MESSAGE: u32 = 2;
pub(crate) const HEARTBEAT: &[u8] = b"_heartbeat_";
pub(crate) const MESSAGE_ID_LEN: usize = 16;
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const MAX_NAME_LEN: usize = 64;

/// Messages nsqd may push before we FIN any of them.
const DEFAULT_MAX_IN_FLIGHT: u32 = 32;
const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(NsqMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NsqMessage {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; MESSAGE_ID_LEN],
    pub body: Bytes,
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, BrokerError> {
    let size = reader.read_u32().await? as usize;
    if !(4..=MAX_FRAME_SIZE).contains(&size) {
        return Err(BrokerError::Protocol(format!("frame size {} out of range", size)));
    }
    let frame_type = reader.read_u32().await?;
    let mut data = vec![0u8; size - 4];
    reader.read_exact(&mut data).await?;
    let data = Bytes::from(data);

    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => decode_message(data).map(Frame::Message),
        other => Err(BrokerError::Protocol(format!("unknown frame type {}", other))),
    }
}

fn decode_message(mut data: Bytes) -> Result<NsqMessage, BrokerError> {
    if data.len() < MESSAGE_HEADER_LEN {
        return Err(BrokerError::Protocol(format!(
            "message frame too short ({} bytes)",
            data.len()
        )));
    }
    let timestamp = data.get_i64();
    let attempts = data.get_u16();
    let mut id = [0u8; MESSAGE_ID_LEN];
    data.copy_to_slice(&mut id);
    Ok(NsqMessage {
        timestamp,
        attempts,
        id,
        body: data,
    })
}

pub(crate) fn encode_pub(topic: &str, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + topic.len() + 1 + 4 + body.len());
    buf.put_slice(b"PUB ");
    buf.put_slice(topic.as_bytes());
    buf.put_u8(b'\n');
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf
}

fn encode_fin(id: &[u8; MESSAGE_ID_LEN]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + MESSAGE_ID_LEN + 1);
    buf.put_slice(b"FIN ");
    buf.put_slice(id);
    buf.put_u8(b'\n');
    buf
}

/// Topic and channel names: 1–64 chars of `[.a-zA-Z0-9_-]`, optionally
/// ending in `#ephemeral`.
fn validate_name(name: &str) -> Result<(), BrokerError> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BrokerError::Protocol(format!("invalid topic/channel name {:?}", name)))
    }
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

async fn open(addr: &str) -> Result<TcpStream, BrokerError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    stream.write_all(MAGIC_V2).await?;
    Ok(stream)
}

/// Wait for `OK`, answering heartbeats meanwhile.
async fn expect_ok<S>(stream: &mut S) -> Result<(), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read_frame(stream).await? {
            Frame::Response(data) if data.as_ref() == HEARTBEAT => {
                stream.write_all(b"NOP\n").await?;
            }
            Frame::Response(data) if data.as_ref() == b"OK" => return Ok(()),
            Frame::Response(data) => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected response {:?}",
                    lossy(&data)
                )))
            }
            Frame::Error(data) => return Err(BrokerError::Remote(lossy(&data))),
            Frame::Message(_) => {
                return Err(BrokerError::Protocol(
                    "message frame on a connection without a subscription".to_string(),
                ))
            }
        }
    }
}

/// Send one `PUB` and wait for its acknowledgement.
async fn exchange(stream: &mut TcpStream, frame: &[u8]) -> Result<(), BrokerError> {
    stream.write_all(frame).await?;
    expect_ok(stream).await
}

async fn open_consumer(
    addr: &str,
    topic: &str,
    channel: &str,
    max_in_flight: u32,
) -> Result<TcpStream, BrokerError> {
    let mut stream = open(addr).await?;
    stream
        .write_all(format!("SUB {} {}\n", topic, channel).as_bytes())
        .await?;
    expect_ok(&mut stream).await?;
    stream
        .write_all(format!("RDY {}\n", max_in_flight).as_bytes())
        .await?;
    Ok(stream)
}

/// Pump one consumer connection until it fails (`Err`) or the subscription
/// is dropped (`Ok`). A message is FINed only after it was handed over.
async fn consume(stream: TcpStream, tx: &mpsc::Sender<Bytes>) -> Result<(), BrokerError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        match read_frame(&mut reader).await? {
            Frame::Response(data) if data.as_ref() == HEARTBEAT => {
                write_half.write_all(b"NOP\n").await?;
            }
            Frame::Response(_) => {}
            Frame::Error(data) => {
                tracing::warn!(error = %lossy(&data), "nsqd reported an error on consumer connection");
            }
            Frame::Message(msg) => {
                if msg.attempts > 1 {
                    tracing::debug!(attempts = msg.attempts, "Redelivered broker message");
                }
                if tx.send(msg.body).await.is_err() {
                    return Ok(());
                }
                write_half.write_all(&encode_fin(&msg.id)).await?;
            }
        }
    }
}

async fn consume_loop(
    addr: String,
    topic: String,
    channel: String,
    max_in_flight: u32,
    first: TcpStream,
    tx: mpsc::Sender<Bytes>,
) {
    let mut backoff = RECONNECT_MIN;
    let mut next = Some(first);

    loop {
        let stream = match next.take() {
            Some(stream) => stream,
            None => match open_consumer(&addr, &topic, &channel, max_in_flight).await {
                Ok(stream) => {
                    tracing::info!(topic = %topic, "Reconnected to nsqd");
                    backoff = RECONNECT_MIN;
                    stream
                }
                Err(e) => {
                    tracing::warn!(error = %e, retry_in = ?backoff, "nsqd reconnect failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    continue;
                }
            },
        };

        match consume(stream, &tx).await {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "nsqd consumer connection lost");
            }
        }
        if tx.is_closed() {
            break;
        }
    }

    tracing::debug!(topic = %topic, "nsq consumer stopped");
}

/// [`Broker`] backed by a single nsqd.
pub struct NsqBroker {
    addr: String,
    channel: String,
    max_in_flight: u32,
    producer: Mutex<Option<TcpStream>>,
}

impl NsqBroker {
    /// Connect the producer eagerly so an unreachable nsqd fails startup.
    pub async fn connect(addr: &str, channel: &str) -> Result<Self, BrokerError> {
        validate_name(channel)?;
        let producer = open(addr).await?;
        tracing::info!("Connected to nsqd at {}", addr);
        Ok(Self {
            addr: addr.to_string(),
            channel: channel.to_string(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            producer: Mutex::new(Some(producer)),
        })
    }
}

#[async_trait]
impl Broker for NsqBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        validate_name(topic)?;

        let frame = encode_pub(topic, &payload);
        let mut producer = self.producer.lock().await;

        // An idle producer connection is closed by nsqd once its heartbeats
        // go unanswered, which only shows up on the next exchange. A reused
        // connection that fails with an I/O error gets one retry on a fresh one.
        if let Some(mut stream) = producer.take() {
            match exchange(&mut stream, &frame).await {
                Ok(()) => {
                    *producer = Some(stream);
                    return Ok(());
                }
                Err(BrokerError::Io(e)) => {
                    tracing::debug!(error = %e, "Stale nsqd producer connection, reconnecting");
                }
                Err(e) => return Err(e),
            }
        }

        let mut stream = open(&self.addr).await?;
        exchange(&mut stream, &frame).await?;

        // Only a connection that completed the exchange is reused.
        *producer = Some(stream);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        validate_name(topic)?;
        let first = open_consumer(&self.addr, topic, &self.channel, self.max_in_flight).await?;
        let (tx, rx) = mpsc::channel(self.max_in_flight as usize);

        tokio::spawn(consume_loop(
            self.addr.clone(),
            topic.to_string(),
            self.channel.clone(),
            self.max_in_flight,
            first,
            tx,
        ));

        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    fn frame(frame_type: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(data.len() as u32 + 4);
        buf.put_u32(frame_type);
        buf.put_slice(data);
        buf.to_vec()
    }

    fn message_frame(id: &[u8; MESSAGE_ID_LEN], body: &[u8]) -> Vec<u8> {
        let mut data = BytesMut::new();
        data.put_i64(1_700_000_000_000_000_000);
        data.put_u16(1);
        data.put_slice(id);
        data.put_slice(body);
        frame(FRAME_TYPE_MESSAGE, &data)
    }

    async fn read_magic(reader: &mut BufReader<TcpStream>) {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, MAGIC_V2);
    }

    async fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_read_frame_variants() {
        let mut bytes = frame(FRAME_TYPE_RESPONSE, b"OK");
        bytes.extend(frame(FRAME_TYPE_ERROR, b"E_BAD_TOPIC"));
        bytes.extend(message_frame(b"0123456789abcdef", b"{\"a\":1}"));
        let mut reader = &bytes[..];

        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Response(Bytes::from_static(b"OK"))
        );
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Error(Bytes::from_static(b"E_BAD_TOPIC"))
        );
        match read_frame(&mut reader).await.unwrap() {
            Frame::Message(msg) => {
                assert_eq!(&msg.id, b"0123456789abcdef");
                assert_eq!(msg.attempts, 1);
                assert_eq!(msg.body, Bytes::from_static(b"{\"a\":1}"));
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_frame_rejects_bad_sizes_and_types() {
        let mut too_big = BytesMut::new();
        too_big.put_u32(u32::MAX);
        assert!(matches!(
            read_frame(&mut &too_big[..]).await,
            Err(BrokerError::Protocol(_))
        ));

        let unknown = frame(9, b"");
        assert!(matches!(
            read_frame(&mut &unknown[..]).await,
            Err(BrokerError::Protocol(_))
        ));

        let short = frame(FRAME_TYPE_MESSAGE, b"tiny");
        assert!(matches!(
            read_frame(&mut &short[..]).await,
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_pub_layout() {
        let buf = encode_pub("chat", b"hello");
        assert_eq!(&buf[..9], b"PUB chat\n");
        assert_eq!(&buf[9..13], &5u32.to_be_bytes());
        assert_eq!(&buf[13..], b"hello");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("chat").is_ok());
        assert!(validate_name("channel_turbo").is_ok());
        assert!(validate_name("tmp#ephemeral").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn test_publish_answers_heartbeat_then_reads_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            read_magic(&mut reader).await;

            assert_eq!(read_line(&mut reader).await, "PUB chat\n");
            let size = reader.read_u32().await.unwrap();
            let mut body = vec![0u8; size as usize];
            reader.read_exact(&mut body).await.unwrap();

            reader
                .get_mut()
                .write_all(&frame(FRAME_TYPE_RESPONSE, HEARTBEAT))
                .await
                .unwrap();
            assert_eq!(read_line(&mut reader).await, "NOP\n");
            reader
                .get_mut()
                .write_all(&frame(FRAME_TYPE_RESPONSE, b"OK"))
                .await
                .unwrap();
            body
        });

        let broker = NsqBroker::connect(&addr, "channel_turbo").await.unwrap();
        broker
            .publish("chat", Bytes::from_static(b"{\"type\":\"message\"}"))
            .await
            .unwrap();

        assert_eq!(server.await.unwrap(), b"{\"type\":\"message\"}".to_vec());
    }

    #[tokio::test]
    async fn test_publish_surfaces_error_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            read_magic(&mut reader).await;
            read_line(&mut reader).await;
            let size = reader.read_u32().await.unwrap();
            let mut body = vec![0u8; size as usize];
            reader.read_exact(&mut body).await.unwrap();
            reader
                .get_mut()
                .write_all(&frame(FRAME_TYPE_ERROR, b"E_PUB_FAILED"))
                .await
                .unwrap();
        });

        let broker = NsqBroker::connect(&addr, "channel_turbo").await.unwrap();
        match broker.publish("chat", Bytes::from_static(b"x")).await {
            Err(BrokerError::Remote(msg)) => assert_eq!(msg, "E_PUB_FAILED"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_reconnects_after_idle_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel();

        let server = tokio::spawn(async move {
            // First producer connection: heartbeat goes unanswered, nsqd hangs up.
            let (first, _) = listener.accept().await.unwrap();
            let mut first = BufReader::new(first);
            read_magic(&mut first).await;
            first
                .get_mut()
                .write_all(&frame(FRAME_TYPE_RESPONSE, HEARTBEAT))
                .await
                .unwrap();
            drop(first);
            dropped_tx.send(()).unwrap();

            let (second, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(second);
            read_magic(&mut reader).await;
            assert_eq!(read_line(&mut reader).await, "PUB chat\n");
            let size = reader.read_u32().await.unwrap();
            let mut body = vec![0u8; size as usize];
            reader.read_exact(&mut body).await.unwrap();
            reader
                .get_mut()
                .write_all(&frame(FRAME_TYPE_RESPONSE, b"OK"))
                .await
                .unwrap();
            body
        });

        let broker = NsqBroker::connect(&addr, "channel_turbo").await.unwrap();
        dropped_rx.await.unwrap();

        broker
            .publish("chat", Bytes::from_static(b"{\"text\":\"first\"}"))
            .await
            .unwrap();

        let body = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"{\"text\":\"first\"}".to_vec());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_and_fins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            // Producer connection opened by connect(); only the magic arrives.
            let (producer, _) = listener.accept().await.unwrap();
            let mut producer = BufReader::new(producer);
            read_magic(&mut producer).await;

            let (consumer, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(consumer);
            read_magic(&mut reader).await;
            assert_eq!(read_line(&mut reader).await, "SUB chat channel_turbo\n");
            reader
                .get_mut()
                .write_all(&frame(FRAME_TYPE_RESPONSE, b"OK"))
                .await
                .unwrap();
            assert_eq!(read_line(&mut reader).await, "RDY 32\n");

            reader
                .get_mut()
                .write_all(&frame(FRAME_TYPE_RESPONSE, HEARTBEAT))
                .await
                .unwrap();
            assert_eq!(read_line(&mut reader).await, "NOP\n");

            reader
                .get_mut()
                .write_all(&message_frame(b"fedcba9876543210", b"payload"))
                .await
                .unwrap();
            read_line(&mut reader).await
        });

        let broker = NsqBroker::connect(&addr, "channel_turbo").await.unwrap();
        let mut subscription = broker.subscribe("chat").await.unwrap();

        let body = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"payload"));
        assert_eq!(server.await.unwrap(), "FIN fedcba9876543210\n");
    }

    #[tokio::test]
    async fn test_connect_fails_when_nsqd_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            NsqBroker::connect(&addr, "channel_turbo").await,
            Err(BrokerError::Io(_))
        ));
    }
}
