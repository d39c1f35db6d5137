//! Background send and receive loops for the two transports.
//!
//! Nothing here touches game state. Decoded messages land on an inbound
//! [`SharedQueue`], failures become strings on an error queue, and outbound
//! messages are handed to a writer task through an unbounded channel so
//! `send` never waits on the socket.

use crate::error::ConnectionError;
use crate::framing::{decode_datagram, FrameReader};
use crate::protocol::{Message, MessageRegistry};
use crate::queue::SharedQueue;
use log::{debug, error, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const STREAM_READ_CHUNK: usize = 4096;
const DATAGRAM_BUFFER: usize = 2048;

/// A decoded message with its arrival time
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message: Message,
    pub received_at: Instant,
}

impl InboundMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            received_at: Instant::now(),
        }
    }
}

/// Reader and writer tasks for one stream socket
#[derive(Debug)]
pub struct StreamChannel {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    receiving: Arc<AtomicBool>,
}

impl StreamChannel {
    /// Splits `stream` and starts its receive loop and writer task
    pub fn start(
        stream: TcpStream,
        registry: Arc<MessageRegistry>,
        inbox: SharedQueue<InboundMessage>,
        errors: SharedQueue<String>,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to disable Nagle on stream: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let receiving = Arc::new(AtomicBool::new(true));

        tokio::spawn(run_stream_writer(write_half, outbound_rx, errors.clone()));
        let reader = tokio::spawn(run_stream_reader(
            read_half,
            registry,
            inbox,
            errors,
            Arc::clone(&receiving),
        ));

        Self {
            outbound,
            reader,
            receiving,
        }
    }

    /// Queues a message for the writer task. Returns false once the writer
    /// has stopped.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Stops receiving. Messages already queued are still written before
    /// the write half shuts down.
    pub fn shutdown(self) {
        self.reader.abort();
        self.receiving.store(false, Ordering::Release);
    }
}

async fn run_stream_writer(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    errors: SharedQueue<String>,
) {
    while let Some(message) = outbound.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                errors.push(format!("failed to encode {}: {}", message.kind().name(), e));
                continue;
            }
        };

        if let Err(e) = writer.write_all(&frame).await {
            errors.push(format!("stream send failed: {}", e));
            return;
        }
    }

    let _ = writer.shutdown().await;
}

async fn run_stream_reader(
    mut reader: OwnedReadHalf,
    registry: Arc<MessageRegistry>,
    inbox: SharedQueue<InboundMessage>,
    errors: SharedQueue<String>,
    receiving: Arc<AtomicBool>,
) {
    let mut frames = FrameReader::new();
    let mut buffer = vec![0u8; STREAM_READ_CHUNK];

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                errors.push("stream closed by peer".to_string());
                break;
            }
            Ok(len) => {
                frames.extend(&buffer[..len]);
                while let Some(event) = frames.next_message(&registry) {
                    match event {
                        Ok(message) => inbox.push(InboundMessage::new(message)),
                        Err(e) => errors.push(format!("stream protocol error: {}", e)),
                    }
                }
            }
            Err(e) => {
                errors.push(format!("stream receive failed: {}", e));
                break;
            }
        }
    }

    receiving.store(false, Ordering::Release);
}

/// A datagram and the endpoint it came from
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    pub from: SocketAddr,
    pub message: InboundMessage,
}

/// Cloneable handle for queueing outbound datagrams
#[derive(Debug, Clone)]
pub struct DatagramSender {
    outbound: mpsc::UnboundedSender<(Message, SocketAddr)>,
}

impl DatagramSender {
    pub fn send_to(&self, message: Message, addr: SocketAddr) {
        if self.outbound.send((message, addr)).is_err() {
            debug!("Datagram socket closed, dropping message to {}", addr);
        }
    }
}

/// One bound datagram socket shared by every connection of the process
pub struct DatagramSocket {
    local_addr: SocketAddr,
    sender: DatagramSender,
    inbox: SharedQueue<ReceivedDatagram>,
    errors: SharedQueue<String>,
    receiver_task: JoinHandle<()>,
    sender_task: JoinHandle<()>,
}

impl DatagramSocket {
    pub async fn bind(
        addr: SocketAddr,
        registry: Arc<MessageRegistry>,
    ) -> Result<Self, ConnectionError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ConnectionError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let inbox = SharedQueue::new();
        let errors = SharedQueue::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let receiver_task = tokio::spawn(run_datagram_receiver(
            Arc::clone(&socket),
            registry,
            inbox.clone(),
            errors.clone(),
        ));
        let sender_task = tokio::spawn(run_datagram_sender(socket, outbound_rx));

        Ok(Self {
            local_addr,
            sender: DatagramSender { outbound },
            inbox,
            errors,
            receiver_task,
            sender_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn sender(&self) -> DatagramSender {
        self.sender.clone()
    }

    /// Datagrams received since the last call, in arrival order
    pub fn drain(&self) -> Vec<ReceivedDatagram> {
        self.inbox.drain()
    }

    /// Malformed-datagram and socket errors since the last call
    pub fn drain_errors(&self) -> Vec<String> {
        self.errors.drain()
    }
}

impl Drop for DatagramSocket {
    fn drop(&mut self) {
        self.receiver_task.abort();
        self.sender_task.abort();
    }
}

async fn run_datagram_receiver(
    socket: Arc<UdpSocket>,
    registry: Arc<MessageRegistry>,
    inbox: SharedQueue<ReceivedDatagram>,
    errors: SharedQueue<String>,
) {
    let mut buffer = [0u8; DATAGRAM_BUFFER];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, from)) => match decode_datagram(&buffer[..len], &registry) {
                Ok(message) => inbox.push(ReceivedDatagram {
                    from,
                    message: InboundMessage::new(message),
                }),
                Err(e) => {
                    warn!("Dropping malformed datagram from {}: {}", from, e);
                    errors.push(format!("malformed datagram from {}: {}", from, e));
                }
            },
            Err(e) => {
                // ICMP unreachable surfaces here on some platforms; the socket
                // itself is still usable
                error!("Error receiving datagram: {}", e);
                errors.push(format!("datagram receive failed: {}", e));
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn run_datagram_sender(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<(Message, SocketAddr)>,
) {
    while let Some((message, addr)) = outbound.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {}: {}", message.kind().name(), e);
                continue;
            }
        };

        if let Err(e) = socket.send_to(&frame, addr).await {
            debug!("Failed to send datagram to {}: {}", addr, e);
        }
    }
}
