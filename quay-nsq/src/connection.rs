//! Broker connection.
//!
//! A connection runs the handshake inline, then hands the split transport
//! to two tasks:
//!
//! ```text
//! ┌──────────────┐  commands   ┌──────────────┐
//! │  Connection  │ ──────────→ │ writer task  │ ──→ socket
//! │   (handle)   │             └──────────────┘
//! └──────────────┘                    │ write error
//!        ▲ counters                   ▼
//!        │                     ┌──────────────┐
//!        └──────────────────── │ reader task  │ ←── socket
//!                              └──────────────┘
//!                                     │ (ConnectionId, ConnectionEvent)
//!                                     ▼
//!                                  events
//! ```
//!
//! The reader task owns the end of the connection: it is the only place
//! that emits `Closed`, and it does so exactly once.

use bytes::{Bytes, BytesMut};
use compio::time::{sleep, timeout};
use futures::{select_biased, FutureExt};
use hashbrown::HashSet;
use quay_core::endpoint::Address;
use quay_core::error::{QuayError, Result};
use quay_core::transport::compress::Compression;
use quay_core::transport::{Transport, TransportReader, TransportWriter};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::codec::{Frame, FrameDecoder, FrameType, CLOSE_WAIT, MAGIC_V2, OK};
use crate::command::{validate_channel, validate_topic, Command};
use crate::config::ConnectionConfig;
use crate::events::{BrokerError, ConnectionEvent, ConnectionId, EventSender};
use crate::identify::{AuthResponse, IdentifyResponse};
use crate::message::{Message, MessageId};

/// Fraction of the last RDY at which a connection counts as starved.
const STARVED_RATIO: f64 = 0.85;

/// Connection lifecycle.
///
/// ```text
/// Init → Connecting → AwaitHandshakeAck → Identifying → (Upgrading) → Ready → Closing → Closed
/// ```
///
/// `Errored` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    AwaitHandshakeAck,
    Identifying,
    Upgrading,
    Ready,
    Closing,
    Closed,
    Errored,
}

impl ConnectionState {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Connecting => "connecting",
            Self::AwaitHandshakeAck => "await_handshake_ack",
            Self::Identifying => "identifying",
            Self::Upgrading => "upgrading",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

enum Outgoing {
    Command(Command),
    Shutdown,
}

/// State shared by the handle, the connection tasks and delivered messages.
pub(crate) struct ConnectionShared {
    id: ConnectionId,
    address: Address,
    state: Cell<ConnectionState>,
    rdy: Cell<u64>,
    last_rdy: Cell<u64>,
    /// Delivered messages not yet answered with FIN or REQ.
    in_flight: RefCell<HashSet<MessageId>>,
    max_rdy: Cell<u64>,
    features: RefCell<IdentifyResponse>,
    last_message_at: Cell<Option<Instant>>,
    subscribed: Cell<bool>,
    close_timeout: Duration,
    commands: flume::Sender<Outgoing>,
    stop: flume::Sender<Option<QuayError>>,
    events: EventSender,
}

impl ConnectionShared {
    #[inline]
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    fn set_state(&self, state: ConnectionState) {
        let old = self.state.replace(state);
        if old != state {
            trace!("[CONN] {} {} → {}", self.id, old, state);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send((self.id, event)).is_err() {
            trace!("[CONN] {} event receiver gone", self.id);
        }
    }

    fn enqueue(&self, cmd: Command) -> Result<()> {
        if self.state.get().is_terminal() {
            return Err(QuayError::ConnectionClosed);
        }
        self.commands
            .send(Outgoing::Command(cmd))
            .map_err(|_| QuayError::ChannelClosed)
    }

    fn complete(&self, id: &MessageId) -> Result<()> {
        if self.in_flight.borrow_mut().remove(id) {
            Ok(())
        } else {
            Err(QuayError::AlreadyResponded(id.to_string()))
        }
    }

    /// Send a message response. `completes` is set for FIN and REQ, which
    /// take the message out of flight.
    pub(crate) fn respond(&self, cmd: Command, completes: bool) {
        if completes {
            if let Command::Fin(id) | Command::Req { id, .. } = &cmd {
                let _ = self.complete(id);
            }
        }
        let verb = cmd.verb();
        if let Err(err) = self.enqueue(cmd) {
            debug!("[CONN] {} dropped {}: {}", self.id, verb, err);
        }
    }

    fn finish(&self, error: Option<QuayError>) {
        match &error {
            None => {
                self.set_state(ConnectionState::Closed);
                info!("[CONN] {} closed ({})", self.id, self.address);
            }
            Some(err) => {
                self.set_state(ConnectionState::Errored);
                warn!("[CONN] {} to {} failed: {}", self.id, self.address, err);
            }
        }
        self.rdy.set(0);
        self.emit(ConnectionEvent::Closed(error));
        let _ = self.commands.send(Outgoing::Shutdown);
    }
}

/// Handle to one broker connection.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Rc<ConnectionShared>,
}

impl Connection {
    /// Connect and run the handshake.
    ///
    /// Options are validated before the socket is opened. On success the
    /// connection is `Ready` and a `Ready` event was emitted; a failed
    /// handshake emits no `Closed`.
    pub async fn connect(
        address: &Address,
        config: &ConnectionConfig,
        events: EventSender,
    ) -> Result<Self> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();
        let shared = Rc::new(ConnectionShared {
            id: ConnectionId::next(),
            address: address.clone(),
            state: Cell::new(ConnectionState::Init),
            rdy: Cell::new(0),
            last_rdy: Cell::new(0),
            in_flight: RefCell::new(HashSet::new()),
            max_rdy: Cell::new(crate::identify::DEFAULT_MAX_RDY_COUNT),
            features: RefCell::new(IdentifyResponse::default()),
            last_message_at: Cell::new(None),
            subscribed: Cell::new(false),
            close_timeout: config.close_timeout,
            commands: cmd_tx,
            stop: stop_tx.clone(),
            events,
        });

        debug!("[CONN] {} connecting to {}", shared.id, address);
        shared.set_state(ConnectionState::Connecting);
        let mut transport = match Transport::connect(address, &config.transport).await {
            Ok(t) => t,
            Err(err) => {
                shared.set_state(ConnectionState::Errored);
                return Err(err);
            }
        };

        let mut decoder = FrameDecoder::new(config.max_frame_size);
        let handshake = timeout(
            config.handshake_timeout,
            handshake(&shared, &mut transport, &mut decoder, config),
        )
        .await
        .unwrap_or_else(|_| {
            Err(QuayError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake timed out",
            )))
        });
        if let Err(err) = handshake {
            debug!("[CONN] {} handshake with {} failed: {}", shared.id, address, err);
            shared.set_state(ConnectionState::Errored);
            return Err(err);
        }

        let watchdog = config.identify.heartbeat().map(|hb| hb * 2);
        let (reader, writer) = transport.split();
        compio::runtime::spawn(read_loop(shared.clone(), reader, decoder, stop_rx, watchdog))
            .detach();
        compio::runtime::spawn(write_loop(shared.id, writer, cmd_rx, stop_tx)).detach();

        shared.set_state(ConnectionState::Ready);
        info!("[CONN] {} ready on {}", shared.id, address);
        shared.emit(ConnectionEvent::Ready);
        Ok(Self { shared })
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Credit the broker still holds for this connection.
    #[inline]
    pub fn rdy(&self) -> u64 {
        self.shared.rdy.get()
    }

    /// Count sent with the last RDY.
    #[inline]
    pub fn last_rdy(&self) -> u64 {
        self.shared.last_rdy.get()
    }

    #[inline]
    pub fn in_flight(&self) -> u64 {
        self.shared.in_flight.borrow().len() as u64
    }

    #[inline]
    pub fn max_rdy_count(&self) -> u64 {
        self.shared.max_rdy.get()
    }

    /// Features negotiated during IDENTIFY.
    pub fn features(&self) -> IdentifyResponse {
        self.shared.features.borrow().clone()
    }

    #[inline]
    pub fn last_message_at(&self) -> Option<Instant> {
        self.shared.last_message_at.get()
    }

    /// In-flight messages are close to exhausting the last RDY.
    pub fn is_starved(&self) -> bool {
        let in_flight = self.in_flight();
        in_flight > 0 && in_flight as f64 >= self.last_rdy() as f64 * STARVED_RATIO
    }

    /// Queue a raw command.
    pub fn send(&self, cmd: Command) -> Result<()> {
        self.shared.enqueue(cmd)
    }

    /// Subscribe to `topic`/`channel`. A connection subscribes at most once.
    pub fn subscribe(&self, topic: &str, channel: &str) -> Result<()> {
        validate_topic(topic)?;
        validate_channel(channel)?;
        if self.shared.subscribed.replace(true) {
            return Err(QuayError::protocol("connection is already subscribed"));
        }
        debug!("[CONN] {} SUB {} {}", self.id(), topic, channel);
        self.send(Command::Sub {
            topic: topic.to_string(),
            channel: channel.to_string(),
        })
    }

    /// Grant the broker `count` messages of credit, clamped to the broker's
    /// max RDY. Returns the count actually sent.
    pub fn send_rdy(&self, count: u64) -> Result<u64> {
        let count = count.min(self.max_rdy_count());
        self.send(Command::Rdy(count))?;
        self.shared.rdy.set(count);
        self.shared.last_rdy.set(count);
        trace!("[CONN] {} RDY {}", self.id(), count);
        Ok(count)
    }

    /// FIN a message delivered here. Each delivery is answered once; a
    /// repeat returns `AlreadyResponded` and sends nothing.
    pub fn finish(&self, id: MessageId) -> Result<()> {
        self.shared.complete(&id)?;
        self.send(Command::Fin(id))
    }

    /// REQ a message delivered here, answered once like [`finish`](Self::finish).
    pub fn requeue(&self, id: MessageId, delay: Duration) -> Result<()> {
        self.shared.complete(&id)?;
        self.send(Command::Req { id, delay })
    }

    pub fn touch(&self, id: MessageId) -> Result<()> {
        self.send(Command::Touch(id))
    }

    pub fn publish(&self, topic: &str, body: impl Into<Bytes>) -> Result<()> {
        validate_topic(topic)?;
        self.send(Command::Pub {
            topic: topic.to_string(),
            body: body.into(),
        })
    }

    pub fn multi_publish(&self, topic: &str, bodies: Vec<Bytes>) -> Result<()> {
        validate_topic(topic)?;
        if bodies.is_empty() {
            return Err(QuayError::config("MPUB needs at least one body"));
        }
        self.send(Command::Mpub {
            topic: topic.to_string(),
            bodies,
        })
    }

    pub fn deferred_publish(&self, topic: &str, delay: Duration, body: impl Into<Bytes>) -> Result<()> {
        validate_topic(topic)?;
        self.send(Command::Dpub {
            topic: topic.to_string(),
            delay,
            body: body.into(),
        })
    }

    /// Start a graceful close.
    ///
    /// Sends `CLS`; the broker answers `CLOSE_WAIT` and closes its side once
    /// nothing is in flight. After the configured close timeout the
    /// connection is torn down regardless.
    pub fn close(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Errored => {
                return Ok(())
            }
            _ => {}
        }
        debug!("[CONN] {} closing", self.id());
        self.shared.set_state(ConnectionState::Closing);
        self.send(Command::Cls)?;

        let stop = self.shared.stop.clone();
        let grace = self.shared.close_timeout;
        compio::runtime::spawn(async move {
            sleep(grace).await;
            let _ = stop.send(None);
        })
        .detach();
        Ok(())
    }

    /// Tear the connection down now, without waiting for the broker.
    pub fn abort(&self) {
        if !self.state().is_terminal() {
            let _ = self.shared.stop.send(None);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("address", self.address())
            .field("state", &self.state())
            .field("rdy", &self.rdy())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// ===== Handshake =====

async fn handshake(
    shared: &ConnectionShared,
    transport: &mut Transport,
    decoder: &mut FrameDecoder,
    config: &ConnectionConfig,
) -> Result<()> {
    shared.set_state(ConnectionState::AwaitHandshakeAck);
    transport.write(MAGIC_V2.to_vec()).await?;

    shared.set_state(ConnectionState::Identifying);
    let identify = Command::Identify(Bytes::from(config.identify.to_json()?));
    transport.write(identify.to_bytes().to_vec()).await?;
    let payload = expect_response(transport, decoder).await?;
    let features = IdentifyResponse::parse(&payload)?;
    debug!(
        "[CONN] {} IDENTIFY: max_rdy={} tls={} snappy={} deflate={} auth={}",
        shared.id,
        features.max_rdy_count,
        features.tls_v1,
        features.snappy,
        features.deflate,
        features.auth_required
    );
    shared.max_rdy.set(features.max_rdy_count);
    *shared.features.borrow_mut() = features.clone();
    shared.emit(ConnectionEvent::IdentifyResponse(features.clone()));

    if features.tls_v1 {
        shared.set_state(ConnectionState::Upgrading);
        let tls = config
            .tls
            .as_ref()
            .ok_or_else(|| QuayError::config("broker enabled TLS without TLS options"))?;
        transport.upgrade_tls(tls, decoder.take_buffered()).await?;
        expect_ok(transport, decoder).await?;
    }

    let compression = if features.snappy {
        Some(Compression::Snappy)
    } else if features.deflate {
        Some(Compression::Deflate {
            level: features.deflate_level,
        })
    } else {
        None
    };
    if let Some(compression) = compression {
        shared.set_state(ConnectionState::Upgrading);
        transport.upgrade_compression(compression, decoder.take_buffered())?;
        expect_ok(transport, decoder).await?;
    }

    if features.auth_required {
        let secret = config
            .auth_secret
            .as_ref()
            .ok_or_else(|| QuayError::auth("broker requires AUTH but no secret is configured"))?;
        let auth = Command::Auth(Bytes::copy_from_slice(secret.as_bytes()));
        transport.write(auth.to_bytes().to_vec()).await?;
        let payload = expect_response(transport, decoder).await?;
        let auth = AuthResponse::parse(&payload)?;
        info!(
            "[CONN] {} authorized as {:?} ({} permissions)",
            shared.id, auth.identity, auth.permission_count
        );
    }
    Ok(())
}

async fn read_frame(transport: &mut Transport, decoder: &mut FrameDecoder) -> Result<Frame> {
    loop {
        if let Some(frame) = decoder.decode()? {
            return Ok(frame);
        }
        match transport.read().await? {
            Some(data) => decoder.extend(&data),
            None => return Err(QuayError::ConnectionClosed),
        }
    }
}

/// Next non-heartbeat response. Heartbeats are answered in place.
async fn expect_response(transport: &mut Transport, decoder: &mut FrameDecoder) -> Result<Bytes> {
    loop {
        let frame = read_frame(transport, decoder).await?;
        if frame.is_heartbeat() {
            transport.write(Command::Nop.to_bytes().to_vec()).await?;
            continue;
        }
        return match frame.frame_type {
            FrameType::Response => Ok(frame.payload),
            FrameType::Error => Err(BrokerError::parse(&frame.payload).into_error()),
            FrameType::Message => Err(QuayError::protocol("message frame during handshake")),
        };
    }
}

async fn expect_ok(transport: &mut Transport, decoder: &mut FrameDecoder) -> Result<()> {
    let payload = expect_response(transport, decoder).await?;
    if payload != OK {
        return Err(QuayError::protocol(format!(
            "expected OK after upgrade, got {:?}",
            String::from_utf8_lossy(&payload)
        )));
    }
    Ok(())
}

// ===== Connection tasks =====

enum Next {
    Stop(Option<QuayError>),
    Data(Result<Option<Bytes>>),
}

async fn read_loop(
    shared: Rc<ConnectionShared>,
    mut reader: TransportReader,
    mut decoder: FrameDecoder,
    stop: flume::Receiver<Option<QuayError>>,
    watchdog: Option<Duration>,
) {
    let result = read_frames(&shared, &mut reader, &mut decoder, &stop, watchdog).await;
    shared.finish(result.err());
}

async fn read_frames(
    shared: &Rc<ConnectionShared>,
    reader: &mut TransportReader,
    decoder: &mut FrameDecoder,
    stop: &flume::Receiver<Option<QuayError>>,
    watchdog: Option<Duration>,
) -> Result<()> {
    loop {
        while let Some(frame) = decoder.decode()? {
            dispatch(shared, frame)?;
        }

        let read = async {
            match watchdog {
                Some(limit) => timeout(limit, reader.read())
                    .await
                    .map_err(|_| QuayError::HeartbeatTimeout(limit))?,
                None => reader.read().await,
            }
        };
        let next = select_biased! {
            stopped = stop.recv_async().fuse() => Next::Stop(stopped.ok().flatten()),
            data = read.fuse() => Next::Data(data),
        };

        match next {
            Next::Stop(None) => return Ok(()),
            Next::Stop(Some(err)) => return Err(err),
            Next::Data(Ok(Some(data))) => decoder.extend(&data),
            Next::Data(Ok(None)) if shared.state.get() == ConnectionState::Closing => return Ok(()),
            Next::Data(Ok(None)) => return Err(QuayError::ConnectionClosed),
            Next::Data(Err(err)) => return Err(err),
        }
    }
}

fn dispatch(shared: &Rc<ConnectionShared>, frame: Frame) -> Result<()> {
    match frame.frame_type {
        FrameType::Response if frame.is_heartbeat() => {
            trace!("[CONN] {} heartbeat", shared.id);
            shared.respond(Command::Nop, false);
            shared.emit(ConnectionEvent::Heartbeat);
        }
        FrameType::Response => {
            if frame.payload == CLOSE_WAIT {
                shared.set_state(ConnectionState::Closing);
            }
            shared.emit(ConnectionEvent::Response(frame.payload));
        }
        FrameType::Error => {
            let err = BrokerError::parse(&frame.payload);
            let fatal = err.is_fatal();
            shared.emit(ConnectionEvent::Error(err.clone()));
            if fatal {
                return Err(err.into_error());
            }
            debug!("[CONN] {} broker error: {}", shared.id, err);
        }
        FrameType::Message => {
            let msg = Message::decode(frame.payload, Rc::downgrade(shared))?;
            shared.rdy.set(shared.rdy.get().saturating_sub(1));
            shared.in_flight.borrow_mut().insert(msg.id);
            shared.last_message_at.set(Some(Instant::now()));
            shared.emit(ConnectionEvent::Message(msg));
        }
    }
    Ok(())
}

/// Drain the command queue. Commands queued together go out in one write.
async fn write_loop(
    id: ConnectionId,
    mut writer: TransportWriter,
    commands: flume::Receiver<Outgoing>,
    stop: flume::Sender<Option<QuayError>>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    while let Ok(first) = commands.recv_async().await {
        let mut shutdown = false;
        let mut next = Some(first);
        while let Some(item) = next {
            match item {
                Outgoing::Command(cmd) => cmd.encode(&mut buf),
                Outgoing::Shutdown => {
                    shutdown = true;
                    break;
                }
            }
            next = commands.try_recv().ok();
        }

        if !buf.is_empty() {
            if let Err(err) = writer.write(buf.split().to_vec()).await {
                debug!("[CONN] {} write failed: {}", id, err);
                let _ = stop.send(Some(err));
                return;
            }
        }
        if shutdown {
            if let Err(err) = writer.shutdown().await {
                trace!("[CONN] {} shutdown: {}", id, err);
            }
            return;
        }
    }
}
