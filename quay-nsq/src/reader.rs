//! Consumer coordinator.
//!
//! A [`Reader`] owns every connection for one topic/channel pair. A single
//! coordinator task holds all mutable state (peers, credit, backoff) and
//! reacts to four inputs:
//!
//! ```text
//!   Reader handle ──control──┐
//!   connections ───events────┤
//!   handler tasks ─completions┼──→ coordinator ──RDY/FIN/REQ──→ connections
//!   connect/lookup ─internal─┤
//!   timers ──────────────────┘
//! ```
//!
//! Handlers run as their own tasks, so a slow handler only delays credit
//! for the messages it holds.

use async_trait::async_trait;
use futures::{select_biased, FutureExt};
use hashbrown::HashMap;
use quay_core::backoff::Backoff;
use quay_core::endpoint::Address;
use quay_core::error::{QuayError, Result};
use quay_core::reconnect::ReconnectState;
use rand::Rng;
use std::any::Any;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::command::{validate_channel, validate_topic};
use crate::config::ReaderConfig;
use crate::connection::Connection;
use crate::discovery::Discovery;
use crate::events::{
    create_event_channel, ConnectionEvent, ConnectionId, EventReceiver, EventSender,
};
use crate::message::Message;
use crate::rdy::{admit, plan_distribution, CreditView};

/// Re-check interval for a connection that was aborted but has not
/// reported `Closed` yet.
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// Floor for the coordinator's timer wait.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// How long an early `Closed` event waits for its connection to arrive.
const ORPHAN_TTL: Duration = Duration::from_secs(60);

/// Result of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; the message is finished.
    Completed,
    /// Redeliver after the given delay, or the configured per-attempt delay.
    Requeue(Option<Duration>),
    /// Not processed; requeued with the default delay.
    Unhandled,
}

impl<E: std::fmt::Display> From<std::result::Result<(), E>> for Outcome {
    fn from(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Completed,
            Err(err) => {
                debug!("[READER] handler error: {}", err);
                Self::Unhandled
            }
        }
    }
}

/// Application message handler.
///
/// A handler may call [`Message::finish`], [`Message::requeue`] or
/// [`Message::touch`] itself; whatever it did not respond is responded from
/// the returned [`Outcome`]. A panic is treated like a failure.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use quay_nsq::message::Message;
/// use quay_nsq::reader::{Handler, Outcome};
///
/// struct Printer;
///
/// #[async_trait(?Send)]
/// impl Handler for Printer {
///     async fn handle(&self, message: &Message) -> Outcome {
///         println!("{}", String::from_utf8_lossy(&message.body));
///         Outcome::Completed
///     }
/// }
/// ```
#[async_trait(?Send)]
pub trait Handler: 'static {
    async fn handle(&self, message: &Message) -> Outcome;

    /// Called instead of `handle` once a message exceeded `max_attempts`.
    /// The message is finished afterwards.
    fn giving_up(&self, message: &Message) {
        warn!(
            "[READER] giving up on {} after {} attempts",
            message.id, message.attempts
        );
    }

    /// Called whenever a connection attempt fails or a live connection is
    /// lost with an error.
    fn connection_failed(&self, address: &Address, error: &QuayError) {
        let _ = (address, error);
    }
}

/// Counters reported by [`Reader::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Live connections
    pub connections: usize,
    pub in_flight: u64,
    pub backoff_level: u32,
    pub received: u64,
    pub finished: u64,
    pub requeued: u64,
    /// Some connection is close to exhausting its RDY.
    pub starved: bool,
}

enum Control {
    Close(flume::Sender<()>),
    SetMaxInFlight(u64),
}

enum Internal {
    Connected(Address, Result<Connection>),
    Lookup(Result<Vec<Address>>),
}

struct Completion {
    message: Message,
    outcome: std::result::Result<Outcome, QuayError>,
}

/// Handle to a running consumer.
///
/// Dropping the last handle closes the reader the same way [`Reader::close`]
/// does, without waiting for it.
pub struct Reader {
    topic: String,
    channel: String,
    control: flume::Sender<Control>,
    stats: Rc<RefCell<ReaderStats>>,
}

impl Reader {
    /// Start consuming `topic`/`channel` from a fixed set of brokers.
    ///
    /// Configuration is checked before anything is spawned. Must be called
    /// from within a compio runtime.
    pub fn start(
        addresses: impl IntoIterator<Item = Address>,
        topic: &str,
        channel: &str,
        handler: impl Handler,
        config: ReaderConfig,
    ) -> Result<Self> {
        Self::spawn(None, addresses.into_iter().collect(), topic, channel, Rc::new(handler), config)
    }

    /// Like [`Reader::start`], also polling `discovery` every
    /// `lookup_interval`. `addresses` may be empty.
    pub fn start_with_discovery(
        discovery: impl Discovery + 'static,
        addresses: impl IntoIterator<Item = Address>,
        topic: &str,
        channel: &str,
        handler: impl Handler,
        config: ReaderConfig,
    ) -> Result<Self> {
        Self::spawn(
            Some(Rc::new(discovery)),
            addresses.into_iter().collect(),
            topic,
            channel,
            Rc::new(handler),
            config,
        )
    }

    fn spawn(
        discovery: Option<Rc<dyn Discovery>>,
        addresses: Vec<Address>,
        topic: &str,
        channel: &str,
        handler: Rc<dyn Handler>,
        config: ReaderConfig,
    ) -> Result<Self> {
        validate_topic(topic)?;
        validate_channel(channel)?;
        config.validate()?;
        if addresses.is_empty() && discovery.is_none() {
            return Err(QuayError::config("no broker addresses and no discovery"));
        }

        let (control_tx, control_rx) = flume::unbounded();
        let stats = Rc::new(RefCell::new(ReaderStats::default()));
        let coordinator = Coordinator::new(
            topic.to_string(),
            channel.to_string(),
            config,
            handler,
            discovery,
            stats.clone(),
        );
        info!("[READER] starting {}/{} with {} addresses", topic, channel, addresses.len());
        compio::runtime::spawn(coordinator.run(addresses, control_rx)).detach();

        Ok(Self {
            topic: topic.to_string(),
            channel: channel.to_string(),
            control: control_tx,
            stats,
        })
    }

    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[inline]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Snapshot of the reader counters.
    pub fn stats(&self) -> ReaderStats {
        self.stats.borrow().clone()
    }

    /// Whether some connection's in-flight count is near its RDY.
    pub fn is_starved(&self) -> bool {
        self.stats.borrow().starved
    }

    /// Change the total credit. `0` pauses consumption.
    pub fn set_max_in_flight(&self, max_in_flight: u64) -> Result<()> {
        self.control
            .send(Control::SetMaxInFlight(max_in_flight))
            .map_err(|_| QuayError::ChannelClosed)
    }

    /// Stop consuming and close every connection.
    ///
    /// Waits for in-flight messages up to `close_timeout`, then for the
    /// connections to close. Calling it on a closed reader is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        if self.control.send(Control::Close(tx)).is_err() {
            return Ok(());
        }
        // The coordinator drops the reply sender when it exits.
        let _ = rx.recv_async().await;
        Ok(())
    }
}

// ===== Coordinator =====

enum Slot {
    Connecting,
    Live(Connection),
    Waiting { until: Instant },
    Denied,
    /// Removed by discovery; closes once nothing is in flight.
    Draining { conn: Connection, deadline: Instant },
}

struct Peer {
    slot: Slot,
    reconnect: ReconnectState,
    from_discovery: bool,
    ready_since: Instant,
}

enum ClosePhase {
    /// RDY 0 sent; waiting for in-flight messages.
    Draining { deadline: Instant },
    /// CLS sent; waiting for connections to close.
    Closing { deadline: Instant },
}

enum Step {
    Control(Control),
    HandleDropped,
    Event(ConnectionId, ConnectionEvent),
    Completion(Completion),
    Internal(Internal),
    Tick,
}

struct Coordinator {
    topic: String,
    channel: String,
    config: ReaderConfig,
    handler: Rc<dyn Handler>,
    discovery: Option<Rc<dyn Discovery>>,
    stats: Rc<RefCell<ReaderStats>>,

    peers: HashMap<Address, Peer>,
    by_id: HashMap<ConnectionId, Address>,
    /// `Closed` events that overtook their connection's arrival.
    orphans: HashMap<ConnectionId, (Instant, Option<QuayError>)>,

    backoff: Backoff,
    backoff_until: Option<Instant>,
    trial: Option<ConnectionId>,
    trial_cursor: usize,
    /// Handler tasks spawned but not yet reported back.
    handlers_running: u64,

    next_redistribute: Instant,
    next_lookup: Option<Instant>,
    closing: Option<ClosePhase>,
    close_replies: Vec<flume::Sender<()>>,
    done: bool,

    events_tx: EventSender,
    events_rx: EventReceiver,
    completions_tx: flume::Sender<Completion>,
    completions_rx: flume::Receiver<Completion>,
    internal_tx: flume::Sender<Internal>,
    internal_rx: flume::Receiver<Internal>,
}

impl Coordinator {
    fn new(
        topic: String,
        channel: String,
        config: ReaderConfig,
        handler: Rc<dyn Handler>,
        discovery: Option<Rc<dyn Discovery>>,
        stats: Rc<RefCell<ReaderStats>>,
    ) -> Self {
        let now = Instant::now();
        let (events_tx, events_rx) = create_event_channel();
        let (completions_tx, completions_rx) = flume::unbounded();
        let (internal_tx, internal_rx) = flume::unbounded();
        let next_lookup = discovery.as_ref().map(|_| {
            let spread = rand::thread_rng().gen::<f64>() * config.lookup_jitter;
            now + config.lookup_interval.mul_f64(spread)
        });
        Self {
            topic,
            channel,
            backoff: Backoff::new(config.backoff.clone()),
            next_redistribute: now + config.redistribute_interval,
            config,
            handler,
            discovery,
            stats,
            peers: HashMap::new(),
            by_id: HashMap::new(),
            orphans: HashMap::new(),
            backoff_until: None,
            trial: None,
            trial_cursor: 0,
            handlers_running: 0,
            next_lookup,
            closing: None,
            close_replies: Vec::new(),
            done: false,
            events_tx,
            events_rx,
            completions_tx,
            completions_rx,
            internal_tx,
            internal_rx,
        }
    }

    async fn run(mut self, addresses: Vec<Address>, control: flume::Receiver<Control>) {
        for address in addresses {
            self.add_peer(address, false);
        }

        let mut control = Some(control);
        while !self.done {
            let wait = self
                .next_deadline()
                .saturating_duration_since(Instant::now())
                .max(MIN_WAIT);
            let step = {
                let control_recv = async {
                    match &control {
                        Some(rx) => rx.recv_async().await.ok(),
                        None => futures::future::pending().await,
                    }
                };
                select_biased! {
                    c = control_recv.fuse() => c.map_or(Step::HandleDropped, Step::Control),
                    e = self.events_rx.recv_async().fuse() => match e {
                        Ok((id, event)) => Step::Event(id, event),
                        Err(_) => Step::Tick,
                    },
                    c = self.completions_rx.recv_async().fuse() => c.map_or(Step::Tick, Step::Completion),
                    i = self.internal_rx.recv_async().fuse() => i.map_or(Step::Tick, Step::Internal),
                    _ = compio::time::sleep(wait).fuse() => Step::Tick,
                }
            };

            match step {
                Step::Control(Control::Close(reply)) => self.begin_close(Some(reply)),
                Step::Control(Control::SetMaxInFlight(max)) => self.set_max_in_flight(max),
                Step::HandleDropped => {
                    debug!("[READER] handle dropped, closing");
                    control = None;
                    self.begin_close(None);
                }
                Step::Event(id, event) => self.on_event(id, event),
                Step::Completion(completion) => self.on_completion(completion),
                Step::Internal(Internal::Connected(address, result)) => {
                    self.on_connected(address, result);
                }
                Step::Internal(Internal::Lookup(result)) => self.on_lookup(result),
                Step::Tick => {}
            }
            self.on_timers(Instant::now());
            self.refresh_stats();
        }

        info!("[READER] {}/{} closed", self.topic, self.channel);
        for reply in self.close_replies.drain(..) {
            let _ = reply.send(());
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_redistribute;
        let mut consider = |t: Instant| {
            if t < deadline {
                deadline = t;
            }
        };
        if let Some(t) = self.next_lookup {
            consider(t);
        }
        if let Some(t) = self.backoff_until {
            consider(t);
        }
        match &self.closing {
            Some(ClosePhase::Draining { deadline: d } | ClosePhase::Closing { deadline: d }) => {
                consider(*d);
            }
            None => {}
        }
        for peer in self.peers.values() {
            match &peer.slot {
                Slot::Waiting { until } => consider(*until),
                Slot::Draining { deadline, .. } => consider(*deadline),
                _ => {}
            }
        }
        deadline
    }

    // ===== Peers =====

    fn add_peer(&mut self, address: Address, from_discovery: bool) {
        if self.peers.contains_key(&address) {
            return;
        }
        let reconnect =
            ReconnectState::new(self.config.reconnect_interval, self.config.reconnect_interval_max);
        self.peers.insert(
            address.clone(),
            Peer {
                slot: Slot::Connecting,
                reconnect,
                from_discovery,
                ready_since: Instant::now(),
            },
        );
        self.spawn_connect(address);
    }

    fn spawn_connect(&self, address: Address) {
        debug!("[READER] connecting to {}", address);
        let config = self.config.connection.clone();
        let events = self.events_tx.clone();
        let internal = self.internal_tx.clone();
        let topic = self.topic.clone();
        let channel = self.channel.clone();
        compio::runtime::spawn(async move {
            let result = async {
                let conn = Connection::connect(&address, &config, events).await?;
                if let Err(err) = conn.subscribe(&topic, &channel) {
                    conn.abort();
                    return Err(err);
                }
                Ok(conn)
            }
            .await;
            let _ = internal.send(Internal::Connected(address, result));
        })
        .detach();
    }

    fn live_connections(&self) -> impl Iterator<Item = &Connection> {
        self.peers.values().filter_map(|peer| match &peer.slot {
            Slot::Live(conn) if !conn.state().is_terminal() => Some(conn),
            _ => None,
        })
    }

    fn total_in_flight(&self) -> u64 {
        self.peers
            .values()
            .map(|peer| match &peer.slot {
                Slot::Live(conn) | Slot::Draining { conn, .. } => conn.in_flight(),
                _ => 0,
            })
            .sum()
    }

    /// No message is held by a broker or by a handler.
    fn is_idle(&self) -> bool {
        self.handlers_running == 0 && self.total_in_flight() == 0
    }

    fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        let address = self.by_id.get(&id)?;
        match &self.peers.get(address)?.slot {
            Slot::Live(conn) | Slot::Draining { conn, .. } => Some(conn),
            _ => None,
        }
    }

    fn live_connection(&self, id: ConnectionId) -> Option<&Connection> {
        let address = self.by_id.get(&id)?;
        match &self.peers.get(address)?.slot {
            Slot::Live(conn) => Some(conn),
            _ => None,
        }
    }

    fn on_connected(&mut self, address: Address, result: Result<Connection>) {
        let wanted = self.closing.is_none()
            && matches!(self.peers.get(&address).map(|p| &p.slot), Some(Slot::Connecting));
        match result {
            Ok(conn) if !wanted => {
                debug!("[READER] {} no longer wanted, closing", address);
                let _ = conn.close();
            }
            Ok(conn) => {
                let id = conn.id();
                if let Some((_, closed)) = self.orphans.remove(&id) {
                    self.by_id.insert(id, address);
                    self.set_slot_live(id, conn);
                    self.on_connection_lost(id, closed);
                    return;
                }
                info!("[READER] {} subscribed on {}", id, address);
                self.by_id.insert(id, address);
                self.set_slot_live(id, conn);
                self.on_connection_gained();
            }
            Err(err) => {
                if !wanted {
                    return;
                }
                warn!("[READER] connect to {} failed: {}", address, err);
                self.handler.connection_failed(&address, &err);
                self.schedule_reconnect(&address, &err);
            }
        }
    }

    fn set_slot_live(&mut self, id: ConnectionId, conn: Connection) {
        if let Some(peer) = self.by_id.get(&id).and_then(|a| self.peers.get_mut(a)) {
            peer.slot = Slot::Live(conn);
            peer.ready_since = Instant::now();
            peer.reconnect.reset();
        }
    }

    fn schedule_reconnect(&mut self, address: &Address, err: &QuayError) {
        let Some(peer) = self.peers.get_mut(address) else {
            return;
        };
        if err.is_recoverable() {
            let delay = peer.reconnect.next_delay();
            debug!("[READER] reconnecting to {} in {:?}", address, delay);
            peer.slot = Slot::Waiting {
                until: Instant::now() + delay,
            };
        } else {
            error!("[READER] {} denied, not retrying: {}", address, err);
            peer.slot = Slot::Denied;
        }
    }

    fn on_connection_gained(&mut self) {
        if self.backoff.is_throttled() {
            // No trial can be pending when nothing is connected.
            if self.backoff_until.is_none() && self.trial.is_none() && self.is_idle() {
                self.backoff_until = Some(Instant::now());
            }
        } else {
            self.redistribute();
        }
    }

    /// A connection closed, by request or by failure.
    fn on_connection_lost(&mut self, id: ConnectionId, error: Option<QuayError>) {
        let Some(address) = self.by_id.remove(&id) else {
            return;
        };
        if self.trial == Some(id) {
            self.trial = None;
            if self.backoff.is_throttled() {
                self.backoff_until = Some(Instant::now());
            }
        }

        let remove = self.closing.is_some()
            || matches!(self.peers.get(&address).map(|p| &p.slot), Some(Slot::Draining { .. }));
        if remove {
            debug!("[READER] {} on {} removed", id, address);
            self.peers.remove(&address);
        } else {
            let err = error.unwrap_or(QuayError::ConnectionClosed);
            warn!("[READER] {} to {} lost: {}", id, address, err);
            self.handler.connection_failed(&address, &err);
            self.schedule_reconnect(&address, &err);
        }
        if !self.backoff.is_throttled() {
            self.redistribute();
        }
    }

    // ===== Events =====

    fn on_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(message) => self.on_message_delivered(id, message),
            ConnectionEvent::Closed(error) => {
                if self.by_id.contains_key(&id) {
                    self.on_connection_lost(id, error);
                } else {
                    self.orphans.insert(id, (Instant::now(), error));
                }
            }
            ConnectionEvent::Error(err) => debug!("[READER] {} broker error: {}", id, err),
            ConnectionEvent::Heartbeat => trace!("[READER] {} heartbeat", id),
            ConnectionEvent::IdentifyResponse(_)
            | ConnectionEvent::Ready
            | ConnectionEvent::Response(_) => {}
        }
    }

    fn on_message_delivered(&mut self, id: ConnectionId, message: Message) {
        self.stats.borrow_mut().received += 1;

        if self.backoff.is_throttled() {
            // The trial message closes the window.
            if let Some(conn) = self.connection(id) {
                if conn.last_rdy() > 0 {
                    let _ = conn.send_rdy(0);
                }
            }
            if self.trial == Some(id) {
                self.trial = None;
            }
        }

        let max_attempts = self.config.max_attempts;
        if max_attempts > 0 && message.attempts > max_attempts {
            self.handler.giving_up(&message);
            if message.finish().is_ok() {
                self.stats.borrow_mut().finished += 1;
            }
            // Neither a success nor a failure; the window stays at its level.
            if self.backoff.is_throttled() && self.closing.is_none() {
                self.arm_backoff_timer();
            }
            return;
        }

        self.handlers_running += 1;
        let handler = self.handler.clone();
        let completions = self.completions_tx.clone();
        compio::runtime::spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await
                .map_err(|panic| QuayError::HandlerFault(panic_message(&*panic)));
            let _ = completions.send(Completion { message, outcome });
        })
        .detach();
    }

    fn on_completion(&mut self, completion: Completion) {
        let Completion { message, outcome } = completion;
        self.handlers_running = self.handlers_running.saturating_sub(1);
        let failure_delay = match outcome {
            Ok(Outcome::Completed) => None,
            Ok(Outcome::Requeue(delay)) => Some(delay),
            Ok(Outcome::Unhandled) => Some(None),
            Err(err) => {
                error!("[READER] handler failed on {}: {}", message.id, err);
                Some(None)
            }
        };

        match failure_delay {
            None => {
                if !message.has_responded() {
                    let _ = message.finish();
                }
                self.stats.borrow_mut().finished += 1;
                self.on_message_completed(&message);
            }
            Some(delay) => {
                if !message.has_responded() {
                    let delay = delay.unwrap_or_else(|| self.default_requeue_delay(message.attempts));
                    let _ = message.requeue(delay);
                }
                self.stats.borrow_mut().requeued += 1;
                self.on_message_failed();
            }
        }
    }

    fn default_requeue_delay(&self, attempts: u16) -> Duration {
        self.config
            .requeue_delay
            .saturating_mul(u32::from(attempts.max(1)))
            .min(self.config.max_requeue_delay)
    }

    fn on_message_completed(&mut self, message: &Message) {
        if self.backoff.is_throttled() {
            let level = self.backoff.on_success();
            if level == 0 {
                info!("[READER] backoff complete, resuming");
                self.backoff_until = None;
                self.trial = None;
                self.redistribute();
            } else {
                self.arm_backoff_timer();
            }
            return;
        }
        if self.closing.is_some() {
            return;
        }
        // Top the connection back up when its remaining credit runs low.
        let Some(conn) = message.origin_id().and_then(|id| self.live_connection(id)) else {
            return;
        };
        let last = conn.last_rdy();
        if last > 0 && (conn.rdy() <= 1 || conn.rdy() < last / 4) {
            let _ = conn.send_rdy(last);
        }
    }

    fn on_message_failed(&mut self) {
        let level = self.backoff.on_failure();
        info!("[READER] backoff level {}", level);
        self.trial = None;
        for conn in self.live_connections() {
            if conn.last_rdy() > 0 {
                let _ = conn.send_rdy(0);
            }
        }
        self.arm_backoff_timer();
    }

    fn arm_backoff_timer(&mut self) {
        let delay = self.backoff.delay();
        trace!("[READER] next trial in {:?}", delay);
        self.backoff_until = Some(Instant::now() + delay);
    }

    /// Backoff window elapsed: let exactly one connection take one message.
    fn open_trial(&mut self) {
        self.backoff_until = None;
        if self.closing.is_some() || !self.is_idle() {
            // Outstanding completions re-arm the timer.
            return;
        }
        let mut live: Vec<&Connection> = self.live_connections().collect();
        if live.is_empty() {
            return;
        }
        live.sort_by_key(|c| c.id());
        let conn = live[self.trial_cursor % live.len()].clone();
        self.trial_cursor = self.trial_cursor.wrapping_add(1);
        debug!("[READER] trial RDY on {}", conn.id());
        if conn.send_rdy(1).is_ok() {
            self.trial = Some(conn.id());
        }
    }

    // ===== Credit =====

    fn redistribute(&mut self) {
        if self.backoff.is_throttled() || self.closing.is_some() {
            return;
        }
        let now = Instant::now();
        let views: Vec<CreditView> = self
            .peers
            .values()
            .filter_map(|peer| match &peer.slot {
                Slot::Live(conn) if !conn.state().is_terminal() => Some(CreditView {
                    id: conn.id(),
                    max_rdy: conn.max_rdy_count(),
                    last_rdy: conn.last_rdy(),
                    in_flight: conn.in_flight(),
                    idle_for: now.saturating_duration_since(
                        conn.last_message_at().unwrap_or(peer.ready_since),
                    ),
                }),
                _ => None,
            })
            .collect();
        // Messages still held by draining connections count against the budget.
        let held: u64 = self
            .peers
            .values()
            .map(|peer| match &peer.slot {
                Slot::Draining { conn, .. } => conn.in_flight(),
                _ => 0,
            })
            .sum();
        let plan = plan_distribution(
            self.config.max_in_flight,
            &views,
            self.config.low_rdy_idle_timeout,
        );
        let budget = self.config.max_in_flight.saturating_sub(held);
        for (id, count) in admit(budget, &views, &plan) {
            if let Some(conn) = self.connection(id) {
                if let Err(err) = conn.send_rdy(count) {
                    debug!("[READER] RDY {} on {} failed: {}", count, id, err);
                }
            }
        }
    }

    fn set_max_in_flight(&mut self, max: u64) {
        info!("[READER] max_in_flight {} → {}", self.config.max_in_flight, max);
        self.config.max_in_flight = max;
        self.redistribute();
    }

    // ===== Discovery =====

    fn spawn_lookup(&mut self) {
        let Some(discovery) = self.discovery.clone() else {
            return;
        };
        self.next_lookup = None;
        let topic = self.topic.clone();
        let internal = self.internal_tx.clone();
        compio::runtime::spawn(async move {
            let result = discovery.lookup(&topic).await;
            let _ = internal.send(Internal::Lookup(result));
        })
        .detach();
    }

    fn on_lookup(&mut self, result: Result<Vec<Address>>) {
        if self.closing.is_some() {
            return;
        }
        self.next_lookup = Some(Instant::now() + self.config.lookup_interval);
        let found = match result {
            Ok(found) => found,
            Err(err) => {
                warn!("[READER] lookup for {} failed: {}", self.topic, err);
                return;
            }
        };
        trace!("[READER] lookup found {} brokers", found.len());

        for address in &found {
            self.add_peer(address.clone(), true);
        }

        let now = Instant::now();
        let grace = self.config.close_timeout;
        let gone: Vec<Address> = self
            .peers
            .iter()
            .filter(|(address, peer)| peer.from_discovery && !found.contains(address))
            .map(|(address, _)| address.clone())
            .collect();
        for address in gone {
            let Some(peer) = self.peers.get_mut(&address) else {
                continue;
            };
            match std::mem::replace(&mut peer.slot, Slot::Denied) {
                Slot::Live(conn) => {
                    info!("[READER] {} left discovery, draining", address);
                    let _ = conn.send_rdy(0);
                    peer.slot = Slot::Draining {
                        conn,
                        deadline: now + grace,
                    };
                }
                draining @ Slot::Draining { .. } => peer.slot = draining,
                Slot::Connecting | Slot::Waiting { .. } | Slot::Denied => {
                    self.peers.remove(&address);
                }
            }
        }
        self.redistribute();
    }

    // ===== Timers =====

    fn on_timers(&mut self, now: Instant) {
        let due: Vec<Address> = self
            .peers
            .iter()
            .filter(|(_, peer)| matches!(peer.slot, Slot::Waiting { until } if until <= now))
            .map(|(address, _)| address.clone())
            .collect();
        for address in due {
            if let Some(peer) = self.peers.get_mut(&address) {
                peer.slot = Slot::Connecting;
            }
            self.spawn_connect(address);
        }

        for peer in self.peers.values_mut() {
            if let Slot::Draining { conn, deadline } = &mut peer.slot {
                if *deadline <= now {
                    conn.abort();
                    *deadline = now + ABORT_GRACE;
                } else if conn.in_flight() == 0 {
                    let _ = conn.close();
                }
            }
        }

        self.orphans
            .retain(|_, (at, _)| now.saturating_duration_since(*at) < ORPHAN_TTL);

        if self.next_lookup.is_some_and(|t| t <= now) {
            self.spawn_lookup();
        }
        if self.backoff_until.is_some_and(|t| t <= now) {
            self.open_trial();
        }
        if self.next_redistribute <= now {
            self.next_redistribute = now + self.config.redistribute_interval;
            self.redistribute();
        }
        self.check_close(now);
    }

    // ===== Shutdown =====

    fn begin_close(&mut self, reply: Option<flume::Sender<()>>) {
        self.close_replies.extend(reply);
        if self.closing.is_some() {
            return;
        }
        info!("[READER] closing {}/{}", self.topic, self.channel);
        self.closing = Some(ClosePhase::Draining {
            deadline: Instant::now() + self.config.close_timeout,
        });
        self.next_lookup = None;
        self.backoff_until = None;
        self.peers.retain(|_, peer| match &peer.slot {
            Slot::Live(conn) | Slot::Draining { conn, .. } => {
                if conn.last_rdy() > 0 {
                    let _ = conn.send_rdy(0);
                }
                true
            }
            Slot::Connecting | Slot::Waiting { .. } | Slot::Denied => false,
        });
    }

    fn check_close(&mut self, now: Instant) {
        match self.closing {
            None => {}
            Some(ClosePhase::Draining { deadline }) => {
                let in_flight = self.total_in_flight();
                if in_flight == 0 || deadline <= now {
                    if in_flight > 0 {
                        warn!("[READER] closing with {} messages in flight", in_flight);
                    }
                    for peer in self.peers.values() {
                        if let Slot::Live(conn) | Slot::Draining { conn, .. } = &peer.slot {
                            let _ = conn.close();
                        }
                    }
                    self.closing = Some(ClosePhase::Closing {
                        deadline: now + self.config.connection.close_timeout,
                    });
                    self.check_close(now);
                }
            }
            Some(ClosePhase::Closing { deadline }) => {
                if self.peers.is_empty() {
                    self.done = true;
                } else if deadline <= now {
                    for peer in self.peers.values() {
                        if let Slot::Live(conn) | Slot::Draining { conn, .. } = &peer.slot {
                            conn.abort();
                        }
                    }
                    self.done = true;
                }
            }
        }
    }

    fn refresh_stats(&self) {
        let mut stats = self.stats.borrow_mut();
        stats.connections = self.live_connections().count();
        stats.in_flight = self.total_in_flight();
        stats.backoff_level = self.backoff.level();
        stats.starved = self.live_connections().any(Connection::is_starved);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
