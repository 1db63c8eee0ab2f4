//! Scripted broker speaking the V2 protocol on loopback.
//!
//! Delivery follows the broker's rule: a subscribed connection receives
//! messages while its in-flight count is below its last RDY.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use compio::net::TcpListener;
use futures::{select_biased, FutureExt};
use hashbrown::HashMap;
use quay_core::endpoint::Address;
use quay_core::transport::compress::{Compression, Deflater, Inflater};
use quay_core::transport::raw::{RawReader, RawWriter};
use quay_nsq::codec::{encode_frame, FrameType, CLOSE_WAIT, HEARTBEAT, MAGIC_V2, OK};
use quay_nsq::command::Command;
use quay_nsq::message::MessageId;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const TICK: Duration = Duration::from_millis(5);

/// How the broker behaves.
#[derive(Clone, Default)]
pub struct Script {
    /// Answer IDENTIFY with a bare `OK` instead of a feature document.
    pub plain_identify: bool,
    /// Accept snappy when the client asks for it.
    pub snappy: bool,
    /// Accept deflate when the client asks for it.
    pub deflate: bool,
    /// Require AUTH with this secret after IDENTIFY.
    pub auth_secret: Option<&'static str>,
    pub max_rdy_count: Option<u64>,
    /// Send heartbeats at this interval. `None` keeps the line silent.
    pub heartbeat: Option<Duration>,
    /// Reject SUB with this error code and hang up.
    pub sub_error: Option<&'static str>,
    /// Reject publishes with this error code and hang up.
    pub pub_error: Option<&'static str>,
    /// Put requeued messages back on the queue.
    pub redeliver: bool,
}

/// Everything the broker saw.
#[derive(Debug, Default)]
pub struct BrokerLog {
    pub connections: usize,
    pub verbs: Vec<&'static str>,
    pub identify: Vec<serde_json::Value>,
    pub rdy: Vec<u64>,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    pub delivered: u64,
    pub finished: Vec<MessageId>,
    pub requeued: Vec<MessageId>,
    pub touched: u64,
    pub published: Vec<(String, Bytes)>,
}

impl BrokerLog {
    pub fn count(&self, verb: &str) -> usize {
        self.verbs.iter().filter(|v| **v == verb).count()
    }
}

#[derive(Clone)]
struct Pending {
    attempts: u16,
    body: Bytes,
}

struct Shared {
    script: Script,
    log: RefCell<BrokerLog>,
    queue: RefCell<VecDeque<Pending>>,
    next_id: Cell<u64>,
}

pub struct FakeBroker {
    pub address: Address,
    shared: Rc<Shared>,
}

impl FakeBroker {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Self::shared(script);
        let accepting = shared.clone();
        compio::runtime::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (r, w) = stream.into_split();
                compio::runtime::spawn(serve(RawReader::Tcp(r), RawWriter::Tcp(w), accepting.clone()))
                    .detach();
            }
        })
        .detach();
        Self {
            address: Address::tcp("127.0.0.1", port),
            shared,
        }
    }

    #[cfg(unix)]
    pub async fn start_unix(path: &std::path::Path, script: Script) -> Self {
        use compio::net::UnixListener;

        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).await.unwrap();
        let shared = Self::shared(script);
        let accepting = shared.clone();
        compio::runtime::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (r, w) = stream.into_split();
                compio::runtime::spawn(serve(RawReader::Unix(r), RawWriter::Unix(w), accepting.clone()))
                    .detach();
            }
        })
        .detach();
        Self {
            address: Address::unix(path),
            shared,
        }
    }

    fn shared(script: Script) -> Rc<Shared> {
        Rc::new(Shared {
            script,
            log: RefCell::new(BrokerLog::default()),
            queue: RefCell::new(VecDeque::new()),
            next_id: Cell::new(0),
        })
    }

    /// Queue a message that has already been attempted `prior` times.
    pub fn push(&self, prior: u16, body: &str) {
        self.shared.queue.borrow_mut().push_back(Pending {
            attempts: prior + 1,
            body: Bytes::copy_from_slice(body.as_bytes()),
        });
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.borrow().len()
    }

    pub fn log(&self) -> std::cell::Ref<'_, BrokerLog> {
        self.shared.log.borrow()
    }
}

/// Poll `cond` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        compio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Compression the broker agrees to for this IDENTIFY body.
fn negotiate(script: &Script, identify: &serde_json::Value) -> Option<Compression> {
    let asked = |key: &str| identify.get(key).and_then(serde_json::Value::as_bool) == Some(true);
    if script.snappy && asked("snappy") {
        Some(Compression::Snappy)
    } else if script.deflate && asked("deflate") {
        let level = identify
            .get("deflate_level")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(6);
        Some(Compression::Deflate { level: level as u32 })
    } else {
        None
    }
}

/// Parse commands off the socket so the session loop never cancels a read.
async fn read_commands(mut reader: RawReader, tx: flume::Sender<Command>, script: Script) {
    let mut buf = BytesMut::new();
    let mut seen_magic = false;
    let mut inflater: Option<Inflater> = None;
    loop {
        loop {
            if !seen_magic {
                if buf.len() < MAGIC_V2.len() {
                    break;
                }
                if &buf[..MAGIC_V2.len()] != MAGIC_V2 {
                    return;
                }
                let _ = buf.split_to(MAGIC_V2.len());
                seen_magic = true;
                continue;
            }
            match Command::parse(&mut buf) {
                Ok(Some(cmd)) => {
                    if let Command::Identify(body) = &cmd {
                        let json = serde_json::from_slice(body).unwrap_or_default();
                        if let Some(compression) = negotiate(&script, &json) {
                            inflater = Some(compression.inflater());
                        }
                    }
                    if tx.send(cmd).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }

        let data = match reader.read(4096).await {
            Ok(data) if !data.is_empty() => data,
            _ => return,
        };
        match &mut inflater {
            Some(inflater) => match inflater.decompress(&data) {
                Ok(plain) => buf.extend_from_slice(&plain),
                Err(_) => return,
            },
            None => buf.extend_from_slice(&data),
        }
    }
}

async fn serve(reader: RawReader, writer: RawWriter, shared: Rc<Shared>) {
    shared.log.borrow_mut().connections += 1;
    let (tx, rx) = flume::unbounded();
    compio::runtime::spawn(read_commands(reader, tx, shared.script.clone())).detach();

    let mut session = Session {
        shared,
        writer,
        deflater: None,
        rdy: 0,
        in_flight: HashMap::new(),
        subscribed: false,
        closing: false,
        last_heartbeat: Instant::now(),
    };
    let _ = session.run(rx).await;
    let _ = session.writer.shutdown().await;
    session.release_all();
}

struct Session {
    shared: Rc<Shared>,
    writer: RawWriter,
    deflater: Option<Deflater>,
    rdy: u64,
    in_flight: HashMap<MessageId, Pending>,
    subscribed: bool,
    closing: bool,
    last_heartbeat: Instant,
}

impl Session {
    async fn run(&mut self, commands: flume::Receiver<Command>) -> io::Result<()> {
        loop {
            let next = select_biased! {
                cmd = commands.recv_async().fuse() => Some(cmd),
                _ = compio::time::sleep(TICK).fuse() => None,
            };
            match next {
                Some(Ok(cmd)) => {
                    if !self.handle(cmd).await? {
                        return Ok(());
                    }
                    // Take everything the client wrote in one go before delivering.
                    while let Ok(cmd) = commands.try_recv() {
                        if !self.handle(cmd).await? {
                            return Ok(());
                        }
                    }
                }
                Some(Err(_)) => return Ok(()),
                None => {}
            }
            self.heartbeat().await?;
            self.deliver().await?;
            if self.closing && self.in_flight.is_empty() {
                return Ok(());
            }
        }
    }

    /// Returns false when the broker hangs up.
    async fn handle(&mut self, cmd: Command) -> io::Result<bool> {
        self.shared.log.borrow_mut().verbs.push(cmd.verb());
        match cmd {
            Command::Identify(body) => {
                let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
                let compression = negotiate(&self.shared.script, &json);
                self.shared.log.borrow_mut().identify.push(json);
                if self.shared.script.plain_identify {
                    self.send(FrameType::Response, OK).await?;
                } else {
                    let (deflate, deflate_level) = match compression {
                        Some(Compression::Deflate { level }) => (true, level),
                        _ => (false, 6),
                    };
                    let reply = serde_json::json!({
                        "max_rdy_count": self.shared.script.max_rdy_count.unwrap_or(2500),
                        "version": "1.2.1",
                        "max_msg_timeout": 900_000,
                        "msg_timeout": 60_000,
                        "tls_v1": false,
                        "deflate": deflate,
                        "deflate_level": deflate_level,
                        "snappy": compression == Some(Compression::Snappy),
                        "sample_rate": 0,
                        "auth_required": self.shared.script.auth_secret.is_some(),
                        "output_buffer_size": 16384,
                        "output_buffer_timeout": 250,
                    });
                    self.send(FrameType::Response, reply.to_string().as_bytes()).await?;
                    if let Some(compression) = compression {
                        self.deflater = Some(compression.deflater());
                        self.send(FrameType::Response, OK).await?;
                    }
                }
            }
            Command::Sub { .. } => {
                if let Some(code) = self.shared.script.sub_error {
                    self.send(FrameType::Error, code.as_bytes()).await?;
                    return Ok(false);
                }
                self.subscribed = true;
                self.send(FrameType::Response, OK).await?;
            }
            Command::Rdy(count) => {
                self.rdy = count;
                self.shared.log.borrow_mut().rdy.push(count);
            }
            Command::Fin(id) => {
                if self.release(&id).is_some() {
                    self.shared.log.borrow_mut().finished.push(id);
                } else {
                    self.send(FrameType::Error, format!("E_FIN_FAILED FIN {id} failed").as_bytes())
                        .await?;
                }
            }
            Command::Req { id, .. } => match self.release(&id) {
                Some(pending) => {
                    self.shared.log.borrow_mut().requeued.push(id);
                    if self.shared.script.redeliver {
                        self.shared.queue.borrow_mut().push_back(Pending {
                            attempts: pending.attempts + 1,
                            body: pending.body,
                        });
                    }
                }
                None => {
                    self.send(FrameType::Error, format!("E_REQ_FAILED REQ {id} failed").as_bytes())
                        .await?;
                }
            },
            Command::Touch(_) => self.shared.log.borrow_mut().touched += 1,
            Command::Nop => {}
            Command::Pub { topic, body } | Command::Dpub { topic, body, .. } => {
                return self.publish(topic, vec![body]).await;
            }
            Command::Mpub { topic, bodies } => return self.publish(topic, bodies).await,
            Command::Auth(secret) => {
                if self.shared.script.auth_secret.is_some_and(|s| s.as_bytes() != &secret[..]) {
                    self.send(FrameType::Error, b"E_AUTH_FAILED AUTH failed").await?;
                    return Ok(false);
                }
                let reply = r#"{"identity":"tester","identity_url":"","permission_count":1}"#;
                self.send(FrameType::Response, reply.as_bytes()).await?;
            }
            Command::Cls => {
                self.closing = true;
                self.send(FrameType::Response, CLOSE_WAIT).await?;
            }
        }
        Ok(true)
    }

    async fn publish(&mut self, topic: String, bodies: Vec<Bytes>) -> io::Result<bool> {
        if let Some(code) = self.shared.script.pub_error {
            self.send(FrameType::Error, code.as_bytes()).await?;
            return Ok(false);
        }
        {
            let mut log = self.shared.log.borrow_mut();
            for body in bodies {
                log.published.push((topic.clone(), body));
            }
        }
        self.send(FrameType::Response, OK).await?;
        Ok(true)
    }

    async fn heartbeat(&mut self) -> io::Result<()> {
        let Some(interval) = self.shared.script.heartbeat else {
            return Ok(());
        };
        if self.last_heartbeat.elapsed() >= interval {
            self.last_heartbeat = Instant::now();
            self.send(FrameType::Response, HEARTBEAT).await?;
        }
        Ok(())
    }

    async fn deliver(&mut self) -> io::Result<()> {
        while self.subscribed && !self.closing && (self.in_flight.len() as u64) < self.rdy {
            let Some(pending) = self.shared.queue.borrow_mut().pop_front() else {
                break;
            };
            let n = self.shared.next_id.get();
            self.shared.next_id.set(n + 1);
            let id = MessageId::parse(&format!("{n:016x}")).unwrap();

            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as i64)
                .unwrap_or_default();
            let mut payload = BytesMut::new();
            payload.put_i64(nanos);
            payload.put_u16(pending.attempts);
            payload.put_slice(id.as_bytes());
            payload.put_slice(&pending.body);

            self.in_flight.insert(id, pending);
            {
                let mut log = self.shared.log.borrow_mut();
                log.delivered += 1;
                log.in_flight += 1;
                log.peak_in_flight = log.peak_in_flight.max(log.in_flight);
            }
            self.send(FrameType::Message, &payload).await?;
        }
        Ok(())
    }

    fn release(&mut self, id: &MessageId) -> Option<Pending> {
        let pending = self.in_flight.remove(id)?;
        self.shared.log.borrow_mut().in_flight -= 1;
        Some(pending)
    }

    /// Messages left in flight by a vanished client go back on the queue.
    fn release_all(&mut self) {
        let mut log = self.shared.log.borrow_mut();
        let mut queue = self.shared.queue.borrow_mut();
        for (_, pending) in self.in_flight.drain() {
            log.in_flight -= 1;
            queue.push_front(pending);
        }
    }

    async fn send(&mut self, frame_type: FrameType, payload: &[u8]) -> io::Result<()> {
        let mut buf = BytesMut::new();
        encode_frame(frame_type, payload, &mut buf);
        let bytes = match &mut self.deflater {
            Some(deflater) => deflater
                .compress(&buf)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?,
            None => buf.to_vec(),
        };
        self.writer.write_all(bytes).await
    }
}
