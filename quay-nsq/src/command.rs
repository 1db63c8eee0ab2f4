//! Client commands.
//!
//! Commands are ASCII lines terminated by `\n`. Some carry a binary block
//! after the line: a 4-byte big-endian length followed by that many bytes.
//!
//! ```text
//! IDENTIFY\n[ 4-byte size ][ JSON ]
//! SUB <topic> <channel>\n
//! RDY <count>\n
//! FIN <message_id>\n
//! REQ <message_id> <timeout_ms>\n
//! TOUCH <message_id>\n
//! NOP\n
//! PUB <topic>\n[ 4-byte size ][ body ]
//! MPUB <topic>\n[ 4-byte size ][ 4-byte count ]([ 4-byte size ][ body ])*
//! DPUB <topic> <defer_ms>\n[ 4-byte size ][ body ]
//! AUTH\n[ 4-byte size ][ secret ]
//! CLS\n
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quay_core::error::{QuayError, Result};
use std::time::Duration;

use crate::message::MessageId;

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u64),
    Fin(MessageId),
    Req { id: MessageId, delay: Duration },
    Touch(MessageId),
    Nop,
    Pub { topic: String, body: Bytes },
    Mpub { topic: String, bodies: Vec<Bytes> },
    Dpub { topic: String, delay: Duration, body: Bytes },
    Auth(Bytes),
    Cls,
}

impl Command {
    /// Wire verb of this command.
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Identify(_) => "IDENTIFY",
            Self::Sub { .. } => "SUB",
            Self::Rdy(_) => "RDY",
            Self::Fin(_) => "FIN",
            Self::Req { .. } => "REQ",
            Self::Touch(_) => "TOUCH",
            Self::Nop => "NOP",
            Self::Pub { .. } => "PUB",
            Self::Mpub { .. } => "MPUB",
            Self::Dpub { .. } => "DPUB",
            Self::Auth(_) => "AUTH",
            Self::Cls => "CLS",
        }
    }

    /// Append the wire encoding to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(self.verb().as_bytes());
        match self {
            Self::Identify(body) | Self::Auth(body) => {
                dst.put_u8(b'\n');
                put_block(dst, body);
            }
            Self::Sub { topic, channel } => {
                put_args(dst, &[topic.as_bytes(), channel.as_bytes()]);
            }
            Self::Rdy(count) => put_args(dst, &[count.to_string().as_bytes()]),
            Self::Fin(id) | Self::Touch(id) => put_args(dst, &[id.as_bytes()]),
            Self::Req { id, delay } => {
                put_args(dst, &[id.as_bytes(), delay.as_millis().to_string().as_bytes()]);
            }
            Self::Nop | Self::Cls => dst.put_u8(b'\n'),
            Self::Pub { topic, body } => {
                put_args(dst, &[topic.as_bytes()]);
                put_block(dst, body);
            }
            Self::Mpub { topic, bodies } => {
                put_args(dst, &[topic.as_bytes()]);
                let total: usize = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
                dst.reserve(4 + total);
                dst.put_u32(total as u32);
                dst.put_u32(bodies.len() as u32);
                for body in bodies {
                    put_block(dst, body);
                }
            }
            Self::Dpub { topic, delay, body } => {
                put_args(dst, &[topic.as_bytes(), delay.as_millis().to_string().as_bytes()]);
                put_block(dst, body);
            }
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse one command off the front of `src`.
    ///
    /// Returns `Ok(None)` without consuming anything when `src` holds only
    /// part of a command.
    pub fn parse(src: &mut BytesMut) -> Result<Option<Self>> {
        let Some(eol) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&src[..eol])
            .map_err(|_| QuayError::protocol("command line is not UTF-8"))?
            .to_string();
        let mut parts = line.split(' ');
        let verb = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        let body_start = eol + 1;

        let expect_args = |n: usize| -> Result<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(QuayError::protocol(format!(
                    "{verb} expects {n} arguments, got {}",
                    args.len()
                )))
            }
        };

        let (cmd, consumed) = match verb {
            "IDENTIFY" | "AUTH" | "PUB" | "DPUB" => {
                let Some(block) = peek_block(&src[body_start..]) else {
                    return Ok(None);
                };
                let body = Bytes::copy_from_slice(block);
                let consumed = body_start + 4 + block.len();
                let cmd = match verb {
                    "IDENTIFY" => {
                        expect_args(0)?;
                        Self::Identify(body)
                    }
                    "AUTH" => {
                        expect_args(0)?;
                        Self::Auth(body)
                    }
                    "PUB" => {
                        expect_args(1)?;
                        Self::Pub {
                            topic: args[0].to_string(),
                            body,
                        }
                    }
                    _ => {
                        expect_args(2)?;
                        Self::Dpub {
                            topic: args[0].to_string(),
                            delay: parse_millis(args[1])?,
                            body,
                        }
                    }
                };
                (cmd, consumed)
            }
            "MPUB" => {
                expect_args(1)?;
                let Some(mut block) = peek_block(&src[body_start..]) else {
                    return Ok(None);
                };
                let consumed = body_start + 4 + block.len();
                if block.len() < 4 {
                    return Err(QuayError::protocol("MPUB block missing message count"));
                }
                let count = block.get_u32() as usize;
                let mut bodies = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let body = peek_block(block)
                        .ok_or_else(|| QuayError::protocol("MPUB body truncated"))?;
                    bodies.push(Bytes::copy_from_slice(body));
                    block.advance(4 + body.len());
                }
                if !block.is_empty() {
                    return Err(QuayError::protocol("MPUB block has trailing bytes"));
                }
                (
                    Self::Mpub {
                        topic: args[0].to_string(),
                        bodies,
                    },
                    consumed,
                )
            }
            "SUB" => {
                expect_args(2)?;
                (
                    Self::Sub {
                        topic: args[0].to_string(),
                        channel: args[1].to_string(),
                    },
                    body_start,
                )
            }
            "RDY" => {
                expect_args(1)?;
                let count = args[0]
                    .parse()
                    .map_err(|_| QuayError::protocol(format!("bad RDY count {:?}", args[0])))?;
                (Self::Rdy(count), body_start)
            }
            "FIN" => {
                expect_args(1)?;
                (Self::Fin(MessageId::parse(args[0])?), body_start)
            }
            "TOUCH" => {
                expect_args(1)?;
                (Self::Touch(MessageId::parse(args[0])?), body_start)
            }
            "REQ" => {
                expect_args(2)?;
                (
                    Self::Req {
                        id: MessageId::parse(args[0])?,
                        delay: parse_millis(args[1])?,
                    },
                    body_start,
                )
            }
            "NOP" => {
                expect_args(0)?;
                (Self::Nop, body_start)
            }
            "CLS" => {
                expect_args(0)?;
                (Self::Cls, body_start)
            }
            other => return Err(QuayError::protocol(format!("unknown command {other:?}"))),
        };

        src.advance(consumed);
        Ok(Some(cmd))
    }
}

fn put_args(dst: &mut BytesMut, args: &[&[u8]]) {
    for arg in args {
        dst.put_u8(b' ');
        dst.put_slice(arg);
    }
    dst.put_u8(b'\n');
}

fn put_block(dst: &mut BytesMut, body: &[u8]) {
    dst.reserve(4 + body.len());
    dst.put_u32(body.len() as u32);
    dst.put_slice(body);
}

// A complete `[size][bytes]` block at the front of `src`, if present.
fn peek_block(src: &[u8]) -> Option<&[u8]> {
    if src.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    src.get(4..4 + len)
}

fn parse_millis(s: &str) -> Result<Duration> {
    s.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| QuayError::protocol(format!("bad duration {s:?}")))
}

/// Check a topic name: 1 to 64 characters of `[.a-zA-Z0-9_-]`, optionally
/// ending in `#ephemeral`.
pub fn validate_topic(name: &str) -> Result<()> {
    validate_name("topic", name)
}

/// Check a channel name. Same rules as topics.
pub fn validate_channel(name: &str) -> Result<()> {
    validate_name("channel", name)
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(QuayError::config(format!("invalid {kind} name {name:?}")))
    }
}
