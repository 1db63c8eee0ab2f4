//! Layered broker transport.
//!
//! ```text
//!   application bytes
//!          │
//!   ┌──────▼──────┐  snappy | deflate   (optional)
//!   │ compression │
//!   ├─────────────┤
//!   │     TLS     │  rustls session     (optional)
//!   ├─────────────┤
//!   │   raw I/O   │  TCP | Unix socket
//!   └─────────────┘
//! ```
//!
//! Layers are added by upgrade calls, always in this order. Every upgrade
//! takes the bytes that were already read but not yet consumed by the
//! caller and pushes them through the new layer, so nothing that arrived
//! after the switch is ever read in the clear.
//!
//! Once the handshake is done the transport is split into a reader and a
//! writer that can live in different tasks.

pub mod compress;
pub mod raw;
pub mod tls;

use bytes::Bytes;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use tracing::debug;

use crate::endpoint::Address;
use crate::error::{QuayError, Result};
use crate::options::TransportOptions;
use crate::poison::PoisonGuard;

use compress::{Compression, Deflater, Inflater};
use raw::{RawReader, RawWriter};
use tls::{TlsOptions, TlsSession};

/// Read side of the transport.
pub struct TransportReader {
    raw: RawReader,
    tls: Option<Rc<RefCell<TlsSession>>>,
    inflater: Option<Inflater>,
    // bytes already passed through every layer, returned by the next read
    pending: Option<Bytes>,
    read_buffer_size: usize,
}

/// Write side of the transport.
pub struct TransportWriter {
    raw: RawWriter,
    tls: Option<Rc<RefCell<TlsSession>>>,
    deflater: Option<Deflater>,
    poisoned: bool,
}

/// An unsplit transport, used while the connection handshake runs.
pub struct Transport {
    address: Address,
    reader: TransportReader,
    writer: TransportWriter,
    compression: Option<Compression>,
}

impl Transport {
    /// Open the raw socket.
    pub async fn connect(address: &Address, options: &TransportOptions) -> Result<Self> {
        let (raw_reader, raw_writer) = raw::connect(address, options).await?;
        Ok(Self {
            address: address.clone(),
            reader: TransportReader {
                raw: raw_reader,
                tls: None,
                inflater: None,
                pending: None,
                read_buffer_size: options.read_buffer_size,
            },
            writer: TransportWriter {
                raw: raw_writer,
                tls: None,
                deflater: None,
                poisoned: false,
            },
            compression: None,
        })
    }

    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        self.reader.tls.is_some()
    }

    #[inline]
    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    /// Read the next chunk of application bytes. `None` means EOF.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        self.reader.read().await
    }

    /// Write application bytes through every active layer.
    pub async fn write(&mut self, data: Vec<u8>) -> Result<()> {
        self.writer.write(data).await
    }

    /// Wrap the raw socket in TLS and run the handshake to completion.
    ///
    /// `leftover` holds raw bytes read past the last consumed frame.
    pub async fn upgrade_tls(&mut self, options: &TlsOptions, leftover: Bytes) -> Result<()> {
        if self.reader.tls.is_some() {
            return Err(QuayError::protocol("TLS already active"));
        }
        if self.compression.is_some() {
            return Err(QuayError::protocol("TLS must be negotiated before compression"));
        }
        debug!("[TRANSPORT] Starting TLS handshake with {}", self.address);

        let mut session = TlsSession::new(options, &self.address)?;
        let mut plain = Vec::new();
        let mut input = leftover.to_vec();
        if let Some(p) = self.reader.pending.take() {
            input.extend_from_slice(&p);
        }
        if !input.is_empty() {
            plain.extend(session.read_tls(&input)?);
        }

        loop {
            let out = session.take_outgoing()?;
            self.writer.write_raw(out).await?;
            if !session.is_handshaking() {
                break;
            }
            let data = self.reader.raw.read(self.reader.read_buffer_size).await?;
            if data.is_empty() {
                return Err(QuayError::tls("connection closed during handshake"));
            }
            plain.extend(session.read_tls(&data)?);
        }

        let session = Rc::new(RefCell::new(session));
        self.reader.tls = Some(session.clone());
        self.writer.tls = Some(session);
        if !plain.is_empty() {
            self.reader.pending = Some(Bytes::from(plain));
        }
        debug!("[TRANSPORT] TLS established with {}", self.address);
        Ok(())
    }

    /// Wrap the (possibly encrypted) stream in a compression layer.
    ///
    /// `leftover` holds bytes read past the last consumed frame; they are
    /// already compressed by the peer and are decompressed here.
    pub fn upgrade_compression(&mut self, compression: Compression, leftover: Bytes) -> Result<()> {
        if let Some(active) = self.compression {
            return Err(QuayError::protocol(format!(
                "cannot enable {compression}: {active} already active"
            )));
        }
        let mut inflater = compression.inflater();
        let mut input = leftover.to_vec();
        if let Some(p) = self.reader.pending.take() {
            input.extend_from_slice(&p);
        }
        if !input.is_empty() {
            let plain = inflater.decompress(&input)?;
            if !plain.is_empty() {
                self.reader.pending = Some(Bytes::from(plain));
            }
        }
        self.reader.inflater = Some(inflater);
        self.writer.deflater = Some(compression.deflater());
        self.compression = Some(compression);
        debug!("[TRANSPORT] {} enabled for {}", compression, self.address);
        Ok(())
    }

    /// Split into halves for the connection's reader and writer tasks.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        (self.reader, self.writer)
    }
}

impl TransportReader {
    /// Read the next chunk of application bytes. `None` means EOF.
    ///
    /// A read that only advanced TLS or compression state yields nothing to
    /// the caller, so this loops until there are bytes or the peer is gone.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        if let Some(pending) = self.pending.take() {
            return Ok(Some(pending));
        }
        loop {
            let raw = self.raw.read(self.read_buffer_size).await?;
            if raw.is_empty() {
                return Ok(None);
            }
            let data = self.unwrap_layers(raw)?;
            if !data.is_empty() {
                return Ok(Some(Bytes::from(data)));
            }
        }
    }

    fn unwrap_layers(&mut self, raw: Vec<u8>) -> Result<Vec<u8>> {
        let plain = match &self.tls {
            Some(tls) => tls.borrow_mut().read_tls(&raw)?,
            None => raw,
        };
        match &mut self.inflater {
            Some(inflater) => inflater.decompress(&plain),
            None => Ok(plain),
        }
    }
}

impl TransportWriter {
    /// Write application bytes through every active layer.
    ///
    /// A write cancelled halfway poisons the writer: the peer may hold half
    /// a command, so every later write fails with `BrokenPipe`.
    pub async fn write(&mut self, data: Vec<u8>) -> Result<()> {
        self.check_poisoned()?;
        let mut out = match &mut self.deflater {
            Some(deflater) => deflater.compress(&data)?,
            None => data,
        };
        if let Some(tls) = &self.tls {
            out = tls.borrow_mut().encrypt(&out)?;
        }
        self.write_raw(out).await
    }

    async fn write_raw(&mut self, data: Vec<u8>) -> Result<()> {
        self.check_poisoned()?;
        let guard = PoisonGuard::new(&mut self.poisoned);
        self.raw.write_all(data).await?;
        guard.disarm();
        Ok(())
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned {
            return Err(QuayError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "writer poisoned by cancelled I/O - reconnect required",
            )));
        }
        Ok(())
    }

    #[inline]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Send TLS close_notify if needed and shut down the write direction.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(tls) = &self.tls {
            let alert = tls.borrow_mut().close()?;
            self.write_raw(alert).await?;
        }
        self.raw.shutdown().await?;
        Ok(())
    }
}
