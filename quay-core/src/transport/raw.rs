//! Raw socket layer.
//!
//! Opens a TCP or Unix socket and splits it into independently owned halves
//! so the read loop and the write loop of a connection never wait on each
//! other.

use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use compio::net::{OwnedReadHalf, OwnedWriteHalf, TcpStream};
use compio::time::timeout;
use std::io;
use tracing::{debug, trace};

#[cfg(unix)]
use compio::net::UnixStream;

use crate::endpoint::Address;
use crate::error::{QuayError, Result};
use crate::options::TransportOptions;
use crate::tcp::enable_tcp_nodelay;

/// Read half of a raw socket.
pub enum RawReader {
    Tcp(OwnedReadHalf<TcpStream>),
    #[cfg(unix)]
    Unix(OwnedReadHalf<UnixStream>),
}

/// Write half of a raw socket.
pub enum RawWriter {
    Tcp(OwnedWriteHalf<TcpStream>),
    #[cfg(unix)]
    Unix(OwnedWriteHalf<UnixStream>),
}

/// Connect to `address` within `options.connect_timeout` and split the socket.
pub async fn connect(
    address: &Address,
    options: &TransportOptions,
) -> Result<(RawReader, RawWriter)> {
    let connect_err = |source: io::Error| QuayError::Connect {
        address: address.clone(),
        source,
    };
    let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "connect timed out");

    match address {
        Address::Tcp { host, port } => {
            let stream = timeout(
                options.connect_timeout,
                TcpStream::connect((host.as_str(), *port)),
            )
            .await
            .map_err(|_| connect_err(timed_out()))?
            .map_err(connect_err)?;
            if options.tcp_nodelay {
                enable_tcp_nodelay(&stream)?;
            }
            debug!("[TRANSPORT] Connected to {}", address);
            let (r, w) = stream.into_split();
            Ok((RawReader::Tcp(r), RawWriter::Tcp(w)))
        }
        #[cfg(unix)]
        Address::Unix(path) => {
            let stream = timeout(options.connect_timeout, UnixStream::connect(path))
                .await
                .map_err(|_| connect_err(timed_out()))?
                .map_err(connect_err)?;
            debug!("[TRANSPORT] Connected to {}", address);
            let (r, w) = stream.into_split();
            Ok((RawReader::Unix(r), RawWriter::Unix(w)))
        }
        #[cfg(not(unix))]
        Address::Unix(_) => Err(connect_err(io::Error::new(
            io::ErrorKind::Unsupported,
            "filesystem sockets are not supported on this platform",
        ))),
    }
}

impl RawReader {
    /// Read up to `capacity` bytes. An empty vector means EOF.
    pub async fn read(&mut self, capacity: usize) -> io::Result<Vec<u8>> {
        let buf = Vec::with_capacity(capacity);
        let BufResult(res, buf) = match self {
            Self::Tcp(r) => AsyncRead::read(r, buf).await,
            #[cfg(unix)]
            Self::Unix(r) => AsyncRead::read(r, buf).await,
        };
        let n = res?;
        trace!("[TRANSPORT] read {} bytes", n);
        Ok(buf)
    }
}

impl RawWriter {
    /// Write the whole buffer.
    pub async fn write_all(&mut self, data: Vec<u8>) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        trace!("[TRANSPORT] writing {} bytes", data.len());
        let BufResult(res, _) = match self {
            Self::Tcp(w) => w.write_all(data).await,
            #[cfg(unix)]
            Self::Unix(w) => w.write_all(data).await,
        };
        res
    }

    /// Shut down the write direction.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(w) => AsyncWrite::shutdown(w).await,
            #[cfg(unix)]
            Self::Unix(w) => AsyncWrite::shutdown(w).await,
        }
    }
}
