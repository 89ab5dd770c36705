//! Minimal blocking client speaking the one-read-one-frame protocol.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use crate::config::DEFAULT_READ_BUFFER;
use crate::protocol::Request;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("client io error: {0}")]
    Io(#[from] io::Error),
    #[error("server closed the connection")]
    Closed,
}

pub struct Client {
    stream: TcpStream,
    read_buffer: usize,
}

impl Client {
    /// Connect with [`DEFAULT_TIMEOUT`] for both connect and reads.
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self, ClientError> {
        Self::with_timeout(addr, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        addr: impl ToSocketAddrs + std::fmt::Display,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let label = addr.to_string();
        let connect_err = |source| ClientError::Connect {
            addr: label.clone(),
            source,
        };
        let targets: Vec<SocketAddr> = addr.to_socket_addrs().map_err(connect_err)?.collect();
        let mut last_err =
            io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing");
        for target in targets {
            match TcpStream::connect_timeout(&target, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(Self {
                        stream,
                        read_buffer: DEFAULT_READ_BUFFER,
                    });
                }
                Err(err) => last_err = err,
            }
        }
        Err(connect_err(last_err))
    }

    /// Send one frame and return the server's reply from a single read.
    pub fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.stream.write_all(frame)?;
        let mut buf = vec![0u8; self.read_buffer];
        let n = loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(ClientError::Closed),
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    /// Encode a typed request and send it as one frame.
    pub fn send(&mut self, request: &Request) -> Result<Vec<u8>, ClientError> {
        self.request(&request.encode())
    }
}
