// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transport seam: line-framed reader/writer halves over any duplex byte
//! stream, and the dial/accept traits the session layer is generic over.
//!
//! The reference implementations speak TCP. An RFCOMM-backed transport
//! only needs to implement [`Connector`] or [`Acceptor`]; the session
//! layer never sees anything below these traits.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{LinkError, Result};
use crate::protocol::{self, ControlToken, PulseFrame, WireMessage};

/// Reads newline-delimited protocol messages from a transport half.
pub struct MessageReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: Vec::new(),
        }
    }

    /// Receive the next message. `Ok(None)` means the peer closed the
    /// stream. A line that is neither a control token nor a telemetry
    /// frame yields `LinkError::Violation` and is consumed; the caller
    /// decides whether to keep reading.
    ///
    /// Cancel-safe: `read_until` leaves partial bytes in the buffer, so
    /// a line interrupted mid-read is completed by the next call.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>> {
        let n = self
            .reader
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(LinkError::Transport)?;
        if n == 0 {
            // EOF; an unterminated tail is discarded with the connection.
            return Ok(None);
        }
        let decoded = match std::str::from_utf8(&self.line) {
            Ok(line) => WireMessage::decode(line),
            Err(_) => Err(LinkError::Violation("line is not valid UTF-8".to_string())),
        };
        self.line.clear();
        decoded.map(Some)
    }
}

/// Writes newline-delimited protocol messages to a transport half.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { writer: inner }
    }

    /// Send one control token.
    pub async fn send_token(&mut self, token: ControlToken) -> Result<()> {
        self.send_line(&protocol::encode_token(token)).await
    }

    /// Send one telemetry frame.
    pub async fn send_frame(&mut self, frame: &PulseFrame) -> Result<()> {
        let line = frame.to_json()?;
        self.send_line(&line).await
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(LinkError::Transport)?;
        self.writer.flush().await.map_err(LinkError::Transport)?;
        Ok(())
    }
}

/// Split a duplex stream into framed reader and writer halves.
pub fn split<S>(stream: S) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (MessageReader::new(read_half), MessageWriter::new(write_half))
}

/// Dial side of the transport seam.
pub trait Connector: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Establish a connection to the configured peer, yielding the
    /// stream and a peer label for logging.
    fn connect(&mut self) -> impl Future<Output = io::Result<(Self::Stream, String)>> + Send;
}

/// Accept side of the transport seam.
pub trait Acceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Block until the next inbound connection arrives.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, String)>> + Send;
}

/// Dials a TCP peer. Stands in for any serial-style duplex link.
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self) -> impl Future<Output = io::Result<(TcpStream, String)>> + Send {
        async move {
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            // Frames go out at millisecond cadence; don't batch them.
            stream.set_nodelay(true)?;
            let peer = stream.peer_addr()?.to_string();
            Ok((stream, peer))
        }
    }
}

/// Accepts TCP connections, one at a time.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind the listening socket.
    pub async fn bind(host: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, String)>> + Send {
        async move {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok((stream, peer.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bpm: f64) -> PulseFrame {
        PulseFrame {
            pulse: 500.0,
            impulses_per_minute: bpm,
            beats_per_minute: bpm,
            root_mean_square: None,
            hrstd: None,
        }
    }

    #[tokio::test]
    async fn test_token_and_frame_over_pipe() {
        let (near, far) = tokio::io::duplex(1024);
        let (mut near_rx, mut near_tx) = split(near);
        let (mut far_rx, mut far_tx) = split(far);

        near_tx.send_token(ControlToken::StartSync).await.unwrap();
        assert_eq!(
            far_rx.recv().await.unwrap(),
            Some(WireMessage::Control(ControlToken::StartSync))
        );

        far_tx.send_frame(&frame(64.0)).await.unwrap();
        match near_rx.recv().await.unwrap() {
            Some(WireMessage::Frame(f)) => assert_eq!(f.beats_per_minute, 64.0),
            other => panic!("got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_yields_none() {
        let (near, far) = tokio::io::duplex(64);
        let (mut far_rx, _far_tx) = split(far);
        drop(near);

        assert_eq!(far_rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_violation_does_not_poison_the_reader() {
        let (mut near, far) = tokio::io::duplex(1024);
        let (mut far_rx, _far_tx) = split(far);

        near.write_all(b"garbage line\nACK\n").await.unwrap();

        let err = far_rx.recv().await.unwrap_err();
        assert!(matches!(err, LinkError::Violation(_)));

        // The next line still decodes.
        assert_eq!(
            far_rx.recv().await.unwrap(),
            Some(WireMessage::Control(ControlToken::Ack))
        );
    }
}
