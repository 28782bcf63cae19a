// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Datagram sources feeding the ingest loop.
//!
//! A source yields one datagram per call and blocks until one is available. The only
//! production source is a bound UDP socket; tests plug in scripted sources through the
//! same trait.

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::debug;

use crate::batch::Payload;
use crate::constants::BUFFER_SIZE;
use crate::errors::RelayError;

/// One received datagram and the address it came from.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Payload,
    pub sender: SocketAddr,
}

#[async_trait]
pub trait DatagramSource: Send {
    /// Waits for the next datagram. Errors are per-read; the caller decides whether the
    /// source is still usable.
    async fn receive(&mut self) -> std::io::Result<Datagram>;
}

/// UDP socket reader with a fixed receive buffer of [`BUFFER_SIZE`] bytes.
#[derive(Debug)]
pub struct UdpSource {
    socket: tokio::net::UdpSocket,
    buf: Vec<u8>,
}

impl UdpSource {
    pub async fn bind(host: &str, port: u16) -> Result<UdpSource, RelayError> {
        let addr = format!("{}:{}", host, port);
        let socket = tokio::net::UdpSocket::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        Ok(UdpSource::from_socket(socket))
    }

    #[must_use]
    pub fn from_socket(socket: tokio::net::UdpSocket) -> UdpSource {
        UdpSource {
            socket,
            buf: vec![0; BUFFER_SIZE],
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramSource for UdpSource {
    async fn receive(&mut self) -> std::io::Result<Datagram> {
        let (amt, sender) = self.socket.recv_from(&mut self.buf).await?;
        debug!("Received {} bytes from {}", amt, sender);
        Ok(Datagram {
            payload: Payload::from(&self.buf[..amt]),
            sender,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn test_udp_source_receives_datagrams_in_order() {
        let mut source = UdpSource::bind("127.0.0.1", 0).await.unwrap();
        let target = source.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"first", target).await.unwrap();
        client.send_to(b"second", target).await.unwrap();

        let first = source.receive().await.unwrap();
        let second = source.receive().await.unwrap();
        assert_eq!(first.payload.bytes(), b"first");
        assert_eq!(second.payload.bytes(), b"second");
        assert_eq!(first.sender, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_udp_source_truncates_to_buffer_size() {
        let mut source = UdpSource::bind("127.0.0.1", 0).await.unwrap();
        let target = source.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&vec![7u8; BUFFER_SIZE + 100], target)
            .await
            .unwrap();

        // Linux truncates silently; other platforms may report the overflow instead.
        match source.receive().await {
            Ok(datagram) => assert_eq!(datagram.payload.len(), BUFFER_SIZE),
            Err(e) => assert!(!e.to_string().is_empty()),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        match UdpSource::bind("127.0.0.1", port).await {
            Err(RelayError::Bind { addr, .. }) => assert_eq!(addr, format!("127.0.0.1:{port}")),
            other => panic!("expected bind error, got {other:?}"),
        }
    }
}
