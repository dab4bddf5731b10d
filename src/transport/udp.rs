//! UDP transport.
//!
//! Every datagram is one of three things, told apart by length and the byte
//! at offset 13:
//!
//! - a 13-byte beacon: 8 random bytes and the sender's address
//! - a fragment: byte 13 is the `0xff` fragment indicator
//! - a packet (or the head of a fragmented one)
//!
//! [`DatagramCodec`] classifies datagrams for [`UdpFramed`]. [`UdpTransport`]
//! is the outbound [`Transport`] the dispatcher replies through; sends never
//! wait, a full socket buffer just loses the datagram as UDP would anyway.

use crate::core::address::Address;
use crate::core::fragment::Fragment;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::node::Transport;
use crate::protocol::dispatcher::Dispatcher;
use bytes::{BufMut, BytesMut};
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, instrument, trace, warn};

/// Length of a beacon datagram.
pub const BEACON_LENGTH: usize = 13;

/// One classified datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Packet(Packet),
    Fragment(Fragment),
    /// Announcement from the node with this address.
    Beacon(Address),
}

impl Datagram {
    pub fn classify(bytes: &[u8]) -> Result<Self> {
        if bytes.len() == BEACON_LENGTH {
            return Address::from_bytes(&bytes[8..BEACON_LENGTH]).map(Datagram::Beacon);
        }
        if Fragment::is_fragment(bytes) {
            return Fragment::from_bytes(bytes).map(Datagram::Fragment);
        }
        Packet::from_bytes(bytes).map(Datagram::Packet)
    }
}

/// Build a beacon announcing `address`.
pub fn beacon(address: Address) -> [u8; BEACON_LENGTH] {
    let mut out = [0u8; BEACON_LENGTH];
    out[..8].copy_from_slice(&rand::random::<u64>().to_be_bytes());
    out[8..].copy_from_slice(&address.to_bytes());
    out
}

/// Datagram codec for [`UdpFramed`]: one datagram in, one [`Datagram`] out.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatagramCodec;

impl Decoder for DatagramCodec {
    type Item = Datagram;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Datagram>> {
        if src.is_empty() {
            return Ok(None);
        }
        // consume the whole datagram even when it fails to classify, so the
        // next read starts clean
        let bytes = src.split_to(src.len());
        Datagram::classify(&bytes).map(Some)
    }
}

impl Encoder<Packet> for DatagramCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(packet.len());
        dst.put_slice(packet.as_bytes());
        Ok(())
    }
}

/// Fire-and-forget [`Transport`] over a shared UDP socket.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: SocketAddr, data: &[u8]) -> Result<()> {
        match self.socket.try_send_to(data, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(%to, len = data.len(), "socket buffer full, datagram dropped");
                Ok(())
            }
            Err(e) => Err(ProtocolError::Transport(e.to_string())),
        }
    }
}

/// A bound UDP socket feeding a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
}

impl UdpEndpoint {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(address = %socket.local_addr()?, "UDP endpoint bound");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn transport(&self) -> UdpTransport {
        UdpTransport::new(Arc::clone(&self.socket))
    }

    /// Receive until `shutdown_rx` fires or the socket closes.
    ///
    /// Packets go to `dispatcher`. Fragments and beacons go to `others` if
    /// given; reassembly and peer discovery belong to the host.
    #[instrument(skip_all, fields(local = ?self.socket.local_addr().ok()))]
    pub async fn run(
        &self,
        dispatcher: Arc<Dispatcher>,
        others: Option<mpsc::Sender<(Datagram, SocketAddr)>>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let mut framed = UdpFramed::new(Arc::clone(&self.socket), DatagramCodec);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("UDP endpoint shutting down");
                    return Ok(());
                }
                next = framed.next() => match next {
                    Some(Ok((Datagram::Packet(packet), from))) => {
                        let outcome = dispatcher.try_decode(from, packet);
                        trace!(%from, ?outcome, "packet handled");
                    }
                    Some(Ok((datagram, from))) => {
                        if let Some(ref tx) = others {
                            if tx.try_send((datagram, from)).is_err() {
                                warn!(%from, "datagram queue full or closed, dropped");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "dropped unreadable datagram");
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}
