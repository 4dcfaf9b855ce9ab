//! Server side of UDP associations
//!
//! An association owns the outbound packet socket and the TCP control
//! stream. Client datagrams arrive either framed on the control stream
//! (UDP-over-TCP) or on the server's datagram channel, the UDP socket that
//! shares the TCP listener's port. Replies go back on the datagram channel
//! once the client has acknowledged the association there, and on the
//! control stream until then.

use crate::{
    address::{Addr, Host},
    protocol::MAX_DGRAM,
    server::{Filtering, ServerWorker},
    udp_message::{UDP_HEADER_LEN, UdpErrorCode, UdpMessage},
};
use anyhow::{Result, anyhow};
use lru::LruCache;
use parking_lot::Mutex;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket, tcp::OwnedReadHalf},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OUTGOING_QUEUE: usize = 64;

/// UPLINK_QUEUE bounds client datagrams waiting to be sent on; further
/// datagrams are dropped
const UPLINK_QUEUE: usize = 64;

/// MAX_SEEN_PEERS bounds the remote hosts remembered for address-dependent
/// filtering; the least recently used host is forgotten first
const MAX_SEEN_PEERS: usize = 4096;

/// Uplink is a client payload and its destination
type Uplink = (Addr, Vec<u8>);

/// Largest payload that still fits a datagram message carrying an IPv6
/// endpoint
const MAX_RELAYED_PAYLOAD: usize = u16::MAX as usize - UDP_HEADER_LEN - 4 - 16;

/// IcmpReport is an ICMP error concerning a datagram an association sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpReport {
    /// destination of the datagram that triggered the error
    pub destination: SocketAddr,
    /// reporter is the host that sent the ICMP message
    pub reporter: IpAddr,
    pub code: UdpErrorCode,
}

/// IcmpBridge delivers ICMP errors for datagrams sent from a local socket.
/// Receiving ICMP needs raw sockets, so it is left to the embedder.
pub trait IcmpBridge: Send + Sync {
    fn subscribe(&self, local: SocketAddr) -> mpsc::Receiver<IcmpReport>;
}

/// ReservedPort is a neighbour UDP port held for the session that
/// requested port parity with reservation
#[derive(Debug)]
pub struct ReservedPort {
    /// owner is the association whose request made the reservation
    pub(crate) owner: u64,
    pub(crate) session_id: Option<Vec<u8>>,
    socket: Mutex<Option<UdpSocket>>,
}

impl ReservedPort {
    pub fn new(owner: u64, session_id: Option<Vec<u8>>, socket: UdpSocket) -> Self {
        Self {
            owner,
            session_id,
            socket: Mutex::new(Some(socket)),
        }
    }

    /// take hands the reserved socket over, once
    pub fn take(&self) -> Option<UdpSocket> {
        self.socket.lock().take()
    }
}

/// UdpAssociation is one client's UDP relay
pub struct UdpAssociation {
    id: u64,
    session_id: Option<Vec<u8>>,
    control_peer: SocketAddr,
    socket: UdpSocket,
    datagram_channel: Option<Arc<UdpSocket>>,
    client_udp: Mutex<Option<SocketAddr>>,
    /// udp_over_tcp is set once the client acknowledged on the control
    /// stream; everything bound for it then goes there
    udp_over_tcp: AtomicBool,
    seen_peers: Mutex<LruCache<IpAddr, ()>>,
    filtering: Filtering,
    outgoing: mpsc::Sender<UdpMessage>,
    uplink: mpsc::Sender<Uplink>,
    uplink_rx: Mutex<Option<mpsc::Receiver<Uplink>>>,
    alive: AtomicBool,
    cancel: CancellationToken,
}

/// UdpAssociation implementation block
impl UdpAssociation {
    /// new creates an association and the queue of messages bound for the
    /// control stream, with AssocInit already queued
    pub fn new(
        id: u64,
        session_id: Option<Vec<u8>>,
        control_peer: SocketAddr,
        socket: UdpSocket,
        datagram_channel: Option<Arc<UdpSocket>>,
        filtering: Filtering,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<UdpMessage>) {
        let (outgoing, rx) = mpsc::channel(OUTGOING_QUEUE);
        // fresh channel with spare capacity
        let _ = outgoing.try_send(UdpMessage::AssocInit { assoc_id: id });
        let (uplink, uplink_rx) = mpsc::channel(UPLINK_QUEUE);
        let peers = NonZeroUsize::new(MAX_SEEN_PEERS).unwrap_or(NonZeroUsize::MIN);
        let assoc = Arc::new(Self {
            id,
            session_id,
            control_peer,
            socket,
            datagram_channel,
            client_udp: Mutex::new(None),
            udp_over_tcp: AtomicBool::new(false),
            seen_peers: Mutex::new(LruCache::new(peers)),
            filtering,
            outgoing,
            uplink,
            uplink_rx: Mutex::new(Some(uplink_rx)),
            alive: AtomicBool::new(true),
            cancel: parent.child_token(),
        });
        (assoc, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn client_datagram_addr(&self) -> Option<SocketAddr> {
        *self.client_udp.lock()
    }

    /// run relays until the control stream closes or the association is
    /// cancelled
    pub async fn run(
        self: Arc<Self>,
        worker: Arc<ServerWorker>,
        control: TcpStream,
        mut outgoing: mpsc::Receiver<UdpMessage>,
        icmp: Option<mpsc::Receiver<IcmpReport>>,
    ) -> Result<()> {
        let (control_read, mut control_write) = control.into_split();
        let uplink = self.uplink_rx.lock().take();

        // Control stream writer; AssocInit is first in the queue
        let writer = async {
            while let Some(msg) = outgoing.recv().await {
                control_write.write_all(&msg.marshal()).await?;
            }
            Ok::<_, anyhow::Error>(())
        };

        let result = tokio::select! {
            res = writer => res,
            res = self.uplink_from_control(control_read) => res,
            res = self.downlink() => res,
            _ = self.forward_queued(uplink) => Ok(()),
            _ = self.forward_icmp(icmp) => Ok(()),
            _ = self.cancel.cancelled() => Ok(()),
        };

        // Tear down
        self.alive.store(false, Ordering::Release);
        self.cancel.cancel();
        worker.udp_associations.remove(&self.id);
        worker.reserved_udp_addrs.retain(|_, r| r.owner != self.id);

        // DEBUG
        info!("udp association {:#x} closed", self.id);
        result
    }

    /// uplink_from_control forwards datagrams framed on the control stream
    async fn uplink_from_control(&self, mut control: OwnedReadHalf) -> Result<()> {
        loop {
            let msg = match UdpMessage::read_from(&mut control).await {
                Ok(msg) => msg,
                Err(crate::Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(anyhow!("[ERR] bad message on association control stream: {e}")),
            };
            if msg.assoc_id() != self.id {
                warn!("dropping message for association {:#x} on {:#x}", msg.assoc_id(), self.id);
                continue;
            }
            match msg {
                UdpMessage::AssocAck { .. } => self.commit_to_tcp(),
                UdpMessage::Datagram { endpoint, data, .. } => {
                    self.uplink
                        .send((endpoint, data))
                        .await
                        .map_err(|_| anyhow!("[ERR] association uplink closed"))?;
                }
                other => debug!("ignoring {other:?} from client"),
            }
        }
    }

    /// commit_to_tcp records that the client chose UDP-over-TCP
    fn commit_to_tcp(&self) {
        // DEBUG
        debug!("association {:#x} runs over TCP", self.id);
        self.udp_over_tcp.store(true, Ordering::Release);
    }

    fn is_udp_over_tcp(&self) -> bool {
        self.udp_over_tcp.load(Ordering::Acquire)
    }

    /// on_datagram_channel handles a message the client sent to the
    /// server's UDP port
    pub(crate) async fn on_datagram_channel(&self, msg: UdpMessage, from: SocketAddr) {
        match msg {
            UdpMessage::AssocAck { .. } => {
                if self.is_udp_over_tcp() {
                    debug!("association {:#x}: late ack from {from} after TCP ack", self.id);
                    return;
                }
                if from.ip() != self.control_peer.ip() {
                    warn!("association {:#x}: ack from foreign host {from}", self.id);
                    return;
                }
                let accepted = {
                    let mut client = self.client_udp.lock();
                    match *client {
                        None => {
                            *client = Some(from);
                            true
                        }
                        Some(known) => known == from,
                    }
                };
                // answer every accepted ack so a client that lost our
                // AssocInit can retry
                if accepted {
                    if let Some(channel) = &self.datagram_channel {
                        let init = UdpMessage::AssocInit { assoc_id: self.id }.marshal();
                        if let Err(e) = channel.send_to(&init, from).await {
                            warn!("association {:#x}: {e}", self.id);
                        }
                    }
                }
            }
            UdpMessage::Datagram { endpoint, data, .. } => {
                if self.client_datagram_addr() != Some(from) {
                    debug!("association {:#x}: datagram from unknown {from}", self.id);
                    return;
                }
                // resolution happens on the association's own task
                if self.uplink.try_send((endpoint, data)).is_err() {
                    debug!("association {:#x}: uplink full, dropping datagram", self.id);
                }
            }
            other => debug!("ignoring {other:?} from {from}"),
        }
    }

    /// forward sends a client payload to its destination
    async fn forward(&self, endpoint: &Addr, data: &[u8]) {
        let target = match endpoint.resolve().await {
            Ok(target) => target,
            Err(e) => {
                debug!("association {:#x}: cannot resolve {endpoint}: {e}", self.id);
                return;
            }
        };
        self.seen_peers.lock().put(target.ip(), ());
        if let Err(e) = self.socket.send_to(data, target).await {
            debug!("association {:#x}: send to {target} failed: {e}", self.id);
        }
    }

    /// forward_queued drains the uplink queue
    async fn forward_queued(&self, uplink: Option<mpsc::Receiver<Uplink>>) {
        let Some(mut uplink) = uplink else {
            return std::future::pending().await;
        };
        while let Some((endpoint, data)) = uplink.recv().await {
            self.forward(&endpoint, &data).await;
        }
        std::future::pending().await
    }

    /// downlink delivers datagrams from remote peers to the client
    async fn downlink(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if len > MAX_RELAYED_PAYLOAD {
                debug!("association {:#x}: dropping {len} byte datagram from {from}", self.id);
                continue;
            }
            if self.filtering == Filtering::AddressDependent && !self.seen_peers.lock().contains(&from.ip())
            {
                debug!("association {:#x}: filtered datagram from {from}", self.id);
                continue;
            }
            let msg = UdpMessage::Datagram {
                assoc_id: self.id,
                endpoint: Addr::from(from),
                data: buf[..len].to_vec(),
            };
            self.deliver(msg).await?;
        }
    }

    /// forward_icmp turns ICMP reports into error messages
    async fn forward_icmp(&self, icmp: Option<mpsc::Receiver<IcmpReport>>) {
        let Some(mut reports) = icmp else {
            return std::future::pending().await;
        };
        while let Some(report) = reports.recv().await {
            let msg = UdpMessage::Error {
                assoc_id: self.id,
                endpoint: Addr::from(report.destination),
                code: report.code,
                reporter: Host::from(report.reporter),
            };
            if let Err(e) = self.deliver(msg).await {
                error!("association {:#x}: {e}", self.id);
                return;
            }
        }
        std::future::pending().await
    }

    /// deliver picks the datagram channel when the client is known there
    /// and has not committed to the control stream
    async fn deliver(&self, msg: UdpMessage) -> Result<()> {
        if !self.is_udp_over_tcp() {
            if let (Some(client), Some(channel)) = (self.client_datagram_addr(), &self.datagram_channel) {
                let wire = msg.marshal();
                if let Err(e) = channel.send_to(&wire, client).await {
                    debug!("association {:#x}: send to client failed: {e}", self.id);
                }
                return Ok(());
            }
        }
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| anyhow!("[ERR] association control stream closed"))
    }
}

/// run_datagram_channel routes packets arriving on the server's UDP port
/// to their association
pub(crate) async fn run_datagram_channel(worker: Arc<ServerWorker>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = worker.cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors for earlier sends surface here on some platforms
                    debug!("datagram channel: {e}");
                    continue;
                }
            },
        };
        let msg = match UdpMessage::parse(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("datagram channel: bad packet from {from}: {e}");
                continue;
            }
        };
        let assoc = worker
            .udp_associations
            .get(&msg.assoc_id())
            .map(|a| Arc::clone(a.value()));
        match assoc {
            Some(assoc) => assoc.on_datagram_channel(msg, from).await,
            None => debug!("datagram channel: unknown association {:#x}", msg.assoc_id()),
        }
    }
}
