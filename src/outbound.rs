//! Outbound sockets opened on behalf of clients
//!
//! Every constructor takes the remote-leg stack options the client asked
//! for and returns the subset that was actually applied.

use crate::address::Addr;
use crate::stack_options::{StackOptionData, StackOptionInfo};
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// DEFAULT_BACKLOG is the listen queue used when no backlog is requested
pub const DEFAULT_BACKLOG: u16 = 1024;

/// Outbound opens the sockets that carry a client's traffic
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        options: &StackOptionInfo,
        addr: &Addr,
    ) -> io::Result<(TcpStream, StackOptionInfo)>;

    async fn listen(
        &self,
        cancel: &CancellationToken,
        options: &StackOptionInfo,
        addr: &Addr,
    ) -> io::Result<(TcpListener, StackOptionInfo)>;

    async fn listen_packet(
        &self,
        cancel: &CancellationToken,
        options: &StackOptionInfo,
        addr: &Addr,
    ) -> io::Result<(UdpSocket, StackOptionInfo)>;
}

/// DirectOutbound opens sockets straight from this host
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectOutbound;

#[async_trait]
impl Outbound for DirectOutbound {
    async fn dial(
        &self,
        cancel: &CancellationToken,
        options: &StackOptionInfo,
        addr: &Addr,
    ) -> io::Result<(TcpStream, StackOptionInfo)> {
        let target = cancellable(cancel, addr.resolve()).await?;
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let applied = apply_ip_options(&socket, target.is_ipv6(), options);

        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = cancellable(cancel, socket.connect(target)).await?;

        // DEBUG
        debug!("dialed {} ({})", addr, target);
        Ok((stream, applied))
    }

    async fn listen(
        &self,
        cancel: &CancellationToken,
        options: &StackOptionInfo,
        addr: &Addr,
    ) -> io::Result<(TcpListener, StackOptionInfo)> {
        let local = cancellable(cancel, addr.resolve()).await?;
        let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        let mut applied = apply_ip_options(&socket, local.is_ipv6(), options);

        socket.bind(&local.into())?;
        let backlog = match options.backlog() {
            Some(requested) => {
                applied.insert(StackOptionData::Backlog(requested));
                requested.max(1)
            }
            None => DEFAULT_BACKLOG,
        };
        socket.listen(backlog as i32)?;
        let listener = TcpListener::from_std(socket.into())?;
        Ok((listener, applied))
    }

    async fn listen_packet(
        &self,
        cancel: &CancellationToken,
        options: &StackOptionInfo,
        addr: &Addr,
    ) -> io::Result<(UdpSocket, StackOptionInfo)> {
        let local = cancellable(cancel, addr.resolve()).await?;
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        let applied = apply_ip_options(&socket, local.is_ipv6(), options);

        socket.bind(&local.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok((socket, applied))
    }
}

/// apply_ip_options sets TTL and TOS on a socket, returning the options
/// that took effect
pub fn apply_ip_options(socket: &Socket, ipv6: bool, wanted: &StackOptionInfo) -> StackOptionInfo {
    let mut applied = StackOptionInfo::new();

    if let Some(ttl) = wanted.ttl() {
        let res = if ipv6 {
            socket.set_unicast_hops_v6(ttl as u32)
        } else {
            socket.set_ttl(ttl as u32)
        };
        match res {
            Ok(()) => applied.insert(StackOptionData::Ttl(ttl)),
            Err(e) => warn!("failed to set ttl {ttl}: {e}"),
        }
    }

    if let Some(tos) = wanted.tos() {
        let res = if ipv6 {
            set_traffic_class(socket, tos)
        } else {
            socket.set_tos(tos as u32)
        };
        match res {
            Ok(()) => applied.insert(StackOptionData::Tos(tos)),
            Err(e) => warn!("failed to set tos {tos}: {e}"),
        }
    }

    applied
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
fn set_traffic_class(socket: &Socket, tos: u8) -> io::Result<()> {
    socket.set_tclass_v6(tos as u32)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd"
)))]
fn set_traffic_class(_socket: &Socket, _tos: u8) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// apply_client_options applies client-leg options to the control stream
pub fn apply_client_options(stream: &TcpStream, wanted: &StackOptionInfo) -> StackOptionInfo {
    if wanted.is_empty() {
        return StackOptionInfo::new();
    }
    let ipv6 = matches!(stream.local_addr(), Ok(SocketAddr::V6(_)));
    apply_ip_options(&SockRef::from(stream), ipv6, wanted)
}

/// cancellable runs `fut` unless `cancel` fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled")),
        res = fut => res,
    }
}
