use crate::{
    address::Addr,
    backlog::BacklogListener,
    option_set::OptionSet,
    outbound::{apply_client_options, apply_ip_options},
    protocol::{Command, ReplyCode},
    server::{ServerWorker, SocksConn},
    stack_options::{
        ID_BACKLOG, ID_PORT_PARITY, ID_UDP_ERROR, Parity, PortParity, StackOptionData,
        StackOptionInfo,
    },
    udp_assoc::{ReservedPort, UdpAssociation},
    util::Defer,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use socket2::SockRef;
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// MAX_PARITY_ATTEMPTS bounds how often a UDP port is re-bound to get the
/// requested parity
const MAX_PARITY_ATTEMPTS: usize = 8;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// CommandHandler serves one request command on an authenticated stream
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, worker: Arc<ServerWorker>, conn: SocksConn) -> Result<()>;
}

/// default_handlers returns the handlers of the four standard commands
pub(crate) fn default_handlers() -> HashMap<u8, Arc<dyn CommandHandler>> {
    let mut handlers: HashMap<u8, Arc<dyn CommandHandler>> = HashMap::new();
    handlers.insert(Command::Noop.as_byte(), Arc::new(Noop));
    handlers.insert(Command::Connect.as_byte(), Arc::new(Connect));
    handlers.insert(Command::Bind.as_byte(), Arc::new(Bind));
    handlers.insert(Command::UdpAssociate.as_byte(), Arc::new(UdpAssociate));
    handlers
}

/// Noop answers success and closes
pub struct Noop;

#[async_trait]
impl CommandHandler for Noop {
    async fn handle(&self, _worker: Arc<ServerWorker>, mut conn: SocksConn) -> Result<()> {
        conn.write_reply_code(ReplyCode::Success).await?;
        let _ = conn.stream.shutdown().await;
        Ok(())
    }
}

/// Connect dials the requested endpoint and relays
pub struct Connect;

#[async_trait]
impl CommandHandler for Connect {
    async fn handle(&self, worker: Arc<ServerWorker>, mut conn: SocksConn) -> Result<()> {
        let (client_opts, remote_opts) = StackOptionInfo::from_options(&conn.request.options);
        let endpoint = conn.request.endpoint.clone();

        // Dial destination
        let (mut outbound, applied_remote) = match worker
            .outbound
            .dial(&conn.cancel, &remote_opts, &endpoint)
            .await
        {
            Ok(dialed) => dialed,
            Err(e) => {
                conn.write_reply_code(ReplyCode::from_io_error(&e)).await?;
                return Err(anyhow!("[ERR] failed to connect to {endpoint}: {e}"));
            }
        };

        // Initial data goes out before the reply
        if !conn.initial_data.is_empty() {
            if let Err(e) = outbound.write_all(&conn.initial_data).await {
                warn!("failed to write initial data to {endpoint}: {e}");
            }
        }

        let applied_client = apply_client_options(&conn.stream, &client_opts);
        let options: OptionSet = StackOptionInfo::combine(&applied_client, &applied_remote)
            .into_iter()
            .collect();
        let local = Addr::from(outbound.local_addr()?);
        conn.write_reply(ReplyCode::Success, local, options).await?;

        // DEBUG
        info!("connect {} -> {}", conn.peer, endpoint);

        let (from_client, from_server) = relay(
            conn.stream,
            outbound,
            worker.config.relay_idle_timeout,
            &conn.cancel,
        )
        .await?;

        // DEBUG
        info!(
            "connection closed: {} bytes from client, {} bytes from server",
            from_client, from_server
        );
        Ok(())
    }
}

/// Bind listens for inbound connections on the client's behalf
pub struct Bind;

#[async_trait]
impl CommandHandler for Bind {
    async fn handle(&self, worker: Arc<ServerWorker>, mut conn: SocksConn) -> Result<()> {
        let endpoint = conn.request.endpoint.clone();

        // Worker stream of an existing backlog listener
        let existing = worker
            .backlog_listeners
            .get(&endpoint.to_string())
            .map(|l| Arc::clone(l.value()));
        if let Some(listener) = existing {
            if conn.session_id().is_some() && conn.session_id() == Some(listener.session_id()) {
                return listener.serve_worker_stream(&worker, conn).await;
            }
            // DEBUG
            debug!("bind to {endpoint} collides with another session's backlog");
        }

        let (client_opts, mut remote_opts) = StackOptionInfo::from_options(&conn.request.options);
        // backlog needs a session for the worker streams
        if conn.session.is_none() {
            remote_opts.remove(ID_BACKLOG);
        }
        let backlog = remote_opts.backlog().unwrap_or(0);
        if backlog == 0 {
            remote_opts.remove(ID_BACKLOG);
        }

        let (listener, applied_remote) = match worker
            .outbound
            .listen(&conn.cancel, &remote_opts, &endpoint)
            .await
        {
            Ok(listening) => listening,
            Err(e) => {
                conn.write_reply_code(ReplyCode::from_io_error(&e)).await?;
                return Err(anyhow!("[ERR] failed to bind {endpoint}: {e}"));
            }
        };
        let bound = Addr::from(listener.local_addr()?);

        let applied_client = apply_client_options(&conn.stream, &client_opts);
        let options: OptionSet = StackOptionInfo::combine(&applied_client, &applied_remote)
            .into_iter()
            .collect();
        conn.write_reply(ReplyCode::Success, bound.clone(), options)
            .await?;

        // DEBUG
        info!("bind for {} on {} (backlog {})", conn.peer, bound, backlog);

        if backlog > 0 {
            let session_id = conn.session_id().map(<[u8]>::to_vec).unwrap_or_default();
            let backlog_listener = Arc::new(BacklogListener::new(
                bound.to_string(),
                session_id,
                backlog,
                &conn.cancel,
            ));
            worker
                .backlog_listeners
                .insert(bound.to_string(), Arc::clone(&backlog_listener));
            return backlog_listener.run(worker, listener, conn.stream).await;
        }

        // Accept exactly one inbound connection
        let accepted = tokio::select! {
            _ = conn.cancel.cancelled() => return Ok(()),
            accepted = timeout(worker.config.bind_accept_timeout, listener.accept()) => accepted,
        };
        drop(listener);
        let (inbound, remote) = match accepted {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                conn.write_reply_code(ReplyCode::from_io_error(&e)).await?;
                return Err(anyhow!("[ERR] accept on {bound} failed: {e}"));
            }
            Err(_) => {
                conn.write_reply_code(ReplyCode::Timeout).await?;
                return Err(anyhow!("[ERR] nobody connected to {bound}"));
            }
        };
        conn.write_reply(ReplyCode::Success, Addr::from(remote), OptionSet::new())
            .await?;

        relay(
            conn.stream,
            inbound,
            worker.config.relay_idle_timeout,
            &conn.cancel,
        )
        .await?;
        Ok(())
    }
}

/// UdpAssociate opens a UDP association for the client
pub struct UdpAssociate;

#[async_trait]
impl CommandHandler for UdpAssociate {
    async fn handle(&self, worker: Arc<ServerWorker>, mut conn: SocksConn) -> Result<()> {
        let endpoint = conn.request.endpoint.clone();
        let key = endpoint.to_string();
        let (client_opts, mut remote_opts) = StackOptionInfo::from_options(&conn.request.options);
        let parity = remote_opts.port_parity();
        remote_opts.remove(ID_PORT_PARITY);
        let udp_error = remote_opts.remove(ID_UDP_ERROR);

        // Reserved neighbour ports belong to the session that reserved them
        let reserved = worker
            .reserved_udp_addrs
            .get(&key)
            .map(|r| Arc::clone(r.value()));
        let mut handed_over = None;
        if let Some(reserved) = reserved {
            if conn.session_id().is_none() || reserved.session_id.as_deref() != conn.session_id() {
                conn.write_reply_code(ReplyCode::ConnectionRefused).await?;
                return Err(anyhow!("[ERR] {key} is reserved for another session"));
            }
            worker.reserved_udp_addrs.remove(&key);
            handed_over = reserved.take();
        }

        // Open packet socket
        let opened = match handed_over {
            Some(socket) => {
                let ipv6 = socket.local_addr()?.is_ipv6();
                let applied = apply_ip_options(&SockRef::from(&socket), ipv6, &remote_opts);
                Ok((socket, applied, None))
            }
            None => open_packet_socket(&worker, &conn.cancel, &remote_opts, &endpoint, parity).await,
        };
        let (socket, mut applied_remote, neighbour) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                conn.write_reply_code(ReplyCode::from_io_error(&e)).await?;
                return Err(anyhow!("[ERR] failed to open UDP socket on {endpoint}: {e}"));
            }
        };
        let bound = socket.local_addr()?;
        if let Some(requested) = parity {
            applied_remote.insert(StackOptionData::PortParity(PortParity {
                parity: if requested.parity == Parity::NoPreference {
                    Parity::NoPreference
                } else {
                    Parity::of(bound.port())
                },
                reserve: neighbour.is_some(),
            }));
        }

        // ICMP reports
        let icmp = match (&worker.icmp, udp_error) {
            (Some(bridge), Some(StackOptionData::UdpError(true))) => {
                applied_remote.insert(StackOptionData::UdpError(true));
                Some(bridge.subscribe(bound))
            }
            _ => None,
        };

        // Register association under a fresh id
        let (assoc, outgoing) = loop {
            let assoc_id = rand::random::<u64>();
            if let Entry::Vacant(slot) = worker.udp_associations.entry(assoc_id) {
                let (assoc, outgoing) = UdpAssociation::new(
                    assoc_id,
                    conn.session_id().map(<[u8]>::to_vec),
                    conn.peer,
                    socket,
                    worker.udp_socket.clone(),
                    worker.config.filtering,
                    &conn.cancel,
                );
                slot.insert(Arc::clone(&assoc));
                break (assoc, outgoing);
            }
        };
        let registered = Defer::new(|| {
            worker.udp_associations.remove(&assoc.id());
        });

        if let Some(neighbour) = neighbour {
            let neighbour_addr = Addr::from(neighbour.local_addr()?).to_string();
            // DEBUG
            debug!("reserved {neighbour_addr} for association {:#x}", assoc.id());
            worker.reserved_udp_addrs.insert(
                neighbour_addr,
                Arc::new(ReservedPort::new(
                    assoc.id(),
                    conn.session_id().map(<[u8]>::to_vec),
                    neighbour,
                )),
            );
        }

        let applied_client = apply_client_options(&conn.stream, &client_opts);
        let options: OptionSet = StackOptionInfo::combine(&applied_client, &applied_remote)
            .into_iter()
            .collect();
        conn.write_reply(ReplyCode::Success, Addr::from(bound), options)
            .await?;
        registered.disarm();

        // DEBUG
        info!(
            "udp association {:#x} for {} on {}",
            assoc.id(),
            conn.peer,
            bound
        );

        Arc::clone(&assoc)
            .run(Arc::clone(&worker), conn.stream, outgoing, icmp)
            .await
    }
}

/// open_packet_socket binds the association socket, re-binding until the
/// requested port parity is met, and reserves the neighbour port when
/// asked to
async fn open_packet_socket(
    worker: &ServerWorker,
    cancel: &CancellationToken,
    options: &StackOptionInfo,
    endpoint: &Addr,
    parity: Option<PortParity>,
) -> io::Result<(UdpSocket, StackOptionInfo, Option<UdpSocket>)> {
    let wanted = parity
        .map(|p| p.parity)
        .filter(|p| *p != Parity::NoPreference && endpoint.port == 0);

    let mut attempt = 1;
    let (socket, applied) = loop {
        let (socket, applied) = worker.outbound.listen_packet(cancel, options, endpoint).await?;
        let port = socket.local_addr()?.port();
        match wanted {
            Some(p) if Parity::of(port) != p && attempt < MAX_PARITY_ATTEMPTS => attempt += 1,
            _ => break (socket, applied),
        }
    };

    let mut neighbour = None;
    if parity.is_some_and(|p| p.reserve) {
        let local = socket.local_addr()?;
        let port = local.port();
        let pair = if port % 2 == 0 { port.checked_add(1) } else { Some(port - 1) };
        if let Some(pair) = pair {
            let pair_addr = Addr {
                host: local.ip().into(),
                port: pair,
            };
            match worker.outbound.listen_packet(cancel, options, &pair_addr).await {
                Ok((reserved, _)) => neighbour = Some(reserved),
                Err(e) => debug!("could not reserve {pair_addr}: {e}"),
            }
        }
    }
    Ok((socket, applied, neighbour))
}

/// relay copies both directions between two streams until both sides
/// have closed, the streams stay idle for `idle`, or `cancel` fires.
/// Returns the bytes copied from `a` to `b` and from `b` to `a`.
pub async fn relay<A, B>(
    a: A,
    b: B,
    idle: Duration,
    cancel: &CancellationToken,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    // milliseconds since start of the last transfer
    let start = Instant::now();
    let last = AtomicU64::new(0);

    let copy = async {
        tokio::try_join!(
            copy_half(&mut a_read, &mut b_write, &last, start),
            copy_half(&mut b_read, &mut a_write, &last, start),
        )
    };
    let watchdog = async {
        loop {
            let quiet = start
                .elapsed()
                .saturating_sub(Duration::from_millis(last.load(Ordering::Relaxed)));
            if quiet >= idle {
                return;
            }
            tokio::time::sleep(idle - quiet).await;
        }
    };

    tokio::select! {
        res = copy => res,
        _ = watchdog => Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout")),
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "relay cancelled")),
    }
}

/// copy_half copies one direction and half-closes the writer at EOF
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, last: &AtomicU64, start: Instant) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        last.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}
