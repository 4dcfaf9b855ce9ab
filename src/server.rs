use crate::{
    address::Addr,
    auth::{AuthStage, PasswordAuth, ServerAuthMethod, ServerAuthenticator, UserPass},
    backlog::BacklogListener,
    commands::{self, CommandHandler},
    error::Error,
    messages::{AuthenticationReply, OperationReply, Request},
    option_set::OptionSet,
    options::{OptionData, kind},
    outbound::{DirectOutbound, Outbound},
    protocol::{AuthMethod, AuthReplyType, Command, ReplyCode},
    session::{SessionGuard, SessionStore},
    udp_assoc::{self, IcmpBridge, ReservedPort, UdpAssociation},
};
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// SINGLE_PACKET_DEADLINE bounds how long the single-packet guard waits
/// for the rest of a request once the first bytes are readable
const SINGLE_PACKET_DEADLINE: Duration = Duration::from_micros(1);

/// Filtering decides which remote peers may send datagrams back through a
/// UDP association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filtering {
    /// any remote peer
    #[default]
    EndpointIndependent,
    /// only remote hosts the client has sent to
    AddressDependent,
}

/// ServerConfig holds the tunables of a server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub session_id_len: usize,
    pub relay_idle_timeout: Duration,
    pub bind_accept_timeout: Duration,
    pub cleanup_interval: Duration,
    pub session_idle_timeout: Duration,
    /// handshake_timeout bounds reading the request and authenticating
    pub handshake_timeout: Duration,
    pub filtering: Filtering,
    /// single_packet rejects requests that do not arrive in one read
    pub single_packet: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_id_len: 8,
            relay_idle_timeout: Duration::from_secs(600),
            bind_accept_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(600),
            handshake_timeout: Duration::from_secs(30),
            filtering: Filtering::EndpointIndependent,
            single_packet: false,
        }
    }
}

/// RuleFn accepts or rejects an authenticated request
pub type RuleFn = Arc<dyn Fn(&SocksConn) -> bool + Send + Sync>;

/// VersionErrorHandler maps the first byte of a non-SOCKS6 stream to the
/// bytes written back before closing
pub type VersionErrorHandler = Arc<dyn Fn(u8) -> Vec<u8> + Send + Sync>;

/// SocksConn is an authenticated client stream and its request
pub struct SocksConn {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub request: Request,
    pub initial_data: Vec<u8>,
    pub session: Option<SessionGuard>,
    /// method is the authentication method that admitted the client
    pub method: u8,
    pub cancel: CancellationToken,
}

impl SocksConn {
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session.as_ref().map(|s| s.session().id())
    }

    /// write_reply sends an OperationReply on the control stream
    pub async fn write_reply(
        &mut self,
        code: ReplyCode,
        endpoint: Addr,
        options: OptionSet,
    ) -> Result<()> {
        let reply = OperationReply {
            code,
            endpoint,
            options,
        };
        reply.write_to(&mut self.stream).await?;
        Ok(())
    }

    /// write_reply_code sends an OperationReply with no endpoint
    pub async fn write_reply_code(&mut self, code: ReplyCode) -> Result<()> {
        self.write_reply(code, Addr::unspecified(), OptionSet::new())
            .await
    }
}

/// ServerWorker is the state shared by every connection of a server
pub struct ServerWorker {
    pub(crate) config: ServerConfig,
    pub(crate) authenticator: ServerAuthenticator,
    pub(crate) outbound: Arc<dyn Outbound>,
    pub(crate) sessions: SessionStore,
    pub(crate) backlog_listeners: DashMap<String, Arc<BacklogListener>>,
    pub(crate) udp_associations: DashMap<u64, Arc<UdpAssociation>>,
    pub(crate) reserved_udp_addrs: DashMap<String, Arc<ReservedPort>>,
    pub(crate) handlers: HashMap<u8, Arc<dyn CommandHandler>>,
    pub(crate) rule: Option<RuleFn>,
    pub(crate) version_error: VersionErrorHandler,
    pub(crate) icmp: Option<Arc<dyn IcmpBridge>>,
    pub(crate) udp_socket: Option<Arc<UdpSocket>>,
    pub(crate) cancel: CancellationToken,
}

/// ServerWorker implementation block
impl ServerWorker {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.outbound
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// handle_connection runs the whole server side of one stream
    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let handshake = timeout(self.config.handshake_timeout, self.handshake(stream, peer));
        let conn = tokio::select! {
            _ = self.cancel.cancelled() => {
                // DEBUG
                debug!("handshake with {peer} cut short by shutdown");
                return Ok(());
            }
            res = handshake => match res {
                Ok(res) => res?,
                Err(_) => return Err(anyhow!("[ERR] handshake with {peer} timed out")),
            },
        };
        match conn {
            Some(conn) => self.dispatch(conn).await,
            None => Ok(()),
        }
    }

    /// handshake reads the request and its initial data and authenticates
    /// the client. None means the stream was already answered.
    async fn handshake(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<Option<SocksConn>> {
        let local = stream.local_addr()?;

        // Parse request
        let request = match self.read_request(&mut stream).await {
            Ok(request) => request,
            Err(Error::VersionMismatch { version, .. }) => {
                // DEBUG
                debug!("version {version:#04x} greeting from {peer}");
                let response = (self.version_error)(version);
                stream.write_all(&response).await?;
                let _ = stream.shutdown().await;
                return Ok(None);
            }
            Err(e) => return Err(anyhow!("[ERR] failed to read request from {peer}: {e}")),
        };

        // Read initial data advertised alongside the request
        let initial_len = request
            .options
            .advertisement()
            .map(|(_, len)| len as usize)
            .unwrap_or(0);
        let mut initial_data = vec![0u8; initial_len];
        stream.read_exact(&mut initial_data).await?;

        // Authenticate
        let Some((stream, session, method)) = self.authenticate(stream, &request).await? else {
            return Ok(None);
        };

        Ok(Some(SocksConn {
            stream,
            peer,
            local,
            request,
            initial_data,
            session,
            method,
            cancel: self.cancel.child_token(),
        }))
    }

    /// read_request parses the request, optionally insisting that it was
    /// already buffered when the stream first became readable
    async fn read_request(&self, stream: &mut TcpStream) -> crate::Result<Request> {
        if !self.config.single_packet {
            return Request::read_from(stream).await;
        }
        stream.readable().await?;
        match timeout(SINGLE_PACKET_DEADLINE, Request::read_from(stream)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "request split across packets",
            ))),
        }
    }

    /// authenticate runs the authentication exchange and writes the
    /// authentication replies. None means the client was turned away.
    async fn authenticate(
        &self,
        mut stream: TcpStream,
        request: &Request,
    ) -> Result<Option<(TcpStream, Option<SessionGuard>, u8)>> {
        let mut options = OptionSet::new();
        let session;
        let mut method = AuthMethod::NoAuth as u8;

        if let Some(id) = request.options.session_id() {
            // Session-authenticated request
            let Some(existing) = self.sessions.get(id) else {
                reject(&mut stream, OptionData::SessionInvalid).await?;
                return Ok(None);
            };
            if let Some(token) = request.options.idempotence_expenditure() {
                if !existing.check_token(token) {
                    reject(&mut stream, OptionData::IdempotenceRejected).await?;
                    return Ok(None);
                }
                options.add_data(OptionData::IdempotenceAccepted);
            }
            options.add_data(OptionData::SessionOk);
            session = Some(existing);
        } else {
            let (read, mut write) = stream.into_split();
            let (result, read) = match self.authenticator.authenticate(read, &request.options).await? {
                AuthStage::Complete { result, conn } => (result, conn),
                AuthStage::NeedStage2 { first, pending } => {
                    AuthenticationReply::new(AuthReplyType::Failure, first.reply_options())
                        .write_to(&mut write)
                        .await?;
                    pending.continue_authenticate().await?
                }
            };
            stream = read.reunite(write)?;

            if !result.success {
                AuthenticationReply::new(AuthReplyType::Failure, result.reply_options())
                    .write_to(&mut stream)
                    .await?;
                info!("authentication failed, method {:#04x}", result.selected);
                return Ok(None);
            }
            method = result.selected;
            options = result.reply_options();

            session = if request.options.has(kind::SESSION_REQUEST) {
                let created = self.sessions.create();
                options.add_data(OptionData::SessionId(created.id().to_vec()));
                Some(created)
            } else {
                None
            };
        }

        let mut guard = None;
        if let Some(session) = session {
            if let Some(size) = request.options.token_request() {
                let window = session.allocate_window(size);
                if window.accepted {
                    options.add_data(OptionData::IdempotenceWindow {
                        base: window.base,
                        size: window.size,
                    });
                }
            }
            if request.options.has(kind::SESSION_TEARDOWN) {
                // DEBUG
                debug!("session torn down by client");
                self.sessions.remove(session.id());
            }
            guard = Some(session.attach());
        }

        AuthenticationReply::new(AuthReplyType::Success, options)
            .write_to(&mut stream)
            .await?;
        Ok(Some((stream, guard, method)))
    }

    /// dispatch applies the rule hook and hands the stream to the
    /// handler for its command
    async fn dispatch(self: Arc<Self>, mut conn: SocksConn) -> Result<()> {
        if let Some(rule) = &self.rule {
            if !rule(&conn) {
                // DEBUG
                info!("request from {} rejected by rule", conn.peer);
                conn.write_reply_code(ReplyCode::NotAllowedByRule).await?;
                return Ok(());
            }
        }

        let command = conn.request.command;
        match self.handlers.get(&command.as_byte()).cloned() {
            Some(handler) => handler.handle(self, conn).await,
            None => {
                conn.write_reply_code(ReplyCode::CommandNotSupported).await?;
                Err(anyhow!("[ERR] command {command:?} not supported"))
            }
        }
    }

    /// cleanup drops dead backlog listeners, associations, orphaned port
    /// reservations and idle sessions
    pub(crate) fn cleanup(&self) {
        self.backlog_listeners.retain(|_, l| l.is_alive());
        self.udp_associations.retain(|_, a| a.is_alive());
        self.reserved_udp_addrs
            .retain(|_, r| self.udp_associations.contains_key(&r.owner));
        let removed = self.sessions.cleanup(self.config.session_idle_timeout);
        if removed > 0 {
            // DEBUG
            debug!("cleaned up {removed} idle sessions");
        }
    }
}

/// reject writes a failed authentication reply carrying one option
async fn reject(stream: &mut TcpStream, data: OptionData) -> Result<()> {
    let mut options = OptionSet::new();
    options.add_data(data);
    AuthenticationReply::new(AuthReplyType::Failure, options)
        .write_to(stream)
        .await?;
    Ok(())
}

/// default_version_response answers clients speaking another protocol
pub fn default_version_response(first: u8) -> Vec<u8> {
    match first {
        // SOCKS4: request rejected
        4 => vec![0x00, 0x5b],
        // SOCKS5: no acceptable methods
        5 => vec![0x05, 0xff],
        // HTTP methods: CONNECT, DELETE, GET, HEAD, OPTIONS, POST/PUT, TRACE
        b if b"cdghopt".contains(&b.to_ascii_lowercase()) => {
            b"HTTP/1.0 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec()
        }
        _ => vec![crate::protocol::VERSION],
    }
}

/// Socks6Server represents a SOCKS6 server and houses related
/// configuration data
pub struct Socks6Server {
    pub listen_addr: String,
    config: ServerConfig,
    authenticator: ServerAuthenticator,
    outbound: Arc<dyn Outbound>,
    handlers: HashMap<u8, Arc<dyn CommandHandler>>,
    rule: Option<RuleFn>,
    version_error: VersionErrorHandler,
    icmp: Option<Arc<dyn IcmpBridge>>,
    listener: Option<TcpListener>,
    udp_socket: Option<Arc<UdpSocket>>,
    cancel: CancellationToken,
}

/// Socks6Server implementation block
impl Socks6Server {
    /// new is a constructor for the Socks6Server type. The server accepts
    /// everyone until an authentication method is configured.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            config: ServerConfig::default(),
            authenticator: ServerAuthenticator::with_no_auth(),
            outbound: Arc::new(DirectOutbound),
            handlers: commands::default_handlers(),
            rule: None,
            version_error: Arc::new(default_version_response),
            icmp: None,
            listener: None,
            udp_socket: None,
            cancel: CancellationToken::new(),
        }
    }

    /// with_auth requires username/password authentication when
    /// credentials are given
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        if let Some(creds) = auth {
            self.authenticator.remove_method(AuthMethod::NoAuth as u8);
            self.authenticator
                .add_method(Arc::new(PasswordAuth::single(&creds)));
        }
        self
    }

    /// with_auth_method adds an authentication method
    pub fn with_auth_method(mut self, method: Arc<dyn ServerAuthMethod>) -> Self {
        self.authenticator.add_method(method);
        self
    }

    /// with_authenticator replaces the whole method table
    pub fn with_authenticator(mut self, authenticator: ServerAuthenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&SocksConn) -> bool + Send + Sync + 'static,
    {
        self.rule = Some(Arc::new(rule));
        self
    }

    pub fn with_outbound(mut self, outbound: Arc<dyn Outbound>) -> Self {
        self.outbound = outbound;
        self
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_icmp_bridge(mut self, bridge: Arc<dyn IcmpBridge>) -> Self {
        self.icmp = Some(bridge);
        self
    }

    pub fn with_version_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(u8) -> Vec<u8> + Send + Sync + 'static,
    {
        self.version_error = Arc::new(handler);
        self
    }

    /// with_command_handler installs or replaces the handler of a command
    pub fn with_command_handler(mut self, command: Command, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.insert(command.as_byte(), handler);
        self
    }

    /// cancel_token returns the token that stops the server and every
    /// connection it spawned
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// bind to the listen address (TCP, then UDP on the same port),
    /// panics when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            panic!("bind can only be called once");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        // Datagram channel shares the port
        match UdpSocket::bind(addr).await {
            Ok(socket) => self.udp_socket = Some(Arc::new(socket)),
            Err(e) => warn!("no datagram channel on {addr}, UDP-over-TCP only: {e}"),
        }

        // DEBUG
        info!("SOCKS6 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run handles server spinup and listens for incoming connections
    /// until the cancel token fires
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] server is not bound"))?;

        let worker = Arc::new(ServerWorker {
            config: self.config.clone(),
            authenticator: self.authenticator.clone(),
            outbound: Arc::clone(&self.outbound),
            sessions: SessionStore::new(self.config.session_id_len),
            backlog_listeners: DashMap::new(),
            udp_associations: DashMap::new(),
            reserved_udp_addrs: DashMap::new(),
            handlers: self.handlers.clone(),
            rule: self.rule.clone(),
            version_error: Arc::clone(&self.version_error),
            icmp: self.icmp.clone(),
            udp_socket: self.udp_socket.clone(),
            cancel: self.cancel.clone(),
        });

        // Datagram channel
        if let Some(socket) = &self.udp_socket {
            tokio::spawn(udp_assoc::run_datagram_channel(
                Arc::clone(&worker),
                Arc::clone(socket),
            ));
        }

        // Periodic cleanup
        tokio::spawn(cleanup_loop(Arc::clone(&worker)));

        // Listen for connections to proxy
        loop {
            // Accept incoming connection
            let (inbound, peer_addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };

            // Clone for this connection
            let worker = Arc::clone(&worker);

            // Spawn async task
            tokio::spawn(async move {
                // DEBUG
                info!("new client: {}", peer_addr);

                // Send connection to connection handler
                if let Err(e) = worker.handle_connection(inbound, peer_addr).await {
                    error!("connection error: {}", e);
                }
            });
        }

        // DEBUG
        info!("SOCKS6 proxy stopped");
        Ok(())
    }
}

/// cleanup_loop periodically sweeps the shared maps of a worker
async fn cleanup_loop(worker: Arc<ServerWorker>) {
    let interval = worker.config.cleanup_interval;
    loop {
        tokio::select! {
            _ = worker.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => worker.cleanup(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatches_get_matching_answers() {
        assert_eq!(default_version_response(4), vec![0x00, 0x5b]);
        assert_eq!(default_version_response(5), vec![0x05, 0xff]);
        assert!(default_version_response(b'G').starts_with(b"HTTP/1.0 400"));
        assert!(default_version_response(b'p').starts_with(b"HTTP/1.0 400"));
        assert_eq!(default_version_response(b'x'), vec![6]);
        assert_eq!(default_version_response(0x07), vec![6]);
    }

    #[test]
    fn default_config_matches_documented_timeouts() {
        let config = ServerConfig::default();
        assert_eq!(config.relay_idle_timeout, Duration::from_secs(600));
        assert_eq!(config.bind_accept_timeout, Duration::from_secs(60));
        assert_eq!(config.filtering, Filtering::EndpointIndependent);
        assert!(!config.single_packet);
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
    }
}
