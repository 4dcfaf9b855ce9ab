//! SOCKS6 client
//!
//! Every operation runs through [`Client::handshake`]: one request carrying
//! the authentication advertisement (or the session id and an idempotence
//! token), the authentication replies, then the operation reply. Session
//! and token state is shared by clones of a client.

use crate::{
    address::Addr,
    auth::{ClientAuthDriver, ClientAuthMethod, PasswordClient, UserPass},
    error::{Error, Result},
    messages::{AuthenticationReply, OperationReply, Request},
    option_set::OptionSet,
    options::{OptionData, kind},
    protocol::{Command, MAX_DGRAM, ReplyCode},
    stack_options::{StackOption, StackOptionData},
    udp_message::UdpMessage,
};
use parking_lot::Mutex;
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket, tcp::OwnedWriteHalf},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

/// ASSOC_ACK_ATTEMPTS bounds how often the datagram channel is tried
/// before falling back to UDP-over-TCP
const ASSOC_ACK_ATTEMPTS: usize = 3;
const ASSOC_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// ClientConfig selects the optional protocol features a client uses
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// use_session requests a session and reuses it afterwards
    pub use_session: bool,
    /// use_token requests idempotence tokens and spends one per request
    pub use_token: bool,
    pub token_window: u32,
    /// udp_over_tcp keeps association traffic on the control stream
    pub udp_over_tcp: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            use_session: false,
            use_token: false,
            token_window: 64,
            udp_over_tcp: false,
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    session_id: Option<Vec<u8>>,
    /// base and size of the current idempotence window
    window: Option<(u32, u32)>,
    next_token: u32,
}

impl ClientState {
    /// remaining counts the unspent tokens of the window
    fn remaining(&self) -> u32 {
        match self.window {
            Some((base, size)) => size.saturating_sub(self.next_token.wrapping_sub(base)),
            None => 0,
        }
    }

    /// spend_token hands out the next token while the window lasts
    fn spend_token(&mut self) -> Option<u32> {
        if self.remaining() == 0 {
            return None;
        }
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        Some(token)
    }

    fn set_window(&mut self, base: u32, size: u32) {
        let in_window = self.window.is_some() && self.next_token.wrapping_sub(base) < size;
        if !in_window {
            self.next_token = base;
        }
        self.window = Some((base, size));
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Client talks to one SOCKS6 server
#[derive(Clone)]
pub struct Client {
    server: SocketAddr,
    config: ClientConfig,
    auth: Option<Arc<dyn ClientAuthMethod>>,
    state: Arc<Mutex<ClientState>>,
}

/// Client implementation block
impl Client {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            config: ClientConfig::default(),
            auth: None,
            state: Arc::new(Mutex::new(ClientState::default())),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// with_auth offers `method` to the server on every request that does
    /// not ride on a session
    pub fn with_auth(mut self, method: Arc<dyn ClientAuthMethod>) -> Self {
        self.auth = Some(method);
        self
    }

    pub fn with_password(self, creds: UserPass) -> Self {
        self.with_auth(Arc::new(PasswordClient::new(creds)))
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.state.lock().session_id.clone()
    }

    /// idempotence_window returns the base and size of the current window
    pub fn idempotence_window(&self) -> Option<(u32, u32)> {
        self.state.lock().window
    }

    /// handshake opens a stream to the server and runs a request through
    /// to a successful operation reply
    pub async fn handshake(
        &self,
        command: Command,
        endpoint: Addr,
        options: OptionSet,
        initial_data: &[u8],
    ) -> Result<(TcpStream, OperationReply)> {
        let mut stream = TcpStream::connect(self.server).await?;
        let mut request = Request::new(command, endpoint);
        request.options = options;

        let initial_len = u16::try_from(initial_data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "initial data longer than 65535 bytes")
        })?;

        // Session or authentication options
        let mut driver = None;
        let resumed = self.session_options(&mut request.options);
        if !resumed {
            let mut methods = Vec::new();
            if let Some(method) = &self.auth {
                let (started, data) = ClientAuthDriver::start(Arc::clone(method)).await;
                methods.push(method.id());
                if !data.is_empty() {
                    request.options.add_data(OptionData::AuthData {
                        method: method.id(),
                        data,
                    });
                }
                driver = Some(started);
            }
            if !methods.is_empty() || initial_len > 0 {
                request.options.add_data(OptionData::AuthMethodAdvertisement {
                    initial_data_len: initial_len,
                    methods,
                });
            }
            if self.config.use_session {
                request.options.add_data(OptionData::SessionRequest);
                if self.config.use_token {
                    request
                        .options
                        .add_data(OptionData::TokenRequest(self.config.token_window));
                }
            }
        } else if initial_len > 0 {
            request.options.add_data(OptionData::AuthMethodAdvertisement {
                initial_data_len: initial_len,
                methods: Vec::new(),
            });
        }

        // Request and initial data leave in one write
        let mut wire = request.marshal();
        wire.extend_from_slice(initial_data);
        stream.write_all(&wire).await?;

        // Authentication replies
        let mut reply = AuthenticationReply::read_from(&mut stream).await?;
        if let Some(mut driver) = driver {
            match driver.first_reply(&reply).await {
                Some(stage2) => {
                    stream.write_all(&stage2).await?;
                    reply = AuthenticationReply::read_from(&mut stream).await?;
                    driver.finish(Some(&reply)).await?;
                }
                None => driver.finish(None).await?,
            }
        }
        self.absorb_auth_reply(&reply)?;

        // Operation reply
        let reply = OperationReply::read_from(&mut stream).await?;
        if reply.code != ReplyCode::Success {
            return Err(Error::OperationFailed(reply.code));
        }
        Ok((stream, reply))
    }

    /// session_options adds the session id and an idempotence token when a
    /// session is live, and reports whether it did
    fn session_options(&self, options: &mut OptionSet) -> bool {
        if !self.config.use_session {
            return false;
        }
        let mut state = self.state.lock();
        let Some(id) = state.session_id.clone() else {
            return false;
        };
        options.add_data(OptionData::SessionId(id));
        if self.config.use_token {
            if let Some(token) = state.spend_token() {
                options.add_data(OptionData::IdempotenceExpenditure(token));
            }
            if state.remaining() < self.config.token_window / 8 {
                options.add_data(OptionData::TokenRequest(self.config.token_window));
            }
        }
        true
    }

    /// absorb_auth_reply records the session state granted by the server
    /// and turns a failed reply into the matching error
    fn absorb_auth_reply(&self, reply: &AuthenticationReply) -> Result<()> {
        let mut state = self.state.lock();
        if !reply.success() {
            if reply.options.has(kind::SESSION_INVALID) {
                state.clear();
                return Err(Error::SessionInvalid);
            }
            if reply.options.has(kind::IDEMPOTENCE_REJECTED) {
                return Err(Error::IdempotenceRejected);
            }
            let method = reply.options.method_selection().unwrap_or(0xff);
            return Err(Error::AuthenticationFailed(method));
        }
        if let Some(id) = reply.options.session_id() {
            state.session_id = Some(id.to_vec());
        }
        if let Some((base, size)) = reply.options.idempotence_window() {
            state.set_window(base, size);
        }
        Ok(())
    }

    /// noop checks that the server accepts us
    pub async fn noop(&self) -> Result<OperationReply> {
        let (_, reply) = self
            .handshake(Command::Noop, Addr::unspecified(), OptionSet::new(), &[])
            .await?;
        Ok(reply)
    }

    pub async fn connect(&self, endpoint: &Addr) -> Result<TcpStream> {
        self.connect_with_data(endpoint, &[]).await
    }

    /// connect_with_data sends `data` to the destination as part of the
    /// request
    pub async fn connect_with_data(&self, endpoint: &Addr, data: &[u8]) -> Result<TcpStream> {
        let (stream, _) = self
            .handshake(Command::Connect, endpoint.clone(), OptionSet::new(), data)
            .await?;
        Ok(stream)
    }

    /// bind asks the server to accept one inbound connection
    pub async fn bind(&self, endpoint: &Addr) -> Result<BindHandle> {
        let (stream, reply) = self
            .handshake(Command::Bind, endpoint.clone(), OptionSet::new(), &[])
            .await?;
        Ok(BindHandle {
            stream,
            bound: reply.endpoint,
        })
    }

    /// bind_backlog asks the server to queue up to `backlog` inbound
    /// connections; it needs a session
    pub async fn bind_backlog(&self, endpoint: &Addr, backlog: u16) -> Result<BacklogHandle> {
        let mut options = OptionSet::new();
        options.add(StackOption::new(true, false, StackOptionData::Backlog(backlog)).into_option());
        let (control, reply) = self
            .handshake(Command::Bind, endpoint.clone(), options, &[])
            .await?;
        let accepted = reply.options.iter().any(|o| match &o.data {
            OptionData::Stack(s) => s.remote_leg && matches!(s.get_data(), StackOptionData::Backlog(_)),
            _ => false,
        });
        if !accepted {
            return Err(Error::UnexpectedMessage(
                "server did not grant a backlog".to_string(),
            ));
        }
        Ok(BacklogHandle {
            client: self.clone(),
            control,
            bound: reply.endpoint,
        })
    }

    /// udp_associate opens a UDP association, on the datagram channel
    /// unless the configuration or the network forces UDP-over-TCP
    pub async fn udp_associate(&self, endpoint: &Addr, options: OptionSet) -> Result<UdpAssoc> {
        let (control, reply) = self
            .handshake(Command::UdpAssociate, endpoint.clone(), options, &[])
            .await?;
        let (mut control_read, mut control_write) = control.into_split();
        let assoc_id = match UdpMessage::read_from(&mut control_read).await? {
            UdpMessage::AssocInit { assoc_id } => assoc_id,
            other => {
                return Err(Error::UnexpectedMessage(format!(
                    "expected AssocInit, got {other:?}"
                )));
            }
        };

        let socket = if self.config.udp_over_tcp {
            None
        } else {
            self.ack_datagram_channel(assoc_id).await
        };
        if socket.is_none() {
            // DEBUG
            debug!("association {assoc_id:#x} over TCP");
            control_write
                .write_all(&UdpMessage::AssocAck { assoc_id }.marshal())
                .await?;
        }

        // Control stream reader
        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            loop {
                match UdpMessage::read_from(&mut control_read).await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("association control stream closed: {e}");
                        return;
                    }
                }
            }
        });

        Ok(UdpAssoc {
            assoc_id,
            bound: reply.endpoint,
            options: reply.options,
            socket,
            control: tokio::sync::Mutex::new(control_write),
            incoming: tokio::sync::Mutex::new(rx),
            reader,
        })
    }

    /// ack_datagram_channel acknowledges the association on the server's
    /// UDP port and waits for it to answer with AssocInit
    async fn ack_datagram_channel(&self, assoc_id: u64) -> Option<UdpSocket> {
        let local = if self.server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = match UdpSocket::bind(local).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("no local UDP socket: {e}");
                return None;
            }
        };
        if let Err(e) = socket.connect(self.server).await {
            warn!("cannot reach datagram channel {}: {e}", self.server);
            return None;
        }

        let ack = UdpMessage::AssocAck { assoc_id }.marshal();
        let mut buf = vec![0u8; MAX_DGRAM];
        for _ in 0..ASSOC_ACK_ATTEMPTS {
            if socket.send(&ack).await.is_err() {
                return None;
            }
            let Ok(Ok(len)) = timeout(ASSOC_ACK_TIMEOUT, socket.recv(&mut buf)).await else {
                continue;
            };
            if let Ok(UdpMessage::AssocInit { assoc_id: id }) = UdpMessage::parse(&buf[..len]) {
                if id == assoc_id {
                    return Some(socket);
                }
            }
        }
        None
    }

    /// teardown_session ends the client's session on the server
    pub async fn teardown_session(&self) -> Result<()> {
        if self.session_id().is_none() {
            return Ok(());
        }
        let mut options = OptionSet::new();
        options.add_data(OptionData::SessionTeardown);
        let result = self
            .handshake(Command::Noop, Addr::unspecified(), options, &[])
            .await;
        self.state.lock().clear();
        result.map(|_| ())
    }
}

/// BindHandle waits for the single connection of a BIND
pub struct BindHandle {
    stream: TcpStream,
    bound: Addr,
}

impl BindHandle {
    /// bound_addr is the address the server listens on
    pub fn bound_addr(&self) -> &Addr {
        &self.bound
    }

    /// accept waits for the second operation reply and returns the stream
    /// together with the remote peer
    pub async fn accept(mut self) -> Result<(TcpStream, Addr)> {
        let reply = OperationReply::read_from(&mut self.stream).await?;
        if reply.code != ReplyCode::Success {
            return Err(Error::OperationFailed(reply.code));
        }
        Ok((self.stream, reply.endpoint))
    }
}

/// BacklogHandle accepts connections queued by a backlog BIND
pub struct BacklogHandle {
    client: Client,
    control: TcpStream,
    bound: Addr,
}

impl BacklogHandle {
    pub fn bound_addr(&self) -> &Addr {
        &self.bound
    }

    /// accept waits for the next announced connection and claims it over a
    /// fresh worker stream
    pub async fn accept(&mut self) -> Result<(TcpStream, Addr)> {
        let announced = OperationReply::read_from(&mut self.control).await?;
        if announced.code != ReplyCode::Success {
            return Err(Error::OperationFailed(announced.code));
        }
        let (stream, reply) = self
            .client
            .handshake(Command::Bind, self.bound.clone(), OptionSet::new(), &[])
            .await?;
        Ok((stream, reply.endpoint))
    }
}

/// UdpAssoc is the client end of a UDP association
pub struct UdpAssoc {
    assoc_id: u64,
    bound: Addr,
    options: OptionSet,
    /// socket is connected to the server's datagram channel; None means
    /// UDP-over-TCP
    socket: Option<UdpSocket>,
    control: tokio::sync::Mutex<OwnedWriteHalf>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<UdpMessage>>,
    reader: JoinHandle<()>,
}

impl UdpAssoc {
    pub fn assoc_id(&self) -> u64 {
        self.assoc_id
    }

    /// bound_addr is the server's outbound packet address
    pub fn bound_addr(&self) -> &Addr {
        &self.bound
    }

    /// reply_options are the options of the operation reply
    pub fn reply_options(&self) -> &OptionSet {
        &self.options
    }

    pub fn is_udp_over_tcp(&self) -> bool {
        self.socket.is_none()
    }

    pub async fn send_to(&self, data: &[u8], endpoint: &Addr) -> Result<()> {
        let msg = UdpMessage::Datagram {
            assoc_id: self.assoc_id,
            endpoint: endpoint.clone(),
            data: data.to_vec(),
        }
        .marshal();
        match &self.socket {
            Some(socket) => {
                socket.send(&msg).await?;
            }
            None => self.control.lock().await.write_all(&msg).await?,
        }
        Ok(())
    }

    /// recv_message returns the next message of this association from
    /// either transport
    pub async fn recv_message(&self) -> Result<UdpMessage> {
        let mut incoming = self.incoming.lock().await;
        let mut buf = vec![0u8; MAX_DGRAM];
        loop {
            let msg = match &self.socket {
                Some(socket) => tokio::select! {
                    msg = incoming.recv() => msg.ok_or_else(closed)?,
                    len = socket.recv(&mut buf) => UdpMessage::parse(&buf[..len?])?,
                },
                None => incoming.recv().await.ok_or_else(closed)?,
            };
            if msg.assoc_id() == self.assoc_id {
                return Ok(msg);
            }
            debug!("dropping message for association {:#x}", msg.assoc_id());
        }
    }

    /// recv_from copies the next datagram into `buf`; ICMP reports relayed
    /// by the server come back as errors
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Addr)> {
        loop {
            match self.recv_message().await? {
                UdpMessage::Datagram { endpoint, data, .. } => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    return Ok((len, endpoint));
                }
                UdpMessage::Error {
                    endpoint, code, reporter, ..
                } => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::HostUnreachable,
                        format!("{code:?} sending to {endpoint}, reported by {reporter}"),
                    )));
                }
                // repeated AssocInit from a retried ack
                _ => continue,
            }
        }
    }
}

impl Drop for UdpAssoc {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn closed() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "association closed by server",
    ))
}
