//! Authentication methods and the two-stage authentication driver
//!
//! A server method runs on its own task that owns the read half of the
//! client stream for as long as the method lives. The worker talks to it
//! through channels: up to two results come back (stage 1 and, when the
//! method asks to resume, stage 2) and one resume signal goes in.

use crate::error::{Error, Result};
use crate::messages::AuthenticationReply;
use crate::option_set::OptionSet;
use crate::options::OptionData;
use crate::protocol::AuthMethod;
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

/// FAKE_ECHO_METHOD is a private method id used to exercise the
/// interactive path
pub const FAKE_ECHO_METHOD: u8 = 0xfe;

const RESULT_CHANNEL_CAPACITY: usize = 2;

/// UserPass holds username/password credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl UserPass {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    // Username/Password request (RFC 1929)
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    /// encode produces the RFC 1929 request carried as method data.
    /// Longer fields are cut at 255 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let user = &self.username.as_bytes()[..self.username.len().min(255)];
        let pass = &self.password.as_bytes()[..self.password.len().min(255)];
        let mut buf = Vec::with_capacity(3 + user.len() + pass.len());
        buf.push(0x01);
        buf.push(user.len() as u8);
        buf.extend_from_slice(user);
        buf.push(pass.len() as u8);
        buf.extend_from_slice(pass);
        buf
    }

    /// decode parses an RFC 1929 request, returning None when malformed
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&version, mut rest) = data.split_first()?;
        if version != 0x01 {
            return None;
        }
        let username = take_field(&mut rest)?;
        let password = take_field(&mut rest)?;
        Some(Self { username, password })
    }
}

fn take_field(data: &mut &[u8]) -> Option<String> {
    let buf: &[u8] = *data;
    let (&len, rest) = buf.split_first()?;
    let value = rest.get(..len as usize)?;
    *data = &rest[len as usize..];
    String::from_utf8(value.to_vec()).ok()
}

/// MethodResult is what a server method reports after each stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodResult {
    pub success: bool,
    /// resume asks for a second stage; only meaningful when success is false
    pub resume: bool,
    /// data is returned to the client as method data
    pub data: Option<Vec<u8>>,
}

impl MethodResult {
    pub fn success(data: Option<Vec<u8>>) -> Self {
        Self {
            success: true,
            resume: false,
            data,
        }
    }

    pub fn failure(data: Option<Vec<u8>>) -> Self {
        Self {
            success: false,
            resume: false,
            data,
        }
    }
}

/// ServerAuthChannels connects a running method to the worker
#[derive(Debug)]
pub struct ServerAuthChannels {
    pub result: mpsc::Sender<MethodResult>,
    pub resume: oneshot::Receiver<bool>,
}

impl ServerAuthChannels {
    /// report sends one stage result
    pub async fn report(&self, result: MethodResult) -> anyhow::Result<()> {
        self.result
            .send(result)
            .await
            .map_err(|_| anyhow!("[ERR] authenticator went away"))
    }

    /// wait_resume waits for the worker's verdict on a second stage. A
    /// dropped worker counts as no.
    pub async fn wait_resume(self) -> (mpsc::Sender<MethodResult>, bool) {
        let resume = self.resume.await.unwrap_or(false);
        (self.result, resume)
    }
}

/// ServerAuthMethod is one server-side authentication method
#[async_trait]
pub trait ServerAuthMethod: Send + Sync {
    fn id(&self) -> u8;

    /// authenticate runs both stages. `client_data` is the method data
    /// from the request; `conn` yields any bytes the client sends after
    /// a first-stage reply.
    async fn authenticate(
        &self,
        conn: &mut (dyn AsyncRead + Send + Unpin),
        client_data: &[u8],
        channels: ServerAuthChannels,
    ) -> anyhow::Result<()>;
}

/// NoneMethod always succeeds
#[derive(Debug, Default)]
pub struct NoneMethod;

#[async_trait]
impl ServerAuthMethod for NoneMethod {
    fn id(&self) -> u8 {
        AuthMethod::NoAuth as u8
    }

    async fn authenticate(
        &self,
        _conn: &mut (dyn AsyncRead + Send + Unpin),
        _client_data: &[u8],
        channels: ServerAuthChannels,
    ) -> anyhow::Result<()> {
        channels.report(MethodResult::success(None)).await
    }
}

/// PasswordAuth checks RFC 1929 credentials against a user table
#[derive(Debug, Default)]
pub struct PasswordAuth {
    users: HashMap<String, String>,
}

impl PasswordAuth {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn single(creds: &UserPass) -> Self {
        let mut users = HashMap::new();
        users.insert(creds.username.clone(), creds.password.clone());
        Self { users }
    }

    fn check(&self, client_data: &[u8]) -> bool {
        match UserPass::decode(client_data) {
            Some(creds) => self.users.get(&creds.username) == Some(&creds.password),
            None => false,
        }
    }
}

#[async_trait]
impl ServerAuthMethod for PasswordAuth {
    fn id(&self) -> u8 {
        AuthMethod::UserPass as u8
    }

    async fn authenticate(
        &self,
        _conn: &mut (dyn AsyncRead + Send + Unpin),
        client_data: &[u8],
        channels: ServerAuthChannels,
    ) -> anyhow::Result<()> {
        // Username/Password server response
        // +----+--------+
        // |VER | STATUS |
        // +----+--------+
        // | 1  |   1    |
        // +----+--------+
        let ok = self.check(client_data);
        let data = Some(vec![0x01, if ok { 0x00 } else { 0x01 }]);
        let result = if ok {
            MethodResult::success(data)
        } else {
            MethodResult::failure(data)
        };
        channels.report(result).await
    }
}

/// FakeEchoMethod is an interactive two-stage method. Stage 1 echoes the
/// client's `[len, bytes]` data and asks to resume; stage 2 succeeds when
/// the client sends the same `[len, bytes]` on the stream.
#[derive(Debug, Default)]
pub struct FakeEchoMethod;

#[async_trait]
impl ServerAuthMethod for FakeEchoMethod {
    fn id(&self) -> u8 {
        FAKE_ECHO_METHOD
    }

    async fn authenticate(
        &self,
        conn: &mut (dyn AsyncRead + Send + Unpin),
        client_data: &[u8],
        channels: ServerAuthChannels,
    ) -> anyhow::Result<()> {
        if client_data.is_empty() || client_data.len() != 1 + client_data[0] as usize {
            return channels.report(MethodResult::failure(None)).await;
        }
        channels
            .report(MethodResult {
                success: false,
                resume: true,
                data: Some(client_data.to_vec()),
            })
            .await?;

        let (result, resume) = channels.wait_resume().await;
        if !resume {
            return Ok(());
        }
        let len = conn.read_u8().await?;
        let mut echo = vec![0u8; len as usize];
        conn.read_exact(&mut echo).await?;
        let ok = echo == client_data[1..];
        result
            .send(MethodResult {
                success: ok,
                resume: false,
                data: None,
            })
            .await
            .map_err(|_| anyhow!("[ERR] authenticator went away"))
    }
}

/// AuthResult is the authenticator's verdict for one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub selected: u8,
    pub success: bool,
    pub resume: bool,
    pub method_data: Option<Vec<u8>>,
}

impl AuthResult {
    fn rejected(selected: u8) -> Self {
        Self {
            selected,
            success: false,
            resume: false,
            method_data: None,
        }
    }

    /// reply_options builds the options of the authentication reply
    /// that reports this result
    pub fn reply_options(&self) -> OptionSet {
        let mut options = OptionSet::new();
        if self.selected != AuthMethod::NoAuth as u8 && self.selected != AuthMethod::NoAcceptable as u8
        {
            options.add_data(OptionData::AuthMethodSelection(self.selected));
        }
        if let Some(data) = &self.method_data {
            options.add_data(OptionData::AuthData {
                method: self.selected,
                data: data.clone(),
            });
        }
        options
    }
}

/// MethodTask is a running server method; dropping it aborts the method
/// and releases the stream half it holds
type MethodTask<R> = AbortOnDropHandle<(anyhow::Result<()>, R)>;

/// AuthStage is the outcome of the first authentication stage
pub enum AuthStage<R> {
    Complete { result: AuthResult, conn: R },
    NeedStage2 { first: AuthResult, pending: PendingAuth<R> },
}

/// PendingAuth is a method parked between its two stages
pub struct PendingAuth<R> {
    selected: u8,
    results: mpsc::Receiver<MethodResult>,
    resume: oneshot::Sender<bool>,
    task: MethodTask<R>,
}

impl<R> PendingAuth<R> {
    /// continue_authenticate lets the method run its second stage and
    /// returns the final verdict together with the stream
    pub async fn continue_authenticate(mut self) -> anyhow::Result<(AuthResult, R)> {
        let _ = self.resume.send(true);
        let second = self.results.recv().await;
        let (outcome, conn) = self.task.await?;
        if let Err(e) = outcome {
            warn!("authentication method {} failed: {e}", self.selected);
        }
        let result = match second {
            Some(r) => AuthResult {
                selected: self.selected,
                success: r.success,
                resume: false,
                method_data: r.data,
            },
            None => AuthResult::rejected(self.selected),
        };
        Ok((result, conn))
    }
}

/// ServerAuthenticator picks and runs the methods a client advertises
#[derive(Clone, Default)]
pub struct ServerAuthenticator {
    methods: HashMap<u8, Arc<dyn ServerAuthMethod>>,
}

impl ServerAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// with_no_auth returns an authenticator accepting everyone
    pub fn with_no_auth() -> Self {
        let mut auth = Self::new();
        auth.add_method(Arc::new(NoneMethod));
        auth
    }

    pub fn add_method(&mut self, method: Arc<dyn ServerAuthMethod>) {
        self.methods.insert(method.id(), method);
    }

    pub fn remove_method(&mut self, id: u8) {
        self.methods.remove(&id);
    }

    pub fn has_method(&self, id: u8) -> bool {
        self.methods.contains_key(&id)
    }

    /// authenticate runs the first stage. Methods are tried in advertised
    /// order with method 0 always first.
    pub async fn authenticate<R>(&self, conn: R, options: &OptionSet) -> anyhow::Result<AuthStage<R>>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut order = vec![AuthMethod::NoAuth as u8];
        if let Some((methods, _)) = options.advertisement() {
            order.extend(methods.iter().copied().filter(|&m| m != 0));
        }

        let mut conn = conn;
        let mut selected = AuthMethod::NoAcceptable as u8;
        for id in order {
            let Some(method) = self.methods.get(&id) else {
                continue;
            };
            selected = id;
            let client_data = options.auth_data(id).map(<[u8]>::to_vec).unwrap_or_default();

            let (result_tx, mut results) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
            let (resume, resume_rx) = oneshot::channel();
            let channels = ServerAuthChannels {
                result: result_tx,
                resume: resume_rx,
            };
            let method = Arc::clone(method);
            let task: MethodTask<R> = AbortOnDropHandle::new(tokio::spawn(async move {
                let mut conn = conn;
                let outcome = method.authenticate(&mut conn, &client_data, channels).await;
                (outcome, conn)
            }));

            match results.recv().await {
                Some(first) if first.success => {
                    let _ = resume.send(false);
                    let (outcome, back) = task.await?;
                    if let Err(e) = outcome {
                        warn!("authentication method {id} failed after success: {e}");
                    }
                    debug!("authenticated with method {id}");
                    return Ok(AuthStage::Complete {
                        result: AuthResult {
                            selected: id,
                            success: true,
                            resume: false,
                            method_data: first.data,
                        },
                        conn: back,
                    });
                }
                Some(first) if first.resume => {
                    return Ok(AuthStage::NeedStage2 {
                        first: AuthResult {
                            selected: id,
                            success: false,
                            resume: true,
                            method_data: first.data,
                        },
                        pending: PendingAuth {
                            selected: id,
                            results,
                            resume,
                            task,
                        },
                    });
                }
                _ => {
                    let _ = resume.send(false);
                    let (outcome, back) = task.await?;
                    if let Err(e) = outcome {
                        warn!("authentication method {id} failed: {e}");
                    }
                    debug!("method {id} rejected the client");
                    conn = back;
                }
            }
        }

        Ok(AuthStage::Complete {
            result: AuthResult::rejected(selected),
            conn,
        })
    }
}

/// ClientAuthChannels connects a client method to the handshake driver.
/// The first value sent on `data` is the stage-1 method data (empty for
/// none); a later value is written to the stream as stage-2 data.
#[derive(Debug)]
pub struct ClientAuthChannels {
    pub data: mpsc::Sender<Vec<u8>>,
    pub first_reply: oneshot::Receiver<AuthenticationReply>,
    pub final_reply: oneshot::Receiver<AuthenticationReply>,
}

/// ClientAuthMethod is one client-side authentication method
#[async_trait]
pub trait ClientAuthMethod: Send + Sync {
    fn id(&self) -> u8;

    async fn authenticate(&self, channels: ClientAuthChannels) -> Result<()>;
}

/// PasswordClient sends RFC 1929 credentials
#[derive(Debug, Clone)]
pub struct PasswordClient {
    pub creds: UserPass,
}

impl PasswordClient {
    pub fn new(creds: UserPass) -> Self {
        Self { creds }
    }
}

#[async_trait]
impl ClientAuthMethod for PasswordClient {
    fn id(&self) -> u8 {
        AuthMethod::UserPass as u8
    }

    async fn authenticate(&self, channels: ClientAuthChannels) -> Result<()> {
        let ClientAuthChannels {
            data, first_reply, ..
        } = channels;
        let _ = data.send(self.creds.encode()).await;
        drop(data);
        match first_reply.await {
            Ok(reply) if reply.success() => Ok(()),
            Ok(_) => Err(Error::AuthenticationFailed(self.id())),
            Err(_) => Ok(()),
        }
    }
}

/// FakeEchoClient drives the interactive method with a fixed token
#[derive(Debug, Clone)]
pub struct FakeEchoClient {
    pub token: Vec<u8>,
}

impl FakeEchoClient {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        let mut token = token.into();
        token.truncate(255);
        Self { token }
    }

    fn framed(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.token.len());
        buf.push(self.token.len() as u8);
        buf.extend_from_slice(&self.token);
        buf
    }
}

#[async_trait]
impl ClientAuthMethod for FakeEchoClient {
    fn id(&self) -> u8 {
        FAKE_ECHO_METHOD
    }

    async fn authenticate(&self, channels: ClientAuthChannels) -> Result<()> {
        let ClientAuthChannels {
            data,
            first_reply,
            final_reply,
        } = channels;
        let _ = data.send(self.framed()).await;
        let Ok(first) = first_reply.await else {
            return Ok(());
        };
        if first.success() {
            return Ok(());
        }
        // the server echoes our data back before asking for stage 2
        if first.options.auth_data(FAKE_ECHO_METHOD) != Some(self.framed().as_slice()) {
            return Err(Error::AuthenticationFailed(FAKE_ECHO_METHOD));
        }
        let _ = data.send(self.framed()).await;
        drop(data);
        match final_reply.await {
            Ok(reply) if reply.success() => Ok(()),
            _ => Err(Error::AuthenticationFailed(FAKE_ECHO_METHOD)),
        }
    }
}

/// ClientAuthDriver runs a client method alongside the handshake
pub struct ClientAuthDriver {
    data: mpsc::Receiver<Vec<u8>>,
    first_reply: Option<oneshot::Sender<AuthenticationReply>>,
    final_reply: Option<oneshot::Sender<AuthenticationReply>>,
    task: JoinHandle<Result<()>>,
}

impl ClientAuthDriver {
    /// start spawns the method and waits for its stage-1 data
    pub async fn start(method: Arc<dyn ClientAuthMethod>) -> (Self, Vec<u8>) {
        let (data_tx, mut data) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let (first_tx, first_rx) = oneshot::channel();
        let (final_tx, final_rx) = oneshot::channel();
        let channels = ClientAuthChannels {
            data: data_tx,
            first_reply: first_rx,
            final_reply: final_rx,
        };
        let task = tokio::spawn(async move { method.authenticate(channels).await });
        let initial = data.recv().await.unwrap_or_default();
        let driver = Self {
            data,
            first_reply: Some(first_tx),
            final_reply: Some(final_tx),
            task,
        };
        (driver, initial)
    }

    /// first_reply hands the first authentication reply to the method and
    /// returns stage-2 data when the method wants another round
    pub async fn first_reply(&mut self, reply: &AuthenticationReply) -> Option<Vec<u8>> {
        if let Some(tx) = self.first_reply.take() {
            let _ = tx.send(reply.clone());
        }
        if reply.success() {
            return None;
        }
        self.data.recv().await
    }

    /// finish delivers the final reply, if any, and collects the method's
    /// own verdict
    pub async fn finish(mut self, reply: Option<&AuthenticationReply>) -> Result<()> {
        if let (Some(tx), Some(reply)) = (self.final_reply.take(), reply) {
            let _ = tx.send(reply.clone());
        }
        drop(self.final_reply);
        drop(self.first_reply);
        match self.task.await {
            Ok(r) => r,
            Err(e) => Err(Error::Io(std::io::Error::other(e))),
        }
    }
}
