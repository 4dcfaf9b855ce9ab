//! BIND with a backlog
//!
//! The primary stream stays open as a control channel: one success reply
//! is written to it for every queued inbound connection. The client then
//! opens a worker stream per connection (same session, same BIND address)
//! and each worker stream is paired with the oldest queued connection.

use crate::{
    address::Addr,
    commands::relay,
    messages::OperationReply,
    option_set::OptionSet,
    protocol::ReplyCode,
    server::{ServerWorker, SocksConn},
};
use anyhow::{Result, anyhow};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, Semaphore, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Queued = (TcpStream, SocketAddr);

/// BacklogListener owns the queue of accepted-but-unclaimed connections
pub struct BacklogListener {
    key: String,
    session_id: Vec<u8>,
    slots: Arc<Semaphore>,
    queue: Mutex<mpsc::Receiver<Queued>>,
    sender: parking_lot::Mutex<Option<mpsc::Sender<Queued>>>,
    alive: AtomicBool,
    cancel: CancellationToken,
}

/// BacklogListener implementation block
impl BacklogListener {
    /// new creates a listener admitting at most `backlog` unclaimed
    /// connections at a time
    pub fn new(key: String, session_id: Vec<u8>, backlog: u16, parent: &CancellationToken) -> Self {
        let backlog = backlog.max(1) as usize;
        let (sender, queue) = mpsc::channel(backlog);
        Self {
            key,
            session_id,
            slots: Arc::new(Semaphore::new(backlog)),
            queue: Mutex::new(queue),
            sender: parking_lot::Mutex::new(Some(sender)),
            alive: AtomicBool::new(true),
            cancel: parent.child_token(),
        }
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// run accepts inbound connections until the control stream closes
    pub async fn run(
        self: Arc<Self>,
        worker: Arc<ServerWorker>,
        listener: TcpListener,
        control: TcpStream,
    ) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .take()
            .ok_or_else(|| anyhow!("[ERR] backlog listener {} already running", self.key))?;
        let (mut control_read, control_write) = control.into_split();

        // Any read error or EOF on the control stream ends the listener
        let watch_control = async {
            let mut buf = [0u8; 64];
            loop {
                match control_read.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => debug!("ignoring data on backlog control stream {}", self.key),
                }
            }
        };

        let result = tokio::select! {
            res = self.accept_loop(&listener, control_write, sender) => res,
            _ = watch_control => Ok(()),
            _ = self.cancel.cancelled() => Ok(()),
        };

        // Tear down
        self.alive.store(false, Ordering::Release);
        self.cancel.cancel();
        worker.backlog_listeners.remove(&self.key);

        // DEBUG
        info!("backlog listener {} closed", self.key);
        result
    }

    /// accept_loop queues inbound connections, announcing each on the
    /// control stream
    async fn accept_loop(
        &self,
        listener: &TcpListener,
        mut control: OwnedWriteHalf,
        sender: mpsc::Sender<Queued>,
    ) -> Result<()> {
        loop {
            // A slot frees up when a worker stream claims a connection
            let permit = Arc::clone(&self.slots).acquire_owned().await?;
            let (inbound, peer) = listener.accept().await?;

            // DEBUG
            debug!("backlog {} queued {}", self.key, peer);

            OperationReply::new(ReplyCode::Success, Addr::from(peer))
                .write_to(&mut control)
                .await?;
            sender
                .send((inbound, peer))
                .await
                .map_err(|_| anyhow!("[ERR] backlog queue closed"))?;
            permit.forget();
        }
    }

    /// serve_worker_stream pairs a worker stream with the oldest queued
    /// connection and relays between them
    pub async fn serve_worker_stream(&self, worker: &ServerWorker, mut conn: SocksConn) -> Result<()> {
        let next = {
            let mut queue = self.queue.lock().await;
            tokio::select! {
                next = queue.recv() => next,
                _ = self.cancel.cancelled() => None,
                _ = conn.cancel.cancelled() => None,
            }
        };

        let Some((inbound, peer)) = next else {
            // TODO: decide whether a closed backlog queue should answer
            // ServerFailure or just close the worker stream
            if let Err(e) = conn.write_reply_code(ReplyCode::ServerFailure).await {
                warn!("failed to report closed backlog {}: {e}", self.key);
            }
            return Err(anyhow!("[ERR] backlog listener {} is gone", self.key));
        };
        self.slots.add_permits(1);

        conn.write_reply(ReplyCode::Success, Addr::from(peer), OptionSet::new())
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
