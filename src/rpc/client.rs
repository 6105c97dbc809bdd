use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cluster::link::PeerLink;
use crate::error::{GovernorError, Result};
use crate::rpc::codec;
use crate::rpc::messages::{
    AgentRequest, Channel, GovernorRequest, HandleLocksReply, HandleLocksRequest, Hello,
    JobEndRequest, Reply, ReplyFrame, RequestFrame,
};
use crate::state::locks::{LockRequest, ReleaseStatus};

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// One open connection with request/reply correlation.
///
/// Requests may be issued concurrently; the reader task routes each reply
/// frame to its caller by frame id. When the socket closes every waiting
/// caller is released with an error.
pub struct RpcConnection {
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: PendingReplies,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    closed: CancellationToken,
    reader_done: CancellationToken,
}

impl RpcConnection {
    /// Dial `addr`, send the hello for `channel` and wait for its ack.
    pub async fn open(
        addr: &str,
        channel: Channel,
        connected: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| GovernorError::PeerUnavailable(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        let mut framed = codec::framed(stream);

        codec::send(&mut framed, &Hello { channel }).await?;
        match codec::recv::<ReplyFrame>(&mut framed).await? {
            Some(ReplyFrame {
                body: Reply::Ack, ..
            }) => {}
            Some(other) => {
                return Err(GovernorError::UnexpectedReply(format!(
                    "hello answered with {}",
                    other.body.kind()
                )))
            }
            None => {
                return Err(GovernorError::PeerUnavailable(format!(
                    "{addr} closed during hello"
                )))
            }
        }

        let (mut sink, mut stream) = framed.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = shutdown.child_token();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(frame).await {
                            tracing::debug!(error = %e, "Write failed, closing connection");
                            writer_closed.cancel();
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = pending.clone();
        let reader_connected = connected.clone();
        let reader_closed = closed.clone();
        let reader_done = CancellationToken::new();
        let done = reader_done.clone();
        let peer = addr.to_string();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = stream.next() => frame,
                };
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %peer, error = %e, "Read failed");
                        break;
                    }
                    None => break,
                };
                match codec::decode::<ReplyFrame>(&frame) {
                    Ok(reply) => {
                        if let Some(tx) = reader_pending.lock().await.remove(&reply.id) {
                            let _ = tx.send(reply.body);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Dropping undecodable reply");
                    }
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            reader_closed.cancel();
            reader_pending.lock().await.clear();
            tracing::debug!(peer = %peer, "Connection closed");
            done.cancel();
        });

        connected.store(true, Ordering::SeqCst);

        Ok(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            closed,
            reader_done,
        })
    }

    pub fn is_open(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    /// Send `body` and wait for the matching reply.
    pub async fn call<T: Serialize>(&self, body: T) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = codec::encode(&RequestFrame { id, body })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        // The reader clears `pending` only after marking the link down, so a
        // registration that raced with the close is caught here.
        if !self.is_open() || self.outbound.send(frame).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(GovernorError::NotConnected("connection closed".to_string()));
        }

        rx.await
            .map_err(|_| GovernorError::PeerUnavailable("connection closed before reply".to_string()))
    }

    pub fn close(&self) {
        self.closed.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Close and wait until the reader task has let go of the shared flag.
    async fn shut(&self) {
        self.close();
        self.reader_done.cancelled().await;
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Outbound link to a peer governor over TCP.
pub struct TcpPeerClient {
    addr: String,
    connected: Arc<AtomicBool>,
    conn: Mutex<Option<Arc<RpcConnection>>>,
    shutdown: CancellationToken,
}

impl TcpPeerClient {
    pub fn new(addr: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            addr: addr.into(),
            connected: Arc::new(AtomicBool::new(false)),
            conn: Mutex::new(None),
            shutdown,
        }
    }
}

#[async_trait]
impl PeerLink for TcpPeerClient {
    fn addr(&self) -> &str {
        &self.addr
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_connected(&self) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        if conn.as_ref().is_some_and(|c| c.is_open()) {
            return Ok(false);
        }
        if let Some(stale) = conn.take() {
            stale.shut().await;
        }
        if self.shutdown.is_cancelled() {
            return Err(GovernorError::NotConnected(self.addr.clone()));
        }

        let opened = RpcConnection::open(
            &self.addr,
            Channel::Governor,
            self.connected.clone(),
            self.shutdown.clone(),
        )
        .await?;
        *conn = Some(Arc::new(opened));
        tracing::info!(peer = %self.addr, "Connected to peer");
        Ok(true)
    }

    async fn call(&self, request: GovernorRequest) -> Result<Reply> {
        let conn = self
            .conn
            .lock()
            .await
            .clone()
            .filter(|c| c.is_open())
            .ok_or_else(|| GovernorError::NotConnected(self.addr.clone()))?;

        tracing::trace!(peer = %self.addr, request = request.kind(), "Sending request");
        conn.call(request).await
    }
}

/// Client side of the agent channel.
pub struct AgentClient {
    agent_name: String,
    conn: RpcConnection,
}

impl AgentClient {
    /// Connect to the governor at `addr` and identify as `agent_name`.
    pub async fn connect(addr: &str, agent_name: impl Into<String>) -> Result<Self> {
        let conn = RpcConnection::open(
            addr,
            Channel::Agent,
            Arc::new(AtomicBool::new(false)),
            CancellationToken::new(),
        )
        .await?;
        let client = Self {
            agent_name: agent_name.into(),
            conn,
        };
        client.identify().await?;
        Ok(client)
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn request(&self, request: AgentRequest) -> Result<Reply> {
        self.conn.call(request).await?.into_result()
    }

    pub async fn identify(&self) -> Result<()> {
        match self
            .request(AgentRequest::Identify {
                agent_name: self.agent_name.clone(),
            })
            .await?
        {
            Reply::Ack => Ok(()),
            other => Err(unexpected("identify", &other)),
        }
    }

    pub async fn handle_locks(
        &self,
        job_type: &str,
        lock_data: Vec<LockRequest>,
    ) -> Result<HandleLocksReply> {
        self.handle_locks_with(HandleLocksRequest {
            agent_name: self.agent_name.clone(),
            job_type: job_type.to_string(),
            lock_data,
            date: None,
            max_age_ms: None,
        })
        .await
    }

    pub async fn handle_locks_with(&self, request: HandleLocksRequest) -> Result<HandleLocksReply> {
        match self.request(AgentRequest::HandleLocks(request)).await? {
            Reply::Locks(reply) => Ok(reply),
            other => Err(unexpected("handle-locks", &other)),
        }
    }

    pub async fn register_job(&self, job_type: &str) -> Result<()> {
        match self
            .request(AgentRequest::RegisterJob {
                job_type: job_type.to_string(),
                agent_name: self.agent_name.clone(),
            })
            .await?
        {
            Reply::Ack => Ok(()),
            other => Err(unexpected("register-job", &other)),
        }
    }

    /// End a job. Passing `None` releases the keys the job was started with.
    pub async fn job_end(
        &self,
        id: Uuid,
        lock_data: Option<Vec<LockRequest>>,
    ) -> Result<ReleaseStatus> {
        match self
            .request(AgentRequest::JobEnd(JobEndRequest {
                id,
                date: None,
                lock_data,
            }))
            .await?
        {
            Reply::Released(status) => Ok(status),
            other => Err(unexpected("job-end", &other)),
        }
    }

    /// Close the connection. The governor treats this as the agent leaving.
    pub fn close(self) {
        self.conn.close();
    }
}

fn unexpected(request: &str, reply: &Reply) -> GovernorError {
    GovernorError::UnexpectedReply(format!("{request} answered with {}", reply.kind()))
}
