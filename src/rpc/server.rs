use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{GovernorError, Result};
use crate::governor::Governor;
use crate::rpc::codec::{self, FramedStream};
use crate::rpc::messages::{
    AgentRequest, Channel, GovernorRequest, Hello, Reply, ReplyFrame, RequestFrame, HELLO_FRAME_ID,
};

/// Accept connections until `shutdown` fires. Each connection gets its own
/// task; requests on one connection are handled strictly in arrival order.
pub async fn serve(listener: TcpListener, governor: Arc<Governor>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let governor = governor.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, remote, governor, shutdown).await {
                            tracing::debug!(remote = %remote, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    governor: Arc<Governor>,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = codec::framed(stream);

    let hello: Hello = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        hello = codec::recv::<Hello>(&mut framed) => match hello? {
            Some(hello) => hello,
            None => return Ok(()),
        },
    };
    codec::send(
        &mut framed,
        &ReplyFrame {
            id: HELLO_FRAME_ID,
            body: Reply::Ack,
        },
    )
    .await?;
    tracing::debug!(remote = %remote, channel = %hello.channel, "Connection opened");

    match hello.channel {
        Channel::Governor => governor_session(framed, remote, governor, shutdown).await,
        Channel::Agent => agent_session(framed, remote, governor, shutdown).await,
    }
}

enum Incoming<T> {
    Request(RequestFrame<T>),
    /// Frame that could not be decoded; answered with an error if it had an id.
    Malformed(Option<u64>, GovernorError),
    Closed,
}

async fn next_request<T: DeserializeOwned>(
    framed: &mut FramedStream,
    shutdown: &CancellationToken,
) -> Incoming<T> {
    let frame = tokio::select! {
        _ = shutdown.cancelled() => return Incoming::Closed,
        frame = framed.next() => frame,
    };
    let frame = match frame {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => {
            tracing::debug!(error = %e, "Read failed");
            return Incoming::Closed;
        }
        None => return Incoming::Closed,
    };

    match codec::decode::<RequestFrame<T>>(&frame) {
        Ok(request) => Incoming::Request(request),
        Err(e) => {
            let id = serde_json::from_slice::<serde_json::Value>(&frame)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_u64()));
            Incoming::Malformed(id, e)
        }
    }
}

async fn reply(framed: &mut FramedStream, id: u64, body: Reply) -> Result<()> {
    codec::send(framed, &ReplyFrame { id, body }).await
}

async fn governor_session(
    mut framed: FramedStream,
    remote: SocketAddr,
    governor: Arc<Governor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut peer_name: Option<String> = None;

    let result = loop {
        match next_request::<GovernorRequest>(&mut framed, &shutdown).await {
            Incoming::Request(RequestFrame { id, body }) => {
                if let GovernorRequest::Identify(identity) = &body {
                    if peer_name.as_deref() != Some(identity.node_name.as_str()) {
                        tracing::info!(remote = %remote, node = %identity.node_name, "Peer identified");
                    }
                    peer_name = Some(identity.node_name.clone());
                }
                tracing::debug!(
                    remote = %remote,
                    node = peer_name.as_deref().unwrap_or("?"),
                    request = body.kind(),
                    "Peer request"
                );
                let body = governor.handle_peer_request(body).await;
                if let Err(e) = reply(&mut framed, id, body).await {
                    break Err(e);
                }
            }
            Incoming::Malformed(id, e) => {
                tracing::warn!(remote = %remote, error = %e, "Malformed peer request");
                if let Some(id) = id {
                    if let Err(e) = reply(&mut framed, id, Reply::error(&e)).await {
                        break Err(e);
                    }
                }
            }
            Incoming::Closed => break Ok(()),
        }
    };

    if !shutdown.is_cancelled() {
        governor.on_peer_disconnect(peer_name).await;
    }
    result
}

async fn agent_session(
    mut framed: FramedStream,
    remote: SocketAddr,
    governor: Arc<Governor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut agent_name: Option<String> = None;

    let result = loop {
        match next_request::<AgentRequest>(&mut framed, &shutdown).await {
            Incoming::Request(RequestFrame { id, body }) => {
                if let AgentRequest::Identify { agent_name: name } = &body {
                    tracing::info!(remote = %remote, agent = %name, "Agent identified");
                    agent_name = Some(name.clone());
                }
                let body = governor
                    .handle_agent_request(agent_name.as_deref(), body)
                    .await;
                if let Err(e) = reply(&mut framed, id, body).await {
                    break Err(e);
                }
            }
            Incoming::Malformed(id, e) => {
                tracing::warn!(remote = %remote, error = %e, "Malformed agent request");
                if let Some(id) = id {
                    if let Err(e) = reply(&mut framed, id, Reply::error(&e)).await {
                        break Err(e);
                    }
                }
            }
            Incoming::Closed => break Ok(()),
        }
    };

    if !shutdown.is_cancelled() {
        governor.on_agent_disconnect(agent_name).await;
    }
    result
}
