// Local control plane — the four operations a co-located client gets
//
// Connect opens a lossy server-to-client event stream fed from the
// node's broadcast bus: Ready first, then peer connections, verified
// inbound messages, and errors, in observation order. A slow client
// drops events rather than slowing the node; a disconnected client
// misses events outright (no replay).

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::{AgentNode, NodeError, NodeEvent};

pub mod proto {
    tonic::include_proto!("agentmesh.v1");
}

use proto::control_plane_server::{ControlPlane, ControlPlaneServer};
use proto::{
    p2p_event, AgentInfo, ConnectRequest, Error as ProtoError, InboundMessage as ProtoMessage,
    ListAgentsResponse, ListRequest, Message, P2pEvent, PeerConnected, Ready, SendResult,
    StopRequest, StopResponse,
};

/// Per-stream buffer between the broadcast bus and the gRPC writer.
const STREAM_BUFFER: usize = 64;

/// gRPC facade over a running node.
pub struct ControlService {
    node: Arc<AgentNode>,
}

impl ControlService {
    pub fn new(node: Arc<AgentNode>) -> Self {
        Self { node }
    }

    /// Wrap into the tonic server type for registration.
    pub fn into_server(self) -> ControlPlaneServer<ControlService> {
        ControlPlaneServer::new(self)
    }
}

fn to_proto_event(event: NodeEvent) -> P2pEvent {
    let inner = match event {
        NodeEvent::PeerConnected { peer_id } => {
            p2p_event::Event::PeerConnected(PeerConnected { peer_id })
        }
        NodeEvent::Message(message) => p2p_event::Event::Message(ProtoMessage {
            message_id: message.message_id,
            from: format!("{:#x}", message.from),
            to: format!("{:#x}", message.to),
            content: message.content,
            timestamp: message.timestamp as i64,
        }),
        NodeEvent::Error { code, message } => p2p_event::Event::Error(ProtoError { code, message }),
    };
    P2pEvent { event: Some(inner) }
}

fn to_status(error: NodeError) -> Status {
    match &error {
        NodeError::NoRoute(_) => Status::not_found(error.to_string()),
        NodeError::Encryption(_) => Status::failed_precondition(error.to_string()),
        NodeError::PublishFailed(_) => Status::unavailable(error.to_string()),
        NodeError::NotRunning => Status::failed_precondition(error.to_string()),
        _ => Status::internal(error.to_string()),
    }
}

#[tonic::async_trait]
impl ControlPlane for ControlService {
    type ConnectStream = Pin<Box<dyn Stream<Item = Result<P2pEvent, Status>> + Send + 'static>>;

    async fn connect(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let connect = request.into_inner();
        if !connect.private_key.is_empty() {
            // The node derived its identity at startup; a key supplied
            // over the control channel is accepted for wire
            // compatibility and otherwise ignored.
            tracing::warn!("Connect supplied a private key; using the node's own identity");
        }

        let peer_id = self
            .node
            .peer_id()
            .ok_or_else(|| Status::failed_precondition("node is not running"))?;
        let mut events = self.node.subscribe_events();

        let (tx, rx) = mpsc::channel::<Result<P2pEvent, Status>>(STREAM_BUFFER);

        tokio::spawn(async move {
            let ready = P2pEvent {
                event: Some(p2p_event::Event::Ready(Ready {
                    peer_id: peer_id.to_string(),
                })),
            };
            if tx.send(Ok(ready)).await.is_err() {
                return;
            }

            loop {
                match events.recv().await {
                    Ok(event) => {
                        match tx.try_send(Ok(to_proto_event(event))) {
                            Ok(()) => {}
                            // Lossy contract: one attempt, then drop.
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::debug!("Control stream full; dropping event");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!("Control stream lagged; {} events lost", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn send_message(&self, request: Request<Message>) -> Result<Response<SendResult>, Status> {
        let message = request.into_inner();
        let to = message
            .to
            .parse()
            .map_err(|_| Status::invalid_argument(format!("not an address: {}", message.to)))?;

        let message_id = self
            .node
            .send_message(to, message.content, None, None)
            .await
            .map_err(to_status)?;

        Ok(Response::new(SendResult { message_id }))
    }

    async fn stop(&self, _request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        tracing::info!("Stop requested over control plane");
        self.node.stop().await.map_err(to_status)?;
        Ok(Response::new(StopResponse {}))
    }

    async fn list_agents(
        &self,
        _request: Request<ListRequest>,
    ) -> Result<Response<ListAgentsResponse>, Status> {
        let agents = self
            .node
            .list_agents()
            .into_iter()
            .map(|entry| AgentInfo {
                agent_id: format!("{:#x}", entry.address),
                peer_id: entry.peer_id.to_string(),
                agent_name: entry.display_name.unwrap_or_default(),
                connected_since: entry.observed_at as i64,
            })
            .collect();

        Ok(Response::new(ListAgentsResponse { agents }))
    }
}

/// Serve the control plane until the node shuts down.
pub async fn serve(node: Arc<AgentNode>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let shutdown = {
        let node = node.clone();
        async move { node.wait_for_shutdown().await }
    };

    tracing::info!("Control plane listening on {}", addr);
    tonic::transport::Server::builder()
        .add_service(ControlService::new(node).into_server())
        .serve_with_shutdown(addr, shutdown)
        .await?;
    Ok(())
}
