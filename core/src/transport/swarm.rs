// libp2p swarm task — command channel in, event channel out
//
// The swarm owns the transport stack. Everything else in the node
// talks to it through SwarmHandle: a command is a message on the
// channel, a reply comes back on a per-call channel. The event loop
// never blocks on anything but channel sends; all policy decisions
// (retries, timeouts, recipient filtering) live with the callers.

use std::collections::HashMap;

use anyhow::Result;
use libp2p::swarm::SwarmEvent;
use libp2p::{gossipsub, identify, kad, Multiaddr, PeerId};
use tokio::sync::mpsc;

use super::behaviour::{OverlayBehaviour, OverlayBehaviourEvent};
use crate::config::RolePolicy;

/// Commands that can be sent to the swarm task.
#[derive(Debug)]
pub enum OverlayCommand {
    /// Dial a peer at a specific address
    Dial {
        addr: Multiaddr,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Dial a peer by id using routing-table addresses
    DialPeer {
        peer_id: PeerId,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Get list of connected peers
    ConnectedPeers { reply: mpsc::Sender<Vec<PeerId>> },
    /// Get listening + advertised external addresses
    Listeners { reply: mpsc::Sender<Vec<Multiaddr>> },
    /// Subscribe to a gossipsub topic
    Subscribe {
        topic: String,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Publish payload to a gossipsub topic
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Announce this node as a provider for a DHT key
    StartProviding {
        key: String,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Stream providers of a DHT key; the sender is dropped when the
    /// query finishes, which ends the stream.
    FindProviders {
        key: String,
        found: mpsc::Sender<PeerId>,
    },
    /// Store a value under a DHT key
    PutRecord {
        key: String,
        value: Vec<u8>,
        reply: mpsc::Sender<Result<(), String>>,
    },
    /// Fetch a value under a DHT key
    GetRecord {
        key: String,
        reply: mpsc::Sender<Result<Vec<u8>, String>>,
    },
    /// Add a known peer address to the routing table
    AddAddress { peer_id: PeerId, addr: Multiaddr },
    /// Kick off an iterative DHT bootstrap walk
    TriggerBootstrap,
    /// Number of peers in the routing table
    RoutingTableSize { reply: mpsc::Sender<usize> },
    /// Shut down the swarm
    Shutdown,
}

/// Events emitted by the swarm to the node.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    /// A connection to a peer was established
    PeerConnected(PeerId),
    /// A peer disconnected
    PeerDisconnected(PeerId),
    /// We started listening on an address
    Listening(Multiaddr),
    /// Raw gossipsub payload on one of the overlay topics
    GossipMessage { topic: String, data: Vec<u8> },
    /// A peer's identity was confirmed (Identify protocol)
    Identified {
        peer_id: PeerId,
        listen_addrs: Vec<Multiaddr>,
    },
}

/// Handle to communicate with the running swarm task.
#[derive(Clone)]
pub struct SwarmHandle {
    command_tx: mpsc::Sender<OverlayCommand>,
}

impl SwarmHandle {
    pub async fn dial(&self, addr: Multiaddr) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::Dial {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn dial_peer(&self, peer_id: PeerId) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::DialPeer {
                peer_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::ConnectedPeers { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))
    }

    pub async fn listeners(&self) -> Result<Vec<Multiaddr>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::Listeners { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::Subscribe {
                topic: topic.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::Publish {
                topic: topic.to_string(),
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn start_providing(&self, key: &str) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::StartProviding {
                key: key.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Open-ended provider stream for a DHT key. The stream ends when
    /// the query finishes; an empty stream means no providers, not an
    /// error.
    pub async fn find_providers(&self, key: &str) -> Result<mpsc::Receiver<PeerId>> {
        let (found_tx, found_rx) = mpsc::channel(32);
        self.command_tx
            .send(OverlayCommand::FindProviders {
                key: key.to_string(),
                found: found_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        Ok(found_rx)
    }

    pub async fn put_record(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::PutRecord {
                key: key.to_string(),
                value,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))?
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub async fn get_record(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::GetRecord {
                key: key.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        match reply_rx.recv().await {
            Some(Ok(value)) => Ok(Some(value)),
            // Missing records are empty results, not errors.
            Some(Err(_)) | None => Ok(None),
        }
    }

    pub async fn add_address(&self, peer_id: PeerId, addr: Multiaddr) -> Result<()> {
        self.command_tx
            .send(OverlayCommand::AddAddress { peer_id, addr })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))
    }

    pub async fn trigger_bootstrap(&self) -> Result<()> {
        self.command_tx
            .send(OverlayCommand::TriggerBootstrap)
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))
    }

    pub async fn routing_table_size(&self) -> Result<usize> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(OverlayCommand::RoutingTableSize { reply: reply_tx })
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("No reply from swarm"))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(OverlayCommand::Shutdown)
            .await
            .map_err(|_| anyhow::anyhow!("Swarm task not running"))
    }
}

/// Spawn the swarm event loop, returning the command handle.
pub(super) fn spawn_swarm_task(
    mut swarm: libp2p::Swarm<OverlayBehaviour>,
    policy: RolePolicy,
    event_tx: mpsc::Sender<OverlayEvent>,
) -> SwarmHandle {
    let (command_tx, mut command_rx) = mpsc::channel::<OverlayCommand>(256);
    let handle = SwarmHandle {
        command_tx: command_tx.clone(),
    };

    tokio::spawn(async move {
        use futures::StreamExt;

        // Per-query reply routing for the DHT.
        let mut pending_providers: HashMap<kad::QueryId, mpsc::Sender<PeerId>> = HashMap::new();
        let mut pending_start_providing: HashMap<kad::QueryId, mpsc::Sender<Result<(), String>>> =
            HashMap::new();
        let mut pending_put: HashMap<kad::QueryId, mpsc::Sender<Result<(), String>>> =
            HashMap::new();
        let mut pending_get: HashMap<kad::QueryId, mpsc::Sender<Result<Vec<u8>, String>>> =
            HashMap::new();

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(
                            gossipsub::Event::Message { propagation_source, message, .. }
                        )) => {
                            let topic = message.topic.into_string();
                            tracing::debug!(
                                "Gossip message from {} on {} ({} bytes)",
                                propagation_source,
                                topic,
                                message.data.len()
                            );
                            let _ = event_tx.send(OverlayEvent::GossipMessage {
                                topic,
                                data: message.data,
                            }).await;
                        }

                        SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(
                            gossipsub::Event::Subscribed { peer_id, topic }
                        )) => {
                            tracing::debug!("Peer {} subscribed to {}", peer_id, topic.as_str());
                        }

                        SwarmEvent::Behaviour(OverlayBehaviourEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { id, result, .. }
                        )) => {
                            handle_query_progress(
                                id,
                                result,
                                &mut pending_providers,
                                &mut pending_start_providing,
                                &mut pending_put,
                                &mut pending_get,
                            );
                        }

                        SwarmEvent::Behaviour(OverlayBehaviourEvent::Kademlia(
                            kad::Event::RoutingUpdated { peer, .. }
                        )) => {
                            tracing::trace!("Routing table updated with {}", peer);
                        }

                        SwarmEvent::Behaviour(OverlayBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. }
                        )) => {
                            tracing::debug!(
                                "Identified peer {} — agent: {}, addrs: {}",
                                peer_id,
                                info.agent_version,
                                info.listen_addrs.len()
                            );

                            // Every reported address feeds the routing table so
                            // later directory lookups can complete.
                            if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                                for addr in &info.listen_addrs {
                                    kademlia.add_address(&peer_id, addr.clone());
                                }
                            }

                            let _ = event_tx.send(OverlayEvent::Identified {
                                peer_id,
                                listen_addrs: info.listen_addrs,
                            }).await;
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            tracing::info!("Listening on {}", address);
                            let _ = event_tx.send(OverlayEvent::Listening(address)).await;
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            tracing::info!(
                                "Connected to {} via {}",
                                peer_id,
                                endpoint.get_remote_address()
                            );
                            let _ = event_tx.send(OverlayEvent::PeerConnected(peer_id)).await;
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                tracing::info!("Disconnected from {}", peer_id);
                                let _ = event_tx.send(OverlayEvent::PeerDisconnected(peer_id)).await;
                            }
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            // Individual dial failures are logged and counted,
                            // never fatal.
                            match peer_id {
                                Some(pid) => tracing::warn!("Outgoing connection error to {}: {}", pid, error),
                                None => tracing::warn!("Outgoing connection error: {}", error),
                            }
                        }

                        SwarmEvent::IncomingConnectionError { send_back_addr, error, .. } => {
                            tracing::debug!(
                                "Incoming connection error from {}: {}",
                                send_back_addr,
                                error
                            );
                        }

                        _ => {}
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        OverlayCommand::Dial { addr, reply } => {
                            tracing::debug!("Dialing {}", addr);
                            match swarm.dial(addr) {
                                Ok(_) => { let _ = reply.send(Ok(())).await; }
                                Err(e) => { let _ = reply.send(Err(e.to_string())).await; }
                            }
                        }

                        OverlayCommand::DialPeer { peer_id, reply } => {
                            use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
                            let opts = DialOpts::peer_id(peer_id)
                                .condition(PeerCondition::DisconnectedAndNotDialing)
                                .build();
                            match swarm.dial(opts) {
                                Ok(_) => { let _ = reply.send(Ok(())).await; }
                                Err(e) => { let _ = reply.send(Err(e.to_string())).await; }
                            }
                        }

                        OverlayCommand::ConnectedPeers { reply } => {
                            let peers: Vec<PeerId> = swarm.connected_peers().cloned().collect();
                            let _ = reply.send(peers).await;
                        }

                        OverlayCommand::Listeners { reply } => {
                            let mut addrs: Vec<Multiaddr> = swarm.listeners().cloned().collect();
                            addrs.extend(swarm.external_addresses().cloned());
                            let _ = reply.send(addrs).await;
                        }

                        OverlayCommand::Subscribe { topic, reply } => {
                            let result = match swarm.behaviour_mut().gossipsub.as_mut() {
                                Some(gossipsub) => {
                                    let ident = gossipsub::IdentTopic::new(topic.clone());
                                    gossipsub
                                        .subscribe(&ident)
                                        .map(|_| ())
                                        .map_err(|e| e.to_string())
                                }
                                None => Err("gossip disabled by role policy".to_string()),
                            };
                            if result.is_ok() {
                                tracing::info!("Subscribed to topic {}", topic);
                            }
                            let _ = reply.send(result).await;
                        }

                        OverlayCommand::Publish { topic, data, reply } => {
                            let result = match swarm.behaviour_mut().gossipsub.as_mut() {
                                Some(gossipsub) => {
                                    let ident = gossipsub::IdentTopic::new(topic.clone());
                                    match gossipsub.publish(ident, data) {
                                        Ok(_) => Ok(()),
                                        // A lone node has nobody to hand the
                                        // message to; roles that allow it treat
                                        // this as a quiet success.
                                        Err(gossipsub::PublishError::InsufficientPeers)
                                            if policy.allow_publish_to_zero_peers =>
                                        {
                                            tracing::debug!(
                                                "Published to {} with zero mesh peers",
                                                topic
                                            );
                                            Ok(())
                                        }
                                        Err(e) => Err(e.to_string()),
                                    }
                                }
                                None => Err("gossip disabled by role policy".to_string()),
                            };
                            let _ = reply.send(result).await;
                        }

                        OverlayCommand::StartProviding { key, reply } => {
                            match swarm.behaviour_mut().kademlia.as_mut() {
                                Some(kademlia) => {
                                    let record_key = kad::RecordKey::new(&key.as_bytes());
                                    match kademlia.start_providing(record_key) {
                                        Ok(query_id) => {
                                            pending_start_providing.insert(query_id, reply);
                                        }
                                        Err(e) => {
                                            let _ = reply.send(Err(e.to_string())).await;
                                        }
                                    }
                                }
                                None => {
                                    let _ = reply
                                        .send(Err("DHT disabled by role policy".to_string()))
                                        .await;
                                }
                            }
                        }

                        OverlayCommand::FindProviders { key, found } => {
                            match swarm.behaviour_mut().kademlia.as_mut() {
                                Some(kademlia) => {
                                    let record_key = kad::RecordKey::new(&key.as_bytes());
                                    let query_id = kademlia.get_providers(record_key);
                                    pending_providers.insert(query_id, found);
                                }
                                // Dropping `found` ends the stream: empty
                                // result, not an error.
                                None => drop(found),
                            }
                        }

                        OverlayCommand::PutRecord { key, value, reply } => {
                            match swarm.behaviour_mut().kademlia.as_mut() {
                                Some(kademlia) => {
                                    let record = kad::Record::new(key.into_bytes(), value);
                                    match kademlia.put_record(record, kad::Quorum::One) {
                                        Ok(query_id) => {
                                            pending_put.insert(query_id, reply);
                                        }
                                        Err(e) => {
                                            let _ = reply.send(Err(e.to_string())).await;
                                        }
                                    }
                                }
                                None => {
                                    let _ = reply
                                        .send(Err("DHT disabled by role policy".to_string()))
                                        .await;
                                }
                            }
                        }

                        OverlayCommand::GetRecord { key, reply } => {
                            match swarm.behaviour_mut().kademlia.as_mut() {
                                Some(kademlia) => {
                                    let record_key = kad::RecordKey::new(&key.as_bytes());
                                    let query_id = kademlia.get_record(record_key);
                                    pending_get.insert(query_id, reply);
                                }
                                None => {
                                    let _ = reply
                                        .send(Err("DHT disabled by role policy".to_string()))
                                        .await;
                                }
                            }
                        }

                        OverlayCommand::AddAddress { peer_id, addr } => {
                            if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                                kademlia.add_address(&peer_id, addr);
                            }
                        }

                        OverlayCommand::TriggerBootstrap => {
                            if let Some(kademlia) = swarm.behaviour_mut().kademlia.as_mut() {
                                if let Err(e) = kademlia.bootstrap() {
                                    tracing::debug!("DHT bootstrap skipped: {}", e);
                                }
                            }
                        }

                        OverlayCommand::RoutingTableSize { reply } => {
                            let size = swarm
                                .behaviour_mut()
                                .kademlia
                                .as_mut()
                                .map(|k| k.kbuckets().map(|bucket| bucket.num_entries()).sum())
                                .unwrap_or(0);
                            let _ = reply.send(size).await;
                        }

                        OverlayCommand::Shutdown => {
                            tracing::info!("Swarm shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });

    handle
}

/// Route one DHT query progress report to its waiting caller.
fn handle_query_progress(
    id: kad::QueryId,
    result: kad::QueryResult,
    pending_providers: &mut HashMap<kad::QueryId, mpsc::Sender<PeerId>>,
    pending_start_providing: &mut HashMap<kad::QueryId, mpsc::Sender<Result<(), String>>>,
    pending_put: &mut HashMap<kad::QueryId, mpsc::Sender<Result<(), String>>>,
    pending_get: &mut HashMap<kad::QueryId, mpsc::Sender<Result<Vec<u8>, String>>>,
) {
    match result {
        kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
            providers,
            ..
        })) => {
            if let Some(found) = pending_providers.get(&id) {
                for provider in providers {
                    // try_send: a saturated or abandoned consumer must
                    // not stall the swarm loop.
                    let _ = found.try_send(provider);
                }
            }
        }
        kad::QueryResult::GetProviders(Ok(
            kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
        )) => {
            pending_providers.remove(&id);
        }
        kad::QueryResult::GetProviders(Err(e)) => {
            tracing::debug!("Provider query failed: {}", e);
            pending_providers.remove(&id);
        }

        kad::QueryResult::StartProviding(outcome) => {
            if let Some(reply) = pending_start_providing.remove(&id) {
                let _ = reply.try_send(outcome.map(|_| ()).map_err(|e| e.to_string()));
            }
        }

        kad::QueryResult::PutRecord(outcome) => {
            if let Some(reply) = pending_put.remove(&id) {
                let _ = reply.try_send(outcome.map(|_| ()).map_err(|e| e.to_string()));
            }
        }

        kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(peer_record))) => {
            if let Some(reply) = pending_get.remove(&id) {
                let _ = reply.try_send(Ok(peer_record.record.value));
            }
        }
        kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord {
            ..
        })) => {
            if let Some(reply) = pending_get.remove(&id) {
                let _ = reply.try_send(Err("record not found".to_string()));
            }
        }
        kad::QueryResult::GetRecord(Err(e)) => {
            if let Some(reply) = pending_get.remove(&id) {
                let _ = reply.try_send(Err(e.to_string()));
            }
        }

        kad::QueryResult::Bootstrap(outcome) => {
            tracing::trace!("DHT bootstrap step: {:?}", outcome);
        }

        _ => {}
    }
}
