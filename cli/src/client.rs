// Control-plane client commands
//
// Each helper opens a fresh connection: the control channel is local
// and the commands are one-shot.

use anyhow::{Context, Result};

use agentmesh_core::api::proto::{
    control_plane_client::ControlPlaneClient, p2p_event, ConnectRequest, ListRequest, Message,
    StopRequest,
};

async fn connect(control: &str) -> Result<ControlPlaneClient<tonic::transport::Channel>> {
    let channel = tonic::transport::Endpoint::from_shared(control.to_string())
        .with_context(|| format!("Invalid control plane address {}", control))?
        .connect()
        .await
        .with_context(|| format!("Cannot reach control plane at {}", control))?;
    Ok(ControlPlaneClient::new(channel))
}

pub async fn send(control: &str, recipient: &str, message: &str) -> Result<()> {
    let mut client = connect(control).await?;
    let result = client
        .send_message(Message {
            to: recipient.to_string(),
            content: message.as_bytes().to_vec(),
        })
        .await
        .context("SendMessage failed")?
        .into_inner();

    println!("{}", result.message_id);
    Ok(())
}

pub async fn agents(control: &str) -> Result<()> {
    let mut client = connect(control).await?;
    let response = client
        .list_agents(ListRequest {})
        .await
        .context("ListAgents failed")?
        .into_inner();

    if response.agents.is_empty() {
        println!("no agents known");
        return Ok(());
    }

    for agent in response.agents {
        let name = if agent.agent_name.is_empty() {
            "-".to_string()
        } else {
            agent.agent_name
        };
        println!(
            "{}  {}  {}  since={}",
            agent.agent_id, agent.peer_id, name, agent.connected_since
        );
    }
    Ok(())
}

pub async fn watch(control: &str) -> Result<()> {
    let mut client = connect(control).await?;
    let mut stream = client
        .connect(ConnectRequest {
            port: 0,
            name: String::new(),
            private_key: String::new(),
        })
        .await
        .context("Connect failed")?
        .into_inner();

    while let Some(event) = stream.message().await? {
        match event.event {
            Some(p2p_event::Event::Ready(ready)) => {
                println!("ready peer_id={}", ready.peer_id);
            }
            Some(p2p_event::Event::PeerConnected(peer)) => {
                println!("peer-connected {}", peer.peer_id);
            }
            Some(p2p_event::Event::Message(message)) => {
                let text = String::from_utf8_lossy(&message.content);
                println!(
                    "message id={} from={} ts={} content={}",
                    message.message_id, message.from, message.timestamp, text
                );
            }
            Some(p2p_event::Event::Error(error)) => {
                println!("error code={} message={}", error.code, error.message);
            }
            None => {}
        }
    }
    Ok(())
}

pub async fn stop(control: &str) -> Result<()> {
    let mut client = connect(control).await?;
    client.stop(StopRequest {}).await.context("Stop failed")?;
    println!("node stopping");
    Ok(())
}
