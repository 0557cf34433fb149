use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::time::Duration;
use tokio::{net::TcpStream, sync::oneshot};
use tracing::debug;

use crate::audio::track::{PendingTrack, TrackInfo};
use crate::node::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    /// `host:port` del nodo.
    pub address: String,
}

impl NodeConfig {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Instrucciones de control para el nodo asignado a una guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `play_id` viaja como dato de usuario del track y el nodo lo devuelve
    /// en sus eventos de inicio y fin.
    Play {
        track: TrackInfo,
        start_ms: u64,
        play_id: u64,
    },
    Pause(bool),
    Seek(u64),
    Volume(u16),
    Stop,
    /// Elimina el reproductor de la guild en el nodo.
    Destroy,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Play { .. } => "play",
            Instruction::Pause(_) => "pause",
            Instruction::Seek(_) => "seek",
            Instruction::Volume(_) => "volume",
            Instruction::Stop => "stop",
            Instruction::Destroy => "destroy",
        }
    }
}

/// Punto de unión con la capa que habla de verdad con los nodos de audio.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Abre (o reabre) la conexión a un nodo.
    async fn connect(&self, node: &NodeConfig) -> Result<()>;

    /// Entrega una instrucción sin esperar al nodo.
    fn dispatch(&self, node_id: &str, guild_id: GuildId, instruction: Instruction) -> Result<()>;

    /// Pide al nodo convertir un identificador en metadatos reproducibles.
    async fn resolve(&self, node_id: &str, track: &PendingTrack) -> Result<TrackInfo>;
}

/// Mensajes que la capa de transporte consume de [`ChannelTransport`].
#[derive(Debug)]
pub enum Outbound {
    Instruction {
        node_id: NodeId,
        guild_id: GuildId,
        instruction: Instruction,
    },
    Resolve {
        node_id: NodeId,
        track: PendingTrack,
        reply: oneshot::Sender<Result<TrackInfo>>,
    },
}

/// Conecta el núcleo con un cliente de nodos externo a través de un canal.
///
/// Las instrucciones se encolan, las resoluciones llevan un canal de respuesta
/// y `connect` prueba la conectividad TCP antes de que el cliente reabra su socket.
pub struct ChannelTransport {
    outbound: flume::Sender<Outbound>,
    probe_timeout: Duration,
}

impl ChannelTransport {
    pub fn new(probe_timeout: Duration) -> (Self, flume::Receiver<Outbound>) {
        let (outbound, receiver) = flume::unbounded();
        (
            Self {
                outbound,
                probe_timeout,
            },
            receiver,
        )
    }
}

#[async_trait]
impl NodeTransport for ChannelTransport {
    async fn connect(&self, node: &NodeConfig) -> Result<()> {
        let stream = tokio::time::timeout(self.probe_timeout, TcpStream::connect(&node.address))
            .await
            .with_context(|| format!("sondeo a {} sin respuesta a tiempo", node.address))?
            .with_context(|| format!("no se pudo alcanzar {}", node.address))?;
        debug!("🔌 Nodo {} alcanzable en {:?}", node.id, stream.peer_addr().ok());
        Ok(())
    }

    fn dispatch(&self, node_id: &str, guild_id: GuildId, instruction: Instruction) -> Result<()> {
        self.outbound
            .send(Outbound::Instruction {
                node_id: node_id.to_string(),
                guild_id,
                instruction,
            })
            .map_err(|_| anyhow!("la capa de transporte ya no existe"))
    }

    async fn resolve(&self, node_id: &str, track: &PendingTrack) -> Result<TrackInfo> {
        let (reply, response) = oneshot::channel();
        self.outbound
            .send_async(Outbound::Resolve {
                node_id: node_id.to_string(),
                track: track.clone(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("la capa de transporte ya no existe"))?;

        response
            .await
            .context("la capa de transporte descartó la resolución")?
    }
}
