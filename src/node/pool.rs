use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::track::{PendingTrack, TrackInfo};
use crate::error::{PlayerError, PlayerResult};
use crate::node::{
    backoff::Backoff,
    transport::{Instruction, NodeConfig, NodeTransport},
    NodeId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Connecting,
    Connected,
    Disconnected,
    /// Retirado de la configuración. Terminal.
    Destroyed,
}

struct NodeRecord {
    config: NodeConfig,
    state: NodeState,
    reconnect_attempts: u32,
    total_reconnects: u64,
    bound_sessions: usize,
    last_change: DateTime<Utc>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl NodeRecord {
    fn set_state(&mut self, state: NodeState) {
        self.state = state;
        self.last_change = Utc::now();
    }

    fn health(&self) -> NodeHealth {
        NodeHealth {
            id: self.config.id.clone(),
            address: self.config.address.clone(),
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            total_reconnects: self.total_reconnects,
            bound_sessions: self.bound_sessions,
            last_change: self.last_change,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    pub id: NodeId,
    pub address: String,
    pub state: NodeState,
    pub reconnect_attempts: u32,
    pub total_reconnects: u64,
    pub bound_sessions: usize,
    pub last_change: DateTime<Utc>,
}

/// Vista agregada del pool para observabilidad.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub destroyed: usize,
    /// Presente mientras no hay nodo conectado: la única condición que requiere un operador.
    pub no_connected_since: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeHealth>,
}

/// Estado de conexión de cada nodo de audio configurado.
///
/// Cada registro de nodo sólo se modifica a través de su entrada del mapa, y
/// cada reconexión corre en su propia tarea: un nodo inestable no frena al resto.
pub struct NodePool {
    nodes: DashMap<NodeId, NodeRecord>,
    transport: Arc<dyn NodeTransport>,
    backoff: Backoff,
    no_connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl NodePool {
    pub fn new(configs: Vec<NodeConfig>, transport: Arc<dyn NodeTransport>, backoff: Backoff) -> Self {
        let now = Utc::now();
        let nodes = DashMap::new();
        for config in configs {
            nodes.insert(
                config.id.clone(),
                NodeRecord {
                    config,
                    state: NodeState::Connecting,
                    reconnect_attempts: 0,
                    total_reconnects: 0,
                    bound_sessions: 0,
                    last_change: now,
                    reconnect_task: None,
                },
            );
        }

        Self {
            nodes,
            transport,
            backoff,
            no_connected_since: Mutex::new(Some(now)),
        }
    }

    /// Lanza el primer intento de conexión de cada nodo configurado.
    pub fn connect_all(self: &Arc<Self>) {
        let ids: Vec<NodeId> = self.nodes.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.spawn_attempt(&id, Duration::ZERO);
        }
    }

    /// Marca un nodo como perdido y agenda el siguiente intento de reconexión.
    ///
    /// Las sesiones asignadas no se tocan; sus comandos fallan con
    /// `NodeUnavailable` hasta que el nodo vuelva o se las mueva.
    pub fn on_disconnect(self: &Arc<Self>, node_id: &str) {
        let attempts = {
            let Some(mut record) = self.nodes.get_mut(node_id) else {
                warn!("⚠️ Desconexión reportada para nodo desconocido {}", node_id);
                return;
            };
            if record.state == NodeState::Destroyed {
                return;
            }
            record.set_state(NodeState::Disconnected);
            record.reconnect_attempts = record.reconnect_attempts.saturating_add(1);
            record.total_reconnects += 1;
            record.reconnect_attempts
        };

        self.refresh_outage_marker();
        let delay = self.backoff.delay(attempts);
        warn!(
            "🔌 Nodo {} desconectado, intento de reconexión {} en {:?}",
            node_id, attempts, delay
        );
        self.spawn_attempt(node_id, delay);
    }

    pub fn on_reconnect(&self, node_id: &str) {
        {
            let Some(mut record) = self.nodes.get_mut(node_id) else {
                warn!("⚠️ Conexión reportada para nodo desconocido {}", node_id);
                return;
            };
            if record.state == NodeState::Destroyed {
                return;
            }
            record.set_state(NodeState::Connected);
            record.reconnect_attempts = 0;
            if let Some(task) = record.reconnect_task.take() {
                task.abort();
            }
        }

        self.refresh_outage_marker();
        info!("✅ Nodo {} conectado", node_id);
    }

    /// Saca un nodo de la rotación para siempre.
    pub fn remove_node(&self, node_id: &str) -> bool {
        {
            let Some(mut record) = self.nodes.get_mut(node_id) else {
                return false;
            };
            record.set_state(NodeState::Destroyed);
            if let Some(task) = record.reconnect_task.take() {
                task.abort();
            }
        }

        self.refresh_outage_marker();
        info!("🗑️ Nodo {} eliminado del pool", node_id);
        true
    }

    /// Nodo conectado con menos carga; en empate gana el que menos se cayó.
    pub fn select_node_for_new_session(&self) -> PlayerResult<NodeId> {
        self.nodes
            .iter()
            .filter(|record| record.state == NodeState::Connected)
            .min_by(|a, b| {
                (a.bound_sessions, a.total_reconnects, a.key())
                    .cmp(&(b.bound_sessions, b.total_reconnects, b.key()))
            })
            .map(|record| record.key().clone())
            .ok_or(PlayerError::NoNodesAvailable)
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .is_some_and(|record| record.state == NodeState::Connected)
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.get(node_id).map(|record| record.state)
    }

    pub fn bind(&self, node_id: &str) {
        if let Some(mut record) = self.nodes.get_mut(node_id) {
            record.bound_sessions += 1;
        }
    }

    pub fn release(&self, node_id: &str) {
        if let Some(mut record) = self.nodes.get_mut(node_id) {
            record.bound_sessions = record.bound_sessions.saturating_sub(1);
        }
    }

    /// Envía una instrucción a un nodo, rechazándola si no está conectado.
    pub fn dispatch(&self, node_id: &str, guild_id: GuildId, instruction: Instruction) -> PlayerResult<()> {
        if !self.is_connected(node_id) {
            return Err(PlayerError::NodeUnavailable(node_id.to_string()));
        }

        debug!("📤 {} -> nodo {} para guild {}", instruction.name(), node_id, guild_id);
        self.transport
            .dispatch(node_id, guild_id, instruction)
            .map_err(|e| {
                warn!("⚠️ Falló el envío al nodo {}: {:#}", node_id, e);
                PlayerError::NodeUnavailable(node_id.to_string())
            })
    }

    pub async fn resolve(&self, node_id: &str, track: &PendingTrack) -> PlayerResult<TrackInfo> {
        if !self.is_connected(node_id) {
            return Err(PlayerError::NodeUnavailable(node_id.to_string()));
        }

        let mut info = self
            .transport
            .resolve(node_id, track)
            .await
            .map_err(|e| PlayerError::ResolveFailed {
                identifier: track.identifier.clone(),
                reason: format!("{:#}", e),
            })?;
        info.requested_by = track.requested_by;
        Ok(info)
    }

    pub fn health(&self) -> PoolHealth {
        let mut nodes: Vec<NodeHealth> = self.nodes.iter().map(|record| record.health()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let count = |state: NodeState| nodes.iter().filter(|n| n.state == state).count();
        PoolHealth {
            total: nodes.len(),
            connected: count(NodeState::Connected),
            connecting: count(NodeState::Connecting),
            disconnected: count(NodeState::Disconnected),
            destroyed: count(NodeState::Destroyed),
            no_connected_since: *self.no_connected_since.lock(),
            nodes,
        }
    }

    pub fn is_operational(&self) -> bool {
        self.nodes
            .iter()
            .any(|record| record.state == NodeState::Connected)
    }

    fn spawn_attempt(self: &Arc<Self>, node_id: &str, delay: Duration) {
        let pool = Arc::clone(self);
        let id = node_id.to_string();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(config) = pool.begin_attempt(&id) else {
                return;
            };
            match pool.transport.connect(&config).await {
                Ok(()) => pool.on_reconnect(&id),
                Err(e) => {
                    error!("❌ No se pudo conectar al nodo {}: {:#}", id, e);
                    pool.on_disconnect(&id);
                }
            }
        });

        if let Some(mut record) = self.nodes.get_mut(node_id) {
            if record.state == NodeState::Destroyed {
                task.abort();
            } else if let Some(previous) = record.reconnect_task.replace(task) {
                previous.abort();
            }
        }
    }

    fn begin_attempt(&self, node_id: &str) -> Option<NodeConfig> {
        let mut record = self.nodes.get_mut(node_id)?;
        match record.state {
            NodeState::Destroyed | NodeState::Connected => None,
            _ => {
                record.set_state(NodeState::Connecting);
                debug!("🔄 Conectando al nodo {} en {}", node_id, record.config.address);
                Some(record.config.clone())
            }
        }
    }

    fn refresh_outage_marker(&self) {
        let operational = self.is_operational();
        let mut since = self.no_connected_since.lock();
        match (operational, since.is_some()) {
            (true, true) => *since = None,
            (false, false) => {
                *since = Some(Utc::now());
                warn!("🚨 Ningún nodo de audio conectado");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn pool_with(ids: &[&str], transport: Arc<RecordingTransport>) -> Arc<NodePool> {
        let configs = ids
            .iter()
            .map(|id| NodeConfig::new(*id, format!("{}:2333", id)))
            .collect();
        Arc::new(NodePool::new(configs, transport, Backoff::default()))
    }

    fn connected(ids: &[&str]) -> (Arc<NodePool>, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new();
        let pool = pool_with(ids, transport.clone());
        for id in ids {
            pool.on_reconnect(id);
        }
        (pool, transport)
    }

    #[tokio::test]
    async fn empty_pool_has_nothing_to_offer() {
        let (pool, _) = connected(&[]);
        assert_eq!(pool.select_node_for_new_session(), Err(PlayerError::NoNodesAvailable));
        assert!(!pool.is_operational());
        assert!(pool.health().no_connected_since.is_some());
    }

    #[tokio::test]
    async fn picks_least_loaded_then_most_stable() {
        let (pool, _) = connected(&["a", "b", "c"]);
        pool.bind("a");
        pool.bind("b");
        assert_eq!(pool.select_node_for_new_session().unwrap(), "c");

        pool.bind("c");
        pool.on_disconnect("a");
        pool.on_reconnect("a");
        // todos llevan una sesión, a se cayó una vez
        assert_eq!(pool.select_node_for_new_session().unwrap(), "b");

        pool.release("b");
        assert_eq!(pool.select_node_for_new_session().unwrap(), "b");
    }

    #[tokio::test]
    async fn disconnected_node_is_never_selected_until_reconnect() {
        let (pool, _) = connected(&["a", "b", "c"]);
        pool.bind("b");
        pool.bind("c");
        assert_eq!(pool.health().connected, 3);

        pool.on_disconnect("a");
        assert_eq!(pool.health().connected, 2);
        assert_eq!(pool.health().disconnected, 1);
        for _ in 0..5 {
            let picked = pool.select_node_for_new_session().unwrap();
            assert_ne!(picked, "a");
            pool.bind(&picked);
        }

        pool.on_reconnect("a");
        assert_eq!(pool.health().connected, 3);
        assert_eq!(pool.select_node_for_new_session().unwrap(), "a");
    }

    #[tokio::test]
    async fn attempts_count_up_and_reset() {
        let (pool, _) = connected(&["a"]);
        pool.on_disconnect("a");
        pool.on_disconnect("a");

        let node = &pool.health().nodes[0];
        assert_eq!(node.state, NodeState::Disconnected);
        assert_eq!(node.reconnect_attempts, 2);
        assert!(!pool.is_operational());
        assert!(pool.health().no_connected_since.is_some());

        pool.on_reconnect("a");
        let health = pool.health();
        assert_eq!(health.nodes[0].reconnect_attempts, 0);
        assert_eq!(health.nodes[0].total_reconnects, 2);
        assert_eq!(health.no_connected_since, None);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_in_the_background() {
        let transport = RecordingTransport::new();
        transport.fail_next_connects(2);
        let pool = pool_with(&["a"], transport.clone());
        pool.on_reconnect("a");

        pool.on_disconnect("a");
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(pool.state("a"), Some(NodeState::Connected));
        assert_eq!(transport.connect_calls(), 3);
        assert_eq!(pool.health().nodes[0].total_reconnects, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_all_brings_nodes_up() {
        let transport = RecordingTransport::new();
        let pool = pool_with(&["a", "b"], transport.clone());
        assert_eq!(pool.health().connecting, 2);

        pool.connect_all();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pool.health().connected, 2);
        assert!(pool.is_operational());
    }

    #[tokio::test]
    async fn removed_node_is_terminal() {
        let (pool, _) = connected(&["a", "b"]);
        assert!(pool.remove_node("a"));
        pool.on_reconnect("a");
        pool.on_disconnect("a");

        assert_eq!(pool.state("a"), Some(NodeState::Destroyed));
        assert_eq!(pool.health().destroyed, 1);
        assert_eq!(pool.select_node_for_new_session().unwrap(), "b");
        assert!(!pool.remove_node("missing"));
    }

    #[tokio::test]
    async fn dispatch_requires_a_connected_node() {
        let (pool, transport) = connected(&["a"]);
        pool.dispatch("a", GuildId::new(1), Instruction::Volume(80)).unwrap();
        assert_eq!(transport.instructions().len(), 1);

        pool.on_disconnect("a");
        assert_eq!(
            pool.dispatch("a", GuildId::new(1), Instruction::Volume(90)),
            Err(PlayerError::NodeUnavailable("a".into()))
        );
        assert_eq!(
            pool.resolve("a", &PendingTrack::new("x", UserId::new(1))).await,
            Err(PlayerError::NodeUnavailable("a".into()))
        );
        assert_eq!(transport.instructions().len(), 1);
    }

    #[tokio::test]
    async fn resolve_keeps_the_requester() {
        let (pool, _) = connected(&["a"]);
        let info = pool
            .resolve("a", &PendingTrack::new("song", UserId::new(42)))
            .await
            .unwrap();
        assert_eq!(info.requested_by, UserId::new(42));

        let failed = pool.resolve("a", &PendingTrack::new("bad-song", UserId::new(42))).await;
        assert!(matches!(failed, Err(PlayerError::ResolveFailed { .. })));
    }
}
