use dashmap::mapref::entry::Entry;
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        policy::{self, SkipCooldown},
        session::{PlaybackSession, PlaybackState, SessionMap, SessionParams, SessionSnapshot},
    },
    error::{PlayerError, PlayerResult},
    node::{InboundEvent, NodeEvent, NodePool, PlayerEvent},
    storage::{TenantConfigStore, TenantSettings},
};

/// Dueño de cada sesión viva, como máximo una por guild; les reparte los
/// eventos de los nodos.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    pool: Arc<NodePool>,
    store: Arc<dyn TenantConfigStore>,
    max_queue_size: usize,
    confirm_timeout: Duration,
    skip_cooldown: SkipCooldown,
}

impl SessionRegistry {
    pub fn new(pool: Arc<NodePool>, store: Arc<dyn TenantConfigStore>, max_queue_size: usize) -> Self {
        Self {
            sessions: Arc::new(SessionMap::new()),
            pool,
            store,
            max_queue_size,
            confirm_timeout: Duration::from_secs(10),
            skip_cooldown: SkipCooldown::new(Duration::from_secs(3)),
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn with_skip_cooldown(mut self, cooldown: Duration) -> Self {
        self.skip_cooldown = SkipCooldown::new(cooldown);
        self
    }

    pub fn skip_cooldown(&self) -> &SkipCooldown {
        &self.skip_cooldown
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Devuelve la sesión de la guild, creándola en el nodo con menos carga.
    /// Una sesión destruida cuenta como ausente.
    pub async fn get_or_create(
        &self,
        guild_id: GuildId,
        voice_channel: ChannelId,
    ) -> PlayerResult<Arc<PlaybackSession>> {
        if let Some(session) = self.get(guild_id) {
            return Ok(session);
        }

        let settings = self.settings(guild_id).await;
        let ceiling = policy::volume_ceiling(settings.tier, settings.volume_ceiling);

        // La entrada del mapa hace atómicos el chequeo y la inserción
        let entry = self.sessions.entry(guild_id);
        if let Entry::Occupied(existing) = &entry {
            if !existing.get().is_destroyed() {
                return Ok(existing.get().clone());
            }
        }

        let node_id = self.pool.select_node_for_new_session()?;
        self.pool.bind(&node_id);
        let session = PlaybackSession::spawn(
            SessionParams {
                guild_id,
                node_id: node_id.clone(),
                voice_channel,
                volume: settings.default_volume.min(ceiling),
                max_queue_size: self.max_queue_size,
            },
            self.pool.clone(),
            Arc::downgrade(&self.sessions),
        );
        entry.insert(session.clone());

        info!("🆕 Sesión de guild {} creada en el nodo {}", guild_id, node_id);
        Ok(session)
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<PlaybackSession>> {
        self.sessions
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.is_destroyed())
    }

    /// Destruye la sesión de una guild. Devuelve `false` si no había.
    pub async fn remove(&self, guild_id: GuildId) -> bool {
        let Some((_, session)) = self.sessions.remove(&guild_id) else {
            return false;
        };
        session.destroy().await;
        self.skip_cooldown.forget_guild(guild_id);
        true
    }

    /// Espera a que el nodo confirme el inicio del track actual de la sesión.
    pub async fn wait_until_started(&self, session: &PlaybackSession) -> PlayerResult<SessionSnapshot> {
        session
            .wait_for(
                |s| {
                    matches!(s.state, PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Destroyed)
                },
                self.confirm_timeout,
            )
            .await
            .and_then(|snapshot| match snapshot.state {
                PlaybackState::Destroyed => Err(PlayerError::SessionGone),
                _ => Ok(snapshot),
            })
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().is_destroyed())
            .count()
    }

    /// Techo de volumen de la guild, leído en el momento del store de tenants.
    pub async fn effective_volume_ceiling(&self, guild_id: GuildId) -> u16 {
        let settings = self.settings(guild_id).await;
        policy::volume_ceiling(settings.tier, settings.volume_ceiling)
    }

    pub async fn set_volume(&self, guild_id: GuildId, level: i64) -> PlayerResult<()> {
        let session = self.get(guild_id).ok_or(PlayerError::SessionGone)?;
        let ceiling = self.effective_volume_ceiling(guild_id).await;
        session.set_volume(level, ceiling).await
    }

    /// Entrega un evento a su sesión; los de guilds sin sesión se descartan.
    pub fn route_node_event(&self, node_id: &str, guild_id: GuildId, event: PlayerEvent) {
        match self.get(guild_id) {
            Some(session) => session.post_event(node_id, event),
            None => debug!("Descartando {:?} del nodo {} para guild {} sin sesión", event, node_id, guild_id),
        }
    }

    pub async fn handle_node_event(&self, node_id: &str, event: NodeEvent) {
        match event {
            NodeEvent::Connected => self.pool.on_reconnect(node_id),
            NodeEvent::Disconnected => {
                self.pool.on_disconnect(node_id);
                self.failover(node_id, false).await;
            }
            NodeEvent::Player { guild_id, event } => self.route_node_event(node_id, guild_id, event),
        }
    }

    /// Elimina un nodo para siempre; sus sesiones se mueven o terminan.
    pub async fn remove_node(&self, node_id: &str) -> bool {
        if !self.pool.remove_node(node_id) {
            return false;
        }
        self.failover(node_id, true).await;
        true
    }

    /// Saca todas las sesiones de `node_id`. Sin destino disponible esperan al
    /// nodo o, si se fue para siempre, terminan.
    async fn failover(&self, node_id: &str, destroy_orphans: bool) {
        let affected: Vec<Arc<PlaybackSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().node_id() == node_id)
            .map(|entry| entry.value().clone())
            .collect();
        if affected.is_empty() {
            return;
        }

        warn!("🔀 Moviendo {} sesión(es) fuera del nodo {}", affected.len(), node_id);
        let moves = affected.into_iter().map(|session| async move {
            match self.pool.select_node_for_new_session() {
                Ok(target) => {
                    if let Err(e) = session.rebind(target).await {
                        debug!("Guild {} no se movió: {}", session.guild_id(), e);
                    }
                }
                Err(_) if destroy_orphans => {
                    warn!("⚠️ Sin nodos para guild {}, terminando su sesión", session.guild_id());
                    session.destroy().await;
                }
                Err(_) => debug!(
                    "Guild {} espera a que vuelva el nodo {}",
                    session.guild_id(),
                    node_id
                ),
            }
        });
        futures::future::join_all(moves).await;
    }

    async fn settings(&self, guild_id: GuildId) -> TenantSettings {
        match self.store.settings(guild_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("⚠️ Configuración de guild {} no disponible, usando valores por defecto: {:#}", guild_id, e);
                TenantSettings::default()
            }
        }
    }
}

/// Entrega al registro los eventos de la capa de transporte hasta que el
/// canal se cierre.
pub async fn run_event_loop(registry: Arc<SessionRegistry>, inbound: flume::Receiver<InboundEvent>) {
    while let Ok((node_id, event)) = inbound.recv_async().await {
        registry.handle_node_event(&node_id, event).await;
    }
    info!("📪 Canal de eventos de nodos cerrado");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{policy::Tier, session::PlayOutcome},
        node::{backoff::Backoff, Instruction, NodeConfig, TrackEndReason},
        storage::MockTenantConfigStore,
        test_support::{track, RecordingTransport},
    };
    use pretty_assertions::assert_eq;

    fn guild() -> GuildId {
        GuildId::new(10)
    }

    fn voice() -> ChannelId {
        ChannelId::new(20)
    }

    fn default_store() -> Arc<MockTenantConfigStore> {
        let mut store = MockTenantConfigStore::new();
        store
            .expect_settings()
            .returning(|_| Ok(TenantSettings::default()));
        Arc::new(store)
    }

    fn registry_with(
        nodes: &[&str],
        store: Arc<MockTenantConfigStore>,
    ) -> (SessionRegistry, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new();
        let configs = nodes
            .iter()
            .map(|id| NodeConfig::new(*id, format!("{}:2333", id)))
            .collect();
        let pool = Arc::new(NodePool::new(configs, transport.clone(), Backoff::default()));
        for id in nodes {
            pool.on_reconnect(id);
        }
        (SessionRegistry::new(pool, store, 100), transport)
    }

    #[tokio::test]
    async fn one_session_per_guild_on_least_loaded_node() {
        let (registry, _) = registry_with(&["a", "b"], default_store());
        assert!(registry.get(guild()).is_none());

        let first = registry.get_or_create(guild(), voice()).await.unwrap();
        let again = registry.get_or_create(guild(), voice()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.node_id(), "a");

        let other = registry.get_or_create(GuildId::new(11), voice()).await.unwrap();
        assert_eq!(other.node_id(), "b");
        assert_eq!(registry.active_sessions(), 2);
    }

    #[tokio::test]
    async fn creation_needs_a_connected_node() {
        let (registry, _) = registry_with(&[], default_store());
        assert_eq!(
            registry.get_or_create(guild(), voice()).await.err(),
            Some(PlayerError::NoNodesAvailable)
        );
        assert_eq!(registry.active_sessions(), 0);
    }

    #[tokio::test]
    async fn destroyed_session_is_replaced() {
        let (registry, _) = registry_with(&["a"], default_store());
        let first = registry.get_or_create(guild(), voice()).await.unwrap();
        first.stop().await.unwrap();
        assert!(registry.get(guild()).is_none());

        let second = registry.get_or_create(guild(), voice()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.snapshot().state, PlaybackState::Idle);
        assert_eq!(registry.pool().health().nodes[0].bound_sessions, 1);
    }

    #[tokio::test]
    async fn tenant_settings_shape_new_sessions() {
        let mut store = MockTenantConfigStore::new();
        store.expect_settings().returning(|_| {
            Ok(TenantSettings {
                tier: Tier::Standard,
                volume_ceiling: Some(80),
                default_volume: 120,
            })
        });
        let (registry, _) = registry_with(&["a"], Arc::new(store));

        let session = registry.get_or_create(guild(), voice()).await.unwrap();
        assert_eq!(session.snapshot().volume, 80);
        assert_eq!(registry.effective_volume_ceiling(guild()).await, 80);
        assert!(matches!(
            registry.set_volume(guild(), 81).await,
            Err(PlayerError::OutOfRange { max: 80, .. })
        ));
        registry.set_volume(guild(), 80).await.unwrap();
    }

    #[tokio::test]
    async fn store_failures_fall_back_to_defaults() {
        let mut store = MockTenantConfigStore::new();
        store
            .expect_settings()
            .returning(|_| Err(anyhow::anyhow!("disk unavailable")));
        let (registry, _) = registry_with(&["a"], Arc::new(store));

        let session = registry.get_or_create(guild(), voice()).await.unwrap();
        assert_eq!(session.snapshot().volume, 100);
        assert_eq!(registry.effective_volume_ceiling(guild()).await, 150);
    }

    #[tokio::test]
    async fn premium_tier_reaches_hard_cap() {
        let mut store = MockTenantConfigStore::new();
        store.expect_settings().returning(|_| {
            Ok(TenantSettings {
                tier: Tier::Premium,
                ..TenantSettings::default()
            })
        });
        let (registry, _) = registry_with(&["a"], Arc::new(store));
        registry.get_or_create(guild(), voice()).await.unwrap();

        registry.set_volume(guild(), 200).await.unwrap();
        assert!(registry.set_volume(guild(), 201).await.is_err());
        assert_eq!(
            registry.set_volume(GuildId::new(99), 50).await,
            Err(PlayerError::SessionGone)
        );
    }

    #[tokio::test]
    async fn queue_plays_through_and_session_ends() {
        let (registry, transport) = registry_with(&["a", "b"], default_store());
        let registry = Arc::new(registry);
        let (inbound, receiver) = flume::unbounded();
        tokio::spawn(run_event_loop(registry.clone(), receiver));

        let session = registry.get_or_create(guild(), voice()).await.unwrap();
        let outcome = session.play(track("a", 3_000).into()).await.unwrap();
        assert!(matches!(outcome, PlayOutcome::Started(_)));
        assert_eq!(
            session.play(track("b", 3_000).into()).await.unwrap(),
            PlayOutcome::Queued { position: 0 }
        );

        let player = |event| ("a".to_string(), NodeEvent::Player { guild_id: guild(), event });
        let started = |id: &str, play_id| PlayerEvent::TrackStarted {
            track: id.into(),
            play_id,
        };
        let ended = |id: &str, play_id| PlayerEvent::TrackEnded {
            track: id.into(),
            play_id,
            reason: TrackEndReason::Finished,
        };
        inbound.send(player(started("a", 1))).unwrap();
        inbound.send(player(ended("a", 1))).unwrap();
        inbound.send(player(started("b", 2))).unwrap();

        let playing_b = session
            .wait_for(
                |s| s.state == PlaybackState::Playing && s.current.as_ref().is_some_and(|t| t.identifier == "b"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(playing_b.upcoming.is_empty());

        inbound.send(player(ended("b", 2))).unwrap();
        session
            .wait_for(|s| s.state == PlaybackState::Destroyed, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(registry.get(guild()).is_none());

        let plays: Vec<String> = transport
            .instructions()
            .into_iter()
            .filter_map(|(_, _, i)| match i {
                Instruction::Play { track, .. } => Some(track.identifier),
                _ => None,
            })
            .collect();
        assert_eq!(plays, vec!["a", "b"]);
        assert_eq!(transport.last_instruction(), Some(Instruction::Destroy));
    }

    #[tokio::test]
    async fn start_confirmation_is_bounded() {
        let (registry, _) = registry_with(&["a"], default_store());
        let registry = registry.with_confirm_timeout(Duration::from_millis(20));
        let session = registry.get_or_create(guild(), voice()).await.unwrap();
        session.play(track("a", 3_000).into()).await.unwrap();

        assert_eq!(
            registry.wait_until_started(&session).await.err(),
            Some(PlayerError::Timeout(Duration::from_millis(20)))
        );

        registry.route_node_event(
            "a",
            guild(),
            PlayerEvent::TrackStarted {
                track: "a".into(),
                play_id: 1,
            },
        );
        let snapshot = registry.wait_until_started(&session).await.unwrap();
        assert_eq!(snapshot.state, PlaybackState::Playing);
    }

    #[tokio::test]
    async fn skip_then_final_end_removes_the_session() {
        let (registry, _) = registry_with(&["a"], default_store());
        let session = registry.get_or_create(guild(), voice()).await.unwrap();
        session
            .play_many(vec![track("a", 180_000).into(), track("b", 200_000).into()])
            .await
            .unwrap();
        registry.route_node_event(
            "a",
            guild(),
            PlayerEvent::TrackStarted {
                track: "a".into(),
                play_id: 1,
            },
        );
        registry.wait_until_started(&session).await.unwrap();

        session.skip(1).await.unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.current.unwrap().identifier, "b");
        assert!(snapshot.upcoming.is_empty());

        registry.route_node_event(
            "a",
            guild(),
            PlayerEvent::TrackEnded {
                track: "b".into(),
                play_id: snapshot.play_id,
                reason: TrackEndReason::Finished,
            },
        );
        session
            .wait_for(|s| s.state == PlaybackState::Destroyed, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(registry.get(guild()).is_none());
    }

    #[tokio::test]
    async fn events_for_unknown_guilds_are_dropped() {
        let (registry, transport) = registry_with(&["a"], default_store());
        registry.route_node_event(
            "a",
            guild(),
            PlayerEvent::TrackStarted {
                track: "x".into(),
                play_id: 1,
            },
        );
        assert!(registry.get(guild()).is_none());
        assert!(transport.instructions().is_empty());
    }

    #[tokio::test]
    async fn disconnect_moves_sessions_to_a_healthy_node() {
        let (registry, transport) = registry_with(&["a", "b"], default_store());
        let session = registry.get_or_create(guild(), voice()).await.unwrap();
        session.play(track("song", 60_000).into()).await.unwrap();
        session.handle_event("a", PlayerEvent::PositionUpdate { position_ms: 5_000 }).await;

        registry.handle_node_event("a", NodeEvent::Disconnected).await;

        assert_eq!(session.node_id(), "b");
        let (node, _, instruction) = transport
            .instructions()
            .into_iter()
            .find(|(node, _, i)| node == "b" && matches!(i, Instruction::Play { .. }))
            .unwrap();
        assert_eq!(node, "b");
        assert!(matches!(instruction, Instruction::Play { start_ms: 5_000, .. }));
    }

    #[tokio::test]
    async fn sessions_wait_when_no_node_is_left() {
        let (registry, _) = registry_with(&["a"], default_store());
        let session = registry.get_or_create(guild(), voice()).await.unwrap();
        session.play(track("song", 60_000).into()).await.unwrap();

        registry.handle_node_event("a", NodeEvent::Disconnected).await;
        assert_eq!(session.node_id(), "a");
        assert!(!session.is_destroyed());
        assert_eq!(
            session.seek(1_000).await,
            Err(PlayerError::NodeUnavailable("a".into()))
        );

        registry.handle_node_event("a", NodeEvent::Connected).await;
        session.seek(1_000).await.unwrap();
    }

    #[tokio::test]
    async fn removing_the_last_node_ends_its_sessions() {
        let (registry, _) = registry_with(&["a"], default_store());
        let session = registry.get_or_create(guild(), voice()).await.unwrap();

        assert!(registry.remove_node("a").await);
        assert!(session.is_destroyed());
        assert_eq!(registry.active_sessions(), 0);
        assert!(!registry.remove_node("a-typo").await);
    }

    #[tokio::test]
    async fn remove_tears_down() {
        let (registry, transport) = registry_with(&["a"], default_store());
        let session = registry.get_or_create(guild(), voice()).await.unwrap();

        assert!(registry.remove(guild()).await);
        assert!(session.is_destroyed());
        assert!(!registry.remove(guild()).await);
        assert_eq!(transport.last_instruction(), Some(Instruction::Destroy));
    }
}
