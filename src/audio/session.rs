use dashmap::DashMap;
use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        queue::{LoopMode, MusicQueue},
        time,
        track::{Track, TrackInfo},
    },
    error::{PlayerError, PlayerResult},
    node::{Instruction, NodeId, NodePool, PlayerEvent, TrackEndReason},
};

/// Límite duro de volumen; los techos por tier nunca lo superan.
pub const MAX_VOLUME: u16 = 200;

/// Sesiones vivas por guild. La comparten el registro y las propias sesiones
/// para que una sesión pueda retirarse sola al terminar.
pub type SessionMap = DashMap<GuildId, Arc<PlaybackSession>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    /// Instrucción de play enviada, el nodo aún no confirmó el inicio.
    Connecting,
    Playing,
    Paused,
    Destroyed,
}

impl PlaybackState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Connecting => "connecting",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Destroyed => "destroyed",
        }
    }
}

/// Copia consistente de una sesión, publicada tras cada mutación.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub guild_id: GuildId,
    pub node_id: NodeId,
    pub voice_channel: ChannelId,
    pub current: Option<TrackInfo>,
    pub upcoming: Vec<Track>,
    pub loop_mode: LoopMode,
    pub volume: u16,
    pub paused: bool,
    /// Último offset reportado por el nodo, nunca extrapolado.
    pub position_ms: u64,
    /// Generación de la reproducción actual. Sube con cada inicio de track
    /// (incluidos loops y reanudaciones tras failover); 0 antes del primero.
    pub play_id: u64,
    pub state: PlaybackState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    Started(TrackInfo),
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipOutcome {
    Advanced {
        skipped: usize,
        now_playing: TrackInfo,
    },
    /// No queda nada por reproducir; la sesión ya no existe.
    Finished { skipped: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NowPlaying {
    pub track: TrackInfo,
    pub position_ms: u64,
    pub paused: bool,
}

pub(crate) struct SessionParams {
    pub guild_id: GuildId,
    pub node_id: NodeId,
    pub voice_channel: ChannelId,
    pub volume: u16,
    pub max_queue_size: usize,
}

struct SessionState {
    node_id: NodeId,
    voice_channel: ChannelId,
    current: Option<TrackInfo>,
    queue: MusicQueue,
    loop_mode: LoopMode,
    volume: u16,
    paused: bool,
    position_ms: u64,
    play_id: u64,
    state: PlaybackState,
}

impl SessionState {
    fn snapshot(&self, guild_id: GuildId) -> SessionSnapshot {
        SessionSnapshot {
            guild_id,
            node_id: self.node_id.clone(),
            voice_channel: self.voice_channel,
            current: self.current.clone(),
            upcoming: self.queue.to_vec(),
            loop_mode: self.loop_mode,
            volume: self.volume,
            paused: self.paused,
            position_ms: self.position_ms,
            play_id: self.play_id,
            state: self.state,
        }
    }

    fn ensure_alive(&self) -> PlayerResult<()> {
        if self.state == PlaybackState::Destroyed {
            Err(PlayerError::SessionGone)
        } else {
            Ok(())
        }
    }

    fn current_for(&self, operation: &'static str) -> PlayerResult<TrackInfo> {
        self.current.clone().ok_or(PlayerError::InvalidState {
            operation,
            state: self.state.as_str(),
        })
    }

    /// Un evento del nodo sólo cuenta si habla de la reproducción en curso.
    fn is_current_play(&self, play_id: u64) -> bool {
        self.current.is_some() && self.play_id == play_id
    }
}

enum Advance {
    Started(TrackInfo),
    Exhausted,
    /// El nodo se cayó a mitad del avance; la cola se conserva para después.
    Stalled,
}

/// Reproductor de una guild.
///
/// Las mutaciones (comandos y eventos del nodo por igual) se serializan en un
/// mutex async, así un skip y un fin de track nunca se intercalan. Los
/// lectores usan el [`SessionSnapshot`] publicado y nunca esperan una mutación.
pub struct PlaybackSession {
    guild_id: GuildId,
    inner: Mutex<SessionState>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: flume::Sender<(NodeId, PlayerEvent)>,
    pool: Arc<NodePool>,
    sessions: Weak<SessionMap>,
}

impl PlaybackSession {
    /// Construye la sesión y su worker de eventos. Requiere un runtime de tokio.
    pub(crate) fn spawn(params: SessionParams, pool: Arc<NodePool>, sessions: Weak<SessionMap>) -> Arc<Self> {
        let state = SessionState {
            node_id: params.node_id,
            voice_channel: params.voice_channel,
            current: None,
            queue: MusicQueue::new(params.max_queue_size),
            loop_mode: LoopMode::Off,
            volume: params.volume.min(MAX_VOLUME),
            paused: false,
            position_ms: 0,
            play_id: 0,
            state: PlaybackState::Idle,
        };
        let (snapshot, _) = watch::channel(state.snapshot(params.guild_id));
        let (events, inbox) = flume::unbounded();

        let session = Arc::new(Self {
            guild_id: params.guild_id,
            inner: Mutex::new(state),
            snapshot,
            events,
            pool,
            sessions,
        });
        tokio::spawn(run_inbox(Arc::downgrade(&session), inbox));
        session
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn node_id(&self) -> NodeId {
        self.snapshot.borrow().node_id.clone()
    }

    /// Se vuelve `true` antes de que la sesión salga del mapa.
    pub fn is_destroyed(&self) -> bool {
        self.snapshot.borrow().state == PlaybackState::Destroyed
    }

    /// Reproduce `track` si no hay nada sonando, si no lo agrega a la cola.
    pub async fn play(&self, track: Track) -> PlayerResult<PlayOutcome> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;

        if state.current.is_some() {
            let position = state.queue.enqueue(track)?;
            self.publish(&state);
            return Ok(PlayOutcome::Queued { position });
        }

        self.ensure_node(&state)?;
        let outcome = if state.queue.is_empty() {
            let node_id = state.node_id.clone();
            let info = self.resolve(&node_id, track).await?;
            self.start_track(&mut state, info.clone(), 0);
            PlayOutcome::Started(info)
        } else {
            // Inactiva con cola pendiente: el nuevo track va detrás
            let position = state.queue.enqueue(track)?;
            match self.advance(&mut state).await {
                Advance::Started(info) => PlayOutcome::Started(info),
                Advance::Exhausted | Advance::Stalled => PlayOutcome::Queued { position },
            }
        };

        self.publish(&state);
        Ok(outcome)
    }

    /// Agrega un lote e inicia el primero si la sesión está inactiva.
    /// Devuelve cuántos tracks se aceptaron.
    pub async fn play_many(&self, tracks: Vec<Track>) -> PlayerResult<usize> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;

        let mut tracks = tracks.into_iter();
        let mut started = 0;
        if state.current.is_none() && state.queue.is_empty() {
            if let Some(first) = tracks.next() {
                self.ensure_node(&state)?;
                let node_id = state.node_id.clone();
                let info = self.resolve(&node_id, first).await?;
                self.start_track(&mut state, info, 0);
                started = 1;
            }
        }

        let added = state.queue.enqueue_many(tracks.collect());
        self.publish(&state);
        Ok(started + added)
    }

    /// Devuelve `false` si la sesión ya estaba en el estado pedido.
    pub async fn pause(&self, paused: bool) -> PlayerResult<bool> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;
        if state.state == PlaybackState::Idle {
            return Err(PlayerError::InvalidState {
                operation: if paused { "pause" } else { "resume" },
                state: state.state.as_str(),
            });
        }
        if state.paused == paused {
            return Ok(false);
        }

        self.ensure_node(&state)?;
        self.dispatch(&state, Instruction::Pause(paused))?;
        state.paused = paused;
        if matches!(state.state, PlaybackState::Playing | PlaybackState::Paused) {
            state.state = if paused {
                PlaybackState::Paused
            } else {
                PlaybackState::Playing
            };
        }

        info!(
            "{} Guild {} {}",
            if paused { "⏸️" } else { "▶️" },
            self.guild_id,
            if paused { "en pausa" } else { "reanudada" }
        );
        self.publish(&state);
        Ok(true)
    }

    pub async fn resume(&self) -> PlayerResult<bool> {
        self.pause(false).await
    }

    /// Termina el track actual más `count - 1` de los siguientes.
    pub async fn skip(&self, count: usize) -> PlayerResult<SkipOutcome> {
        let snapshot = self.snapshot.borrow();
        let observed = snapshot.current.is_some().then_some(snapshot.play_id);
        drop(snapshot);
        self.skip_observed(observed, count).await
    }

    /// Skip relativo a la reproducción que vio quien lo pide (`play_id` de su
    /// snapshot). Si un fin natural ya la dejó atrás, ese avance cuenta como
    /// uno de los saltos.
    pub async fn skip_observed(&self, observed: Option<u64>, count: usize) -> PlayerResult<SkipOutcome> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;
        let current = state.current_for("skip")?;
        self.ensure_node(&state)?;

        let mut count = count.max(1);
        if observed.is_some_and(|play_id| play_id != state.play_id) {
            count -= 1;
        }
        if count == 0 {
            debug!("⏭️ Skip en guild {} ya cubierto por un fin de track", self.guild_id);
            return Ok(SkipOutcome::Advanced {
                skipped: 0,
                now_playing: current,
            });
        }

        let skipped = state.queue.drop_front(count - 1) + 1;
        if state.loop_mode == LoopMode::Queue {
            state.queue.requeue(current.clone().into());
        }
        info!("⏭️ Saltando {} canciones en guild {}", skipped, self.guild_id);

        let outcome = match self.advance(&mut state).await {
            Advance::Started(now_playing) => SkipOutcome::Advanced {
                skipped,
                now_playing,
            },
            Advance::Exhausted if state.loop_mode == LoopMode::Track => {
                self.start_track(&mut state, current.clone(), 0);
                SkipOutcome::Advanced {
                    skipped,
                    now_playing: current,
                }
            }
            Advance::Exhausted => {
                self.destroy_locked(&mut state);
                return Ok(SkipOutcome::Finished { skipped });
            }
            Advance::Stalled => {
                state.current = None;
                state.state = PlaybackState::Idle;
                self.publish(&state);
                return Err(PlayerError::NodeUnavailable(state.node_id.clone()));
            }
        };

        self.publish(&state);
        Ok(outcome)
    }

    /// `ceiling` viene de la política de acceso; 200 se aplica siempre.
    pub async fn set_volume(&self, level: i64, ceiling: u16) -> PlayerResult<()> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;

        let max = ceiling.min(MAX_VOLUME);
        if !(0..=max as i64).contains(&level) {
            return Err(PlayerError::out_of_range("volume", level, 0, max as i64));
        }
        let level = level as u16;

        self.ensure_node(&state)?;
        self.dispatch(&state, Instruction::Volume(level))?;
        state.volume = level;

        info!("🔊 Volumen de guild {} ajustado a {}%", self.guild_id, level);
        self.publish(&state);
        Ok(())
    }

    pub async fn set_loop(&self, mode: LoopMode) -> PlayerResult<()> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;
        state.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Loop desactivado en guild {}", self.guild_id),
            LoopMode::Track => info!("🔂 Loop de canción activado en guild {}", self.guild_id),
            LoopMode::Queue => info!("🔁 Loop de cola activado en guild {}", self.guild_id),
        }
        self.publish(&state);
        Ok(())
    }

    /// Los tracks en vivo aceptan cualquier offset no negativo.
    pub async fn seek(&self, position_ms: i64) -> PlayerResult<()> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;
        let current = state.current_for("seek")?;

        let max = current.duration_ms.map_or(i64::MAX, |d| d as i64);
        if !(0..=max).contains(&position_ms) {
            return Err(PlayerError::out_of_range("position", position_ms, 0, max));
        }

        self.ensure_node(&state)?;
        self.dispatch(&state, Instruction::Seek(position_ms as u64))?;
        state.position_ms = position_ms as u64;

        debug!("⏩ Guild {} adelantada a {}", self.guild_id, time::format_time(state.position_ms));
        self.publish(&state);
        Ok(())
    }

    /// Detiene la reproducción y destruye la sesión.
    pub async fn stop(&self) -> PlayerResult<()> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;
        if self.pool.is_connected(&state.node_id) {
            self.dispatch_or_warn(&state, Instruction::Stop);
        }
        self.destroy_locked(&mut state);
        Ok(())
    }

    pub(crate) async fn destroy(&self) {
        let mut state = self.inner.lock().await;
        self.destroy_locked(&mut state);
    }

    /// Mueve la sesión a otro nodo y retoma donde iba.
    pub(crate) async fn rebind(&self, node_id: NodeId) -> PlayerResult<()> {
        let mut state = self.inner.lock().await;
        state.ensure_alive()?;
        if state.node_id == node_id {
            return Ok(());
        }

        let previous = std::mem::replace(&mut state.node_id, node_id.clone());
        self.pool.bind(&node_id);
        self.pool.release(&previous);
        info!(
            "🔀 Guild {} movida del nodo {} al nodo {}",
            self.guild_id, previous, node_id
        );

        if let Some(current) = state.current.clone() {
            let position = state.position_ms;
            self.start_track(&mut state, current, position);
        } else if !state.queue.is_empty() {
            self.advance(&mut state).await;
        }
        if state.current.is_some() && state.paused {
            self.dispatch_or_warn(&state, Instruction::Pause(true));
        }
        self.dispatch_or_warn(&state, Instruction::Volume(state.volume));

        self.publish(&state);
        Ok(())
    }

    /// Encola un evento del nodo para el worker de esta sesión.
    pub(crate) fn post_event(&self, node_id: &str, event: PlayerEvent) {
        let _ = self.events.send((node_id.to_string(), event));
    }

    /// Aplica un evento del nodo por el mismo camino serializado que los comandos.
    pub async fn handle_event(&self, node_id: &str, event: PlayerEvent) {
        let mut state = self.inner.lock().await;
        if state.state == PlaybackState::Destroyed {
            return;
        }
        if state.node_id != node_id {
            debug!(
                "Descartando {:?} del nodo {} para guild {} (asignada a {})",
                event, node_id, self.guild_id, state.node_id
            );
            return;
        }

        match event {
            PlayerEvent::TrackStarted { track, play_id } => {
                if !state.is_current_play(play_id) {
                    debug!("Ignorando inicio obsoleto de {} (#{}) en guild {}", track, play_id, self.guild_id);
                    return;
                }
                state.state = if state.paused {
                    PlaybackState::Paused
                } else {
                    PlaybackState::Playing
                };
            }
            PlayerEvent::PositionUpdate { position_ms } => {
                if state.current.is_none() {
                    return;
                }
                state.position_ms = position_ms;
            }
            PlayerEvent::TrackException { track, message } => {
                warn!("⚠️ Falló el track {} en guild {}: {}", track, self.guild_id, message);
                return;
            }
            PlayerEvent::TrackEnded { track, play_id, reason } => {
                if !state.is_current_play(play_id) {
                    debug!("Ignorando fin obsoleto de {} (#{}) en guild {}", track, play_id, self.guild_id);
                    return;
                }
                if !reason.may_start_next() {
                    debug!("Track {} terminó ({:?}) en guild {}", track, reason, self.guild_id);
                    return;
                }
                self.on_track_end(&mut state, reason).await;
                if state.state == PlaybackState::Destroyed {
                    return;
                }
            }
        }

        self.publish(&state);
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        let snapshot = self.snapshot.borrow();
        snapshot.current.as_ref().map(|track| NowPlaying {
            track: track.clone(),
            position_ms: snapshot.position_ms,
            paused: snapshot.paused,
        })
    }

    pub fn progress_bar(&self, width: usize) -> Option<String> {
        self.now_playing().map(|np| {
            format!(
                "{} {}",
                time::progress_bar(np.position_ms, np.track.duration_ms, width),
                time::format_progress(np.position_ms, np.track.duration_ms)
            )
        })
    }

    /// Espera a que un snapshot publicado cumpla `predicate`, por ejemplo la
    /// confirmación de inicio del nodo.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
        timeout: Duration,
    ) -> PlayerResult<SessionSnapshot> {
        let mut receiver = self.snapshot.subscribe();
        let result = match tokio::time::timeout(timeout, receiver.wait_for(|s| predicate(s))).await {
            Ok(Ok(snapshot)) => Ok((*snapshot).clone()),
            Ok(Err(_)) => Err(PlayerError::SessionGone),
            Err(_) => Err(PlayerError::Timeout(timeout)),
        };
        result
    }

    async fn on_track_end(&self, state: &mut SessionState, reason: TrackEndReason) {
        let Some(finished) = state.current.clone() else {
            return;
        };

        // Un track que no cargó no se repite
        if state.loop_mode == LoopMode::Track && reason == TrackEndReason::Finished {
            self.start_track(state, finished, 0);
            return;
        }
        if state.loop_mode == LoopMode::Queue && reason == TrackEndReason::Finished {
            state.queue.requeue(finished.into());
        }

        match self.advance(state).await {
            Advance::Started(_) => {}
            Advance::Exhausted => {
                state.current = None;
                state.state = PlaybackState::Idle;
                info!("📭 Cola vacía en guild {}", self.guild_id);
                self.destroy_locked(state);
            }
            Advance::Stalled => {
                state.current = None;
                state.state = PlaybackState::Idle;
            }
        }
    }

    async fn advance(&self, state: &mut SessionState) -> Advance {
        while let Ok(next) = state.queue.shift() {
            let node_id = state.node_id.clone();
            match self.resolve(&node_id, next.clone()).await {
                Ok(info) => {
                    self.start_track(state, info.clone(), 0);
                    return Advance::Started(info);
                }
                Err(PlayerError::NodeUnavailable(_)) => {
                    state.queue.restore_front(next);
                    return Advance::Stalled;
                }
                Err(e) => warn!("⚠️ Descartando track irreproducible en guild {}: {}", self.guild_id, e),
            }
        }
        Advance::Exhausted
    }

    async fn resolve(&self, node_id: &str, track: Track) -> PlayerResult<TrackInfo> {
        match track {
            Track::Resolved(info) => Ok(info),
            Track::Pending(pending) => self.pool.resolve(node_id, &pending).await,
        }
    }

    fn start_track(&self, state: &mut SessionState, track: TrackInfo, start_ms: u64) {
        state.play_id += 1;
        state.current = Some(track.clone());
        state.position_ms = start_ms;
        state.state = PlaybackState::Connecting;

        info!("🎵 Reproduciendo {} en guild {}", track.title, self.guild_id);
        let play_id = state.play_id;
        self.dispatch_or_warn(
            state,
            Instruction::Play {
                track,
                start_ms,
                play_id,
            },
        );
    }

    fn destroy_locked(&self, state: &mut SessionState) {
        if state.state == PlaybackState::Destroyed {
            return;
        }

        state.state = PlaybackState::Destroyed;
        state.current = None;
        state.queue.clear();
        state.position_ms = 0;
        // Publicar antes de salir del mapa: quien aún vea la entrada la trata como ausente
        self.publish(state);

        if let Some(sessions) = self.sessions.upgrade() {
            sessions.remove_if(&self.guild_id, |_, session| std::ptr::eq(Arc::as_ptr(session), self));
        }
        if self.pool.is_connected(&state.node_id) {
            self.dispatch_or_warn(state, Instruction::Destroy);
        }
        self.pool.release(&state.node_id);
        info!("👋 Sesión de guild {} destruida", self.guild_id);
    }

    fn ensure_node(&self, state: &SessionState) -> PlayerResult<()> {
        if self.pool.is_connected(&state.node_id) {
            Ok(())
        } else {
            Err(PlayerError::NodeUnavailable(state.node_id.clone()))
        }
    }

    fn dispatch(&self, state: &SessionState, instruction: Instruction) -> PlayerResult<()> {
        self.pool.dispatch(&state.node_id, self.guild_id, instruction)
    }

    /// Para instrucciones cuyo fallo no debe abortar la operación en curso.
    fn dispatch_or_warn(&self, state: &SessionState, instruction: Instruction) {
        let name = instruction.name();
        if let Err(e) = self.dispatch(state, instruction) {
            warn!(
                "⚠️ Instrucción {} para guild {} no entregada al nodo {}: {}",
                name, self.guild_id, state.node_id, e
            );
        }
    }

    fn publish(&self, state: &SessionState) {
        self.snapshot.send_replace(state.snapshot(self.guild_id));
    }
}

async fn run_inbox(session: Weak<PlaybackSession>, inbox: flume::Receiver<(NodeId, PlayerEvent)>) {
    while let Ok((node_id, event)) = inbox.recv_async().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_event(&node_id, event).await;
    }
}
