use anyhow::{anyhow, Result};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use open_music_orchestrator::{
    audio::registry::{run_event_loop, SessionRegistry},
    config::Config,
    node::{ChannelTransport, InboundEvent, NodePool, Outbound},
    storage::JsonStorage,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_orchestrator=debug".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    if std::env::args().any(|arg| arg == "--health-check") {
        println!("OK");
        return Ok(());
    }
    info!("{}", config.summary());

    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);

    let (transport, outbound) = ChannelTransport::new(config.probe_timeout());
    let pool = Arc::new(NodePool::new(
        config.nodes.clone(),
        Arc::new(transport),
        config.backoff(),
    ));
    pool.connect_all();

    let registry = Arc::new(
        SessionRegistry::new(pool, storage, config.max_queue_size)
            .with_confirm_timeout(config.event_confirm_timeout())
            .with_skip_cooldown(config.skip_cooldown()),
    );

    // TODO: entregar `inbound` al cliente websocket de nodos cuando se integre;
    // hasta entonces ningún productor envía eventos y el bucle sólo espera.
    let (inbound, events) = flume::unbounded::<InboundEvent>();
    tokio::spawn(run_event_loop(registry.clone(), events));
    tokio::spawn(drain_outbound(outbound));
    tokio::spawn(log_health(registry.clone(), config.health_log_interval()));

    info!("🚀 Orquestador en ejecución");
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de apagado recibida, cerrando...");
    drop(inbound);

    Ok(())
}

/// Consumidor provisional del tráfico saliente mientras no hay cliente de nodos.
async fn drain_outbound(outbound: flume::Receiver<Outbound>) {
    while let Ok(message) = outbound.recv_async().await {
        match message {
            Outbound::Instruction {
                node_id,
                guild_id,
                instruction,
            } => debug!("📤 nodo {} guild {}: {:?}", node_id, guild_id, instruction),
            Outbound::Resolve {
                node_id,
                track,
                reply,
            } => {
                warn!("⚠️ No se puede resolver {} en el nodo {}: sin cliente de nodos", track.identifier, node_id);
                let _ = reply.send(Err(anyhow!("sin cliente de nodos conectado")));
            }
        }
    }
}

async fn log_health(registry: Arc<SessionRegistry>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let health = registry.pool().health();
        if let Some(since) = health.no_connected_since {
            warn!("🚨 Ningún nodo de audio conectado desde {}", since);
        }
        match serde_json::to_string(&health) {
            Ok(json) => info!(
                "📊 {} sesión(es) activa(s), pool: {}",
                registry.active_sessions(),
                json
            ),
            Err(e) => warn!("⚠️ No se pudo serializar la salud del pool: {}", e),
        }
    }
}
