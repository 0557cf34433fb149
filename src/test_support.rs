use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{GuildId, UserId};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::audio::track::{PendingTrack, TrackInfo};
use crate::node::{
    transport::{Instruction, NodeConfig, NodeTransport},
    NodeId,
};

/// Transporte de prueba que registra cada instrucción y resuelve cualquier
/// identificador que no empiece con `bad` como un track de dos minutos.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(NodeId, GuildId, Instruction)>>,
    failing_connects: AtomicUsize,
    connect_calls: AtomicUsize,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn instructions(&self) -> Vec<(NodeId, GuildId, Instruction)> {
        self.sent.lock().clone()
    }

    pub(crate) fn last_instruction(&self) -> Option<Instruction> {
        self.sent.lock().last().map(|(_, _, instruction)| instruction.clone())
    }

    pub(crate) fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl NodeTransport for RecordingTransport {
    async fn connect(&self, _node: &NodeConfig) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            bail!("connection refused");
        }
        Ok(())
    }

    fn dispatch(&self, node_id: &str, guild_id: GuildId, instruction: Instruction) -> Result<()> {
        self.sent.lock().push((node_id.to_string(), guild_id, instruction));
        Ok(())
    }

    async fn resolve(&self, _node_id: &str, track: &PendingTrack) -> Result<TrackInfo> {
        if track.identifier.starts_with("bad") {
            bail!("no matches");
        }
        Ok(TrackInfo::new(
            track.identifier.clone(),
            format!("Resolved {}", track.identifier),
            track.requested_by,
        )
        .with_duration_ms(120_000))
    }
}

pub(crate) fn track(identifier: &str, duration_ms: u64) -> TrackInfo {
    TrackInfo::new(identifier, identifier.to_uppercase(), UserId::new(1)).with_duration_ms(duration_ms)
}
