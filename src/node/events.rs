use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;

use crate::node::NodeId;

/// Motivo por el que el nodo reporta que un track se detuvo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Sólo los fines naturales y los fallos de carga avanzan la cola; el resto
    /// son consecuencia de una instrucción ya aplicada.
    pub fn may_start_next(self) -> bool {
        matches!(self, TrackEndReason::Finished | TrackEndReason::LoadFailed)
    }
}

/// Eventos por guild que reporta el nodo que la reproduce. `play_id` es el
/// que llevaba la instrucción de play correspondiente.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlayerEvent {
    TrackStarted {
        track: String,
        play_id: u64,
    },
    TrackEnded {
        track: String,
        play_id: u64,
        reason: TrackEndReason,
    },
    TrackException { track: String, message: String },
    PositionUpdate { position_ms: u64 },
}

/// Todo lo que la capa de transporte reporta sobre un nodo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connected,
    Disconnected,
    Player { guild_id: GuildId, event: PlayerEvent },
}

/// Tuplas `(nodo, evento)` que la capa de transporte entrega al registro.
pub type InboundEvent = (NodeId, NodeEvent);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_natural_ends_advance() {
        assert!(TrackEndReason::Finished.may_start_next());
        assert!(TrackEndReason::LoadFailed.may_start_next());
        assert!(!TrackEndReason::Stopped.may_start_next());
        assert!(!TrackEndReason::Replaced.may_start_next());
        assert!(!TrackEndReason::Cleanup.may_start_next());
    }

    #[test]
    fn player_events_use_node_wire_names() {
        let event: PlayerEvent = serde_json::from_str(
            r#"{"type":"trackEnded","track":"abc","play_id":3,"reason":"loadFailed"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            PlayerEvent::TrackEnded {
                track: "abc".into(),
                play_id: 3,
                reason: TrackEndReason::LoadFailed
            }
        );
    }
}
