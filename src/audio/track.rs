use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::time::Duration;

/// Metadatos de un track que el nodo de audio sabe reproducir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub identifier: String,
    pub title: String,
    pub author: Option<String>,
    /// `None` para streams en vivo, que no tienen fin.
    pub duration_ms: Option<u64>,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

impl TrackInfo {
    pub fn new(identifier: impl Into<String>, title: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            author: None,
            duration_ms: None,
            uri: None,
            artwork_url: None,
            requested_by,
            added_at: Utc::now(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Los nodos reportan los streams con duración cero, así que se toma como en vivo.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = (duration_ms > 0).then_some(duration_ms);
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_artwork(mut self, artwork_url: impl Into<String>) -> Self {
        self.artwork_url = Some(artwork_url.into());
        self
    }

    pub fn is_live(&self) -> bool {
        self.duration_ms.is_none()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// Track conocido sólo por su identificador, p. ej. una entrada de playlist importada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTrack {
    pub identifier: String,
    pub requested_by: UserId,
}

impl PendingTrack {
    pub fn new(identifier: impl Into<String>, requested_by: UserId) -> Self {
        Self {
            identifier: identifier.into(),
            requested_by,
        }
    }
}

/// Entrada de la cola: resuelta, o a la espera de que el nodo la resuelva.
///
/// Todo lo que depende de la duración (límites de seek, progreso) sólo ve
/// [`TrackInfo`]; una entrada pendiente se resuelve antes de ser la actual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Track {
    Resolved(TrackInfo),
    Pending(PendingTrack),
}

impl Track {
    pub fn identifier(&self) -> &str {
        match self {
            Track::Resolved(info) => &info.identifier,
            Track::Pending(pending) => &pending.identifier,
        }
    }

    pub fn requested_by(&self) -> UserId {
        match self {
            Track::Resolved(info) => info.requested_by,
            Track::Pending(pending) => pending.requested_by,
        }
    }

    pub fn as_resolved(&self) -> Option<&TrackInfo> {
        match self {
            Track::Resolved(info) => Some(info),
            Track::Pending(_) => None,
        }
    }

    /// Duración finita conocida; las entradas pendientes y en vivo dan `None`.
    pub fn duration_ms(&self) -> Option<u64> {
        self.as_resolved().and_then(|info| info.duration_ms)
    }
}

impl From<TrackInfo> for Track {
    fn from(info: TrackInfo) -> Self {
        Track::Resolved(info)
    }
}

impl From<PendingTrack> for Track {
    fn from(pending: PendingTrack) -> Self {
        Track::Pending(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_is_live() {
        let track = TrackInfo::new("abc", "Radio", UserId::new(1)).with_duration_ms(0);
        assert!(track.is_live());
        assert_eq!(track.duration(), None);

        let track = track.with_duration_ms(180_000);
        assert!(!track.is_live());
        assert_eq!(track.duration(), Some(Duration::from_secs(180)));
    }

    #[test]
    fn pending_tracks_have_no_duration() {
        let track: Track = PendingTrack::new("spotify:track:1", UserId::new(7)).into();
        assert_eq!(track.identifier(), "spotify:track:1");
        assert_eq!(track.requested_by(), UserId::new(7));
        assert_eq!(track.duration_ms(), None);
        assert!(track.as_resolved().is_none());
    }
}
