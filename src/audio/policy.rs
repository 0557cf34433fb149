use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::time::Duration;
use tokio::time::Instant;

use crate::audio::session::{SessionSnapshot, MAX_VOLUME};
use crate::error::{PlayerError, PlayerResult};

pub const STANDARD_VOLUME_CEILING: u16 = 150;
pub const PREMIUM_VOLUME_CEILING: u16 = MAX_VOLUME;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Standard,
    Premium,
}

pub fn tier_ceiling(tier: Tier) -> u16 {
    match tier {
        Tier::Standard => STANDARD_VOLUME_CEILING,
        Tier::Premium => PREMIUM_VOLUME_CEILING,
    }
}

/// Techo de volumen de un tenant. El ajuste por guild sólo puede bajar el
/// techo del tier, nunca subirlo.
pub fn volume_ceiling(tier: Tier, guild_override: Option<u16>) -> u16 {
    let base = tier_ceiling(tier);
    guild_override.map_or(base, |ceiling| ceiling.min(base))
}

/// Sólo quien está en el canal de voz de la sesión puede controlarla.
pub fn can_control(user_channel: Option<ChannelId>, session: &SessionSnapshot) -> bool {
    user_channel == Some(session.voice_channel)
}

pub fn ensure_can_control(user_channel: Option<ChannelId>, session: &SessionSnapshot) -> PlayerResult<()> {
    if can_control(user_channel, session) {
        Ok(())
    } else {
        Err(PlayerError::PermissionDenied)
    }
}

/// Límite de skips por usuario dentro de una guild. Las marcas vencidas se
/// descartan en cada consulta, así el mapa no crece con sesiones ya cerradas.
pub struct SkipCooldown {
    cooldown: Duration,
    last_skip: DashMap<(GuildId, UserId), Instant>,
}

impl SkipCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_skip: DashMap::new(),
        }
    }

    /// Registra el skip si está permitido, si no informa cuánto esperar.
    pub fn check_and_record(&self, guild_id: GuildId, user_id: UserId) -> PlayerResult<()> {
        let now = Instant::now();
        self.evict_expired(now);
        match self.last_skip.entry((guild_id, user_id)) {
            Entry::Occupied(mut last) => {
                let elapsed = now.saturating_duration_since(*last.get());
                if elapsed < self.cooldown {
                    return Err(PlayerError::RateLimited {
                        retry_after: self.cooldown - elapsed,
                    });
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        Ok(())
    }

    pub fn forget_guild(&self, guild_id: GuildId) {
        self.last_skip.retain(|(guild, _), _| *guild != guild_id);
    }

    /// Usuarios con un skip aún dentro de la ventana.
    pub fn tracked(&self) -> usize {
        self.last_skip.len()
    }

    fn evict_expired(&self, now: Instant) {
        self.last_skip
            .retain(|_, last| now.saturating_duration_since(*last) < self.cooldown);
    }
}
