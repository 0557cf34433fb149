//! # Audio Module
//!
//! Per-guild playback orchestration on top of the node pool.
//!
//! ## Architecture
//!
//! ### [`session`] - Playback Session
//! - One state machine per guild: idle, connecting, playing, paused, destroyed
//! - Commands and node events are applied one at a time, in arrival order
//! - Snapshots are published after every change for lock-free reads
//!
//! ### [`registry`] - Session Registry
//! - At most one live session per guild
//! - Routes node events and moves sessions off failed nodes
//!
//! ### [`queue`] - Queue Management
//! - Bounded FIFO with loop modes, shuffle, reordering and paging
//!
//! ### [`policy`] - Access & Quota
//! - Voice-channel control rule, tier volume ceilings, skip cooldown
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_orchestrator::audio::{registry::SessionRegistry, track::TrackInfo};
//! use serenity::model::id::{ChannelId, GuildId, UserId};
//!
//! # async fn example(registry: &SessionRegistry) -> anyhow::Result<()> {
//! let session = registry
//!     .get_or_create(GuildId::new(1), ChannelId::new(2))
//!     .await?;
//!
//! let track = TrackInfo::new("dQw4w9WgXcQ", "Never Gonna Give You Up", UserId::new(3))
//!     .with_duration_ms(213_000);
//! session.play(track.into()).await?;
//! session.pause(true).await?;
//! session.skip(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod policy;
pub mod queue;
pub mod registry;
pub mod session;
pub mod time;
pub mod track;
