use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use crate::audio::track::Track;
use crate::error::{PlayerError, PlayerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl LoopMode {
    /// off -> track -> queue -> off, igual que el botón de loop.
    pub fn next(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Track,
            LoopMode::Track => LoopMode::Queue,
            LoopMode::Queue => LoopMode::Off,
        }
    }
}

/// Tracks pendientes de una sesión, en orden de reproducción.
///
/// No tiene lock propio: la sesión dueña serializa cada mutación.
#[derive(Debug, Clone)]
pub struct MusicQueue {
    items: VecDeque<Track>,
    max_size: usize,
}

impl MusicQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un track y devuelve su posición (desde 0).
    pub fn enqueue(&mut self, track: Track) -> PlayerResult<usize> {
        if self.items.len() >= self.max_size {
            return Err(PlayerError::QueueFull(self.max_size));
        }

        debug!("➕ Agregado a la cola: {}", track.identifier());
        self.items.push_back(track);
        Ok(self.items.len() - 1)
    }

    /// Agrega todos los tracks que quepan, en orden. Devuelve cuántos entraron.
    pub fn enqueue_many(&mut self, tracks: Vec<Track>) -> usize {
        let available_space = self.max_size.saturating_sub(self.items.len());
        let to_add = tracks.len().min(available_space);

        self.items.extend(tracks.into_iter().take(to_add));
        debug!("➕ {} tracks agregados a la cola", to_add);
        to_add
    }

    pub fn peek_next(&self) -> Option<&Track> {
        self.items.front()
    }

    pub fn shift(&mut self) -> PlayerResult<Track> {
        self.items.pop_front().ok_or(PlayerError::Empty)
    }

    pub fn remove_at(&mut self, index: usize) -> PlayerResult<Track> {
        let len = self.items.len();
        self.items
            .remove(index)
            .ok_or_else(|| PlayerError::out_of_range("queue index", index as i64, 0, len as i64 - 1))
    }

    /// Quita hasta `amount` tracks del frente y devuelve cuántos salieron.
    pub fn drop_front(&mut self, amount: usize) -> usize {
        let dropped = amount.min(self.items.len());
        self.items.drain(..dropped);
        dropped
    }

    /// Reinserta un track terminado al final. Sólo lo usa el loop de cola.
    pub(crate) fn requeue(&mut self, track: Track) {
        self.items.push_back(track);
    }

    /// Devuelve al frente un track que no se pudo iniciar.
    pub(crate) fn restore_front(&mut self, track: Track) {
        self.items.push_front(track);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        cleared
    }

    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.items.make_contiguous().shuffle(&mut rng);
        debug!("🔀 Cola mezclada");
    }

    pub fn move_track(&mut self, from: usize, to: usize) -> PlayerResult<()> {
        let last = self.items.len() as i64 - 1;
        if from >= self.items.len() {
            return Err(PlayerError::out_of_range("queue index", from as i64, 0, last));
        }
        if to >= self.items.len() {
            return Err(PlayerError::out_of_range("queue index", to as i64, 0, last));
        }

        if from != to {
            if let Some(item) = self.items.remove(from) {
                self.items.insert(to, item);
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }

    /// Suma de duraciones conocidas, y si hay algo sin fin en la cola.
    pub fn total_duration(&self) -> QueueDuration {
        let mut total_ms = 0u64;
        let mut has_unknown = false;
        for item in &self.items {
            match item.duration_ms() {
                Some(ms) => total_ms = total_ms.saturating_add(ms),
                None => has_unknown = true,
            }
        }
        QueueDuration {
            total_ms,
            has_unknown,
        }
    }

    /// Vista paginada de la cola (páginas desde 1).
    pub fn page(&self, page: usize, items_per_page: usize) -> QueuePage {
        let items_per_page = items_per_page.max(1);
        let total_items = self.items.len();
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(items_per_page)
        };
        let current_page = page.clamp(1, total_pages);
        let start = (current_page - 1) * items_per_page;

        QueuePage {
            items: self.items.iter().skip(start).take(items_per_page).cloned().collect(),
            first_position: start,
            current_page,
            total_pages,
            total_items,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDuration {
    pub total_ms: u64,
    /// Hay streams en vivo o entradas sin resolver en la cola.
    pub has_unknown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuePage {
    pub items: Vec<Track>,
    pub first_position: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
