//! Time helpers shared by seek handling and now-playing views.

use crate::error::{PlayerError, PlayerResult};

const FILLED: char = '█';
const EMPTY: char = '▒';
const MAX_BAR_WIDTH: usize = 64;

/// Convierte un tiempo escrito por una persona a milisegundos.
///
/// Acepta segundos (`"90"`), notación de reloj (`"1:30"`, `"1:02:03"`)
/// y unidades de humantime (`"1m30s"`, `"2h 5m"`, `"1500ms"`).
pub fn parse_time(input: &str) -> PlayerResult<u64> {
    let trimmed = input.trim();
    let invalid = || PlayerError::InvalidTime(input.to_string());

    if trimmed.is_empty() {
        return Err(invalid());
    }

    if trimmed.contains(':') {
        return parse_clock(trimmed).ok_or_else(invalid);
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed
            .parse::<u64>()
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .ok_or_else(invalid);
    }

    humantime::parse_duration(trimmed)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .ok_or_else(invalid)
}

// Minutos y segundos tras el primer campo deben ser menores a 60
fn parse_clock(input: &str) -> Option<u64> {
    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() > 3 {
        return None;
    }

    let mut total: u64 = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let value: u64 = part.parse().ok()?;
        if i > 0 && value >= 60 {
            return None;
        }
        total = total.checked_mul(60)?.checked_add(value)?;
    }

    total.checked_mul(1000)
}

/// Formatea milisegundos como `H:MM:SS`
pub fn format_time(ms: u64) -> String {
    let total_seconds = ms / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}

/// Línea `posición / duración`, con `LIVE` para streams
pub fn format_progress(position_ms: u64, duration_ms: Option<u64>) -> String {
    match duration_ms {
        Some(duration) => format!(
            "{} / {}",
            format_time(position_ms.min(duration)),
            format_time(duration)
        ),
        None => format!("{} / LIVE", format_time(position_ms)),
    }
}

/// Crea una barra visual de progreso de ancho fijo; lo lleno nunca pasa de `width`.
///
/// Los tracks en vivo no tienen fin, así que su barra queda vacía.
pub fn progress_bar(position_ms: u64, duration_ms: Option<u64>, width: usize) -> String {
    let width = width.clamp(1, MAX_BAR_WIDTH);
    let filled = match duration_ms {
        Some(duration) if duration > 0 => {
            let position = position_ms.min(duration) as u128;
            ((position * width as u128) / duration as u128) as usize
        }
        _ => 0,
    };

    let mut bar = String::with_capacity(width * FILLED.len_utf8());
    bar.extend(std::iter::repeat(FILLED).take(filled));
    bar.extend(std::iter::repeat(EMPTY).take(width - filled));
    bar
}
