use std::time::Duration;

/// Espera base (ms) del backoff de reconexión si no hay configuración.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Tope (ms) de una espera de reconexión.
pub const BACKOFF_MAX_MS: u64 = 60_000;

/// Espera exponencial de reconexión con tope. Las reconexiones a nodos nunca
/// se abandonan, así que no hay límite de intentos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Espera antes del intento de reconexión número `attempt` (desde 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(BACKOFF_BASE_MS),
            Duration::from_millis(BACKOFF_MAX_MS),
        )
    }
}
