use std::time::Duration;

use thiserror::Error;

/// Errores del núcleo de reproducción visibles para quien llama.
///
/// Todas las variantes son recuperables: la capa de comandos las convierte en
/// una respuesta, ninguna debe tumbar el proceso.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayerError {
    #[error("la operación `{operation}` no es válida con la sesión en estado {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("{what} {value} está fuera del rango permitido {min}..={max}")]
    OutOfRange {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("la sesión de reproducción ya no existe")]
    SessionGone,

    #[error("no hay ningún nodo de audio conectado")]
    NoNodesAvailable,

    #[error("el nodo de audio `{0}` no está disponible")]
    NodeUnavailable(String),

    #[error("debes estar en el mismo canal de voz que el reproductor")]
    PermissionDenied,

    #[error("la cola está vacía")]
    Empty,

    #[error("la cola está llena (máximo {0} canciones)")]
    QueueFull(usize),

    #[error("`{0}` no es un tiempo válido")]
    InvalidTime(String),

    #[error("no se pudo resolver el track `{identifier}`: {reason}")]
    ResolveFailed { identifier: String, reason: String },

    #[error("tiempo agotado esperando al nodo de audio tras {0:?}")]
    Timeout(Duration),

    #[error("más despacio, intenta de nuevo en {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

impl PlayerError {
    pub(crate) fn out_of_range(what: &'static str, value: i64, min: i64, max: i64) -> Self {
        Self::OutOfRange {
            what,
            value,
            min,
            max,
        }
    }
}

pub type PlayerResult<T> = std::result::Result<T, PlayerError>;
