//! Orquestación de reproducción multi-guild sobre nodos de audio remotos.
//!
//! El módulo [`audio`] maneja las sesiones por guild y sus colas, el módulo
//! [`node`] sigue el estado de los nodos que renderizan el audio.

pub mod audio;
pub mod config;
pub mod error;
pub mod node;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{PlayerError, PlayerResult};
