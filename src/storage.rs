use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::{collections::HashMap, path::PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::audio::policy::Tier;

/// Configuración de servidor almacenada en JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub guild_id: u64,
    pub tier: Tier,
    /// Baja el techo del tier para esta guild
    pub volume_ceiling: Option<u16>,
    pub default_volume: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            guild_id: 0,
            tier: Tier::Standard,
            volume_ceiling: None,
            default_volume: 100,
        }
    }
}

/// Lo que el núcleo necesita saber de un tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantSettings {
    pub tier: Tier,
    pub volume_ceiling: Option<u16>,
    pub default_volume: u16,
}

impl Default for TenantSettings {
    fn default() -> Self {
        ServerConfig::default().into()
    }
}

impl From<ServerConfig> for TenantSettings {
    fn from(config: ServerConfig) -> Self {
        Self {
            tier: config.tier,
            volume_ceiling: config.volume_ceiling,
            default_volume: config.default_volume,
        }
    }
}

/// Fuente de configuración por tenant. Se consulta al crear la sesión y en
/// cada chequeo del techo de volumen.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TenantConfigStore: Send + Sync {
    async fn settings(&self, guild_id: GuildId) -> Result<TenantSettings>;
}

/// Manager de almacenamiento basado en archivos JSON: un
/// `servers/guild_<id>.json` por guild con un cache delante.
pub struct JsonStorage {
    data_dir: PathBuf,
    servers_cache: RwLock<HashMap<u64, ServerConfig>>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        // Crear directorio de datos si no existe
        let servers_dir = data_dir.join("servers");
        fs::create_dir_all(&servers_dir)
            .await
            .with_context(|| format!("creando {}", servers_dir.display()))?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let storage = Self {
            data_dir,
            servers_cache: RwLock::new(HashMap::new()),
        };
        // Cargar configuraciones existentes
        storage.load_all_servers().await?;
        Ok(storage)
    }

    /// Obtiene la configuración de un servidor
    pub async fn get_server_config(&self, guild_id: GuildId) -> Result<ServerConfig> {
        // Verificar cache primero
        let cached = self.servers_cache.read().get(&guild_id.get()).cloned();
        if let Some(config) = cached {
            return Ok(config);
        }

        // Cargar desde archivo, o crear configuración por defecto
        let path = self.server_file_path(guild_id.get());
        let config = if fs::try_exists(&path).await? {
            self.load_server_config(guild_id.get()).await?
        } else {
            ServerConfig {
                guild_id: guild_id.get(),
                ..ServerConfig::default()
            }
        };

        self.servers_cache.write().insert(guild_id.get(), config.clone());
        Ok(config)
    }

    /// Actualiza la configuración de un servidor
    pub async fn update_server_config(&self, config: ServerConfig) -> Result<()> {
        self.save_server_config(&config).await?;
        info!("💾 Configuración actualizada para guild {}", config.guild_id);
        self.servers_cache.write().insert(config.guild_id, config);
        Ok(())
    }

    pub async fn set_tier(&self, guild_id: GuildId, tier: Tier) -> Result<()> {
        let mut config = self.get_server_config(guild_id).await?;
        config.tier = tier;
        self.update_server_config(config).await
    }

    pub async fn set_volume_ceiling(&self, guild_id: GuildId, ceiling: Option<u16>) -> Result<()> {
        let mut config = self.get_server_config(guild_id).await?;
        config.volume_ceiling = ceiling;
        self.update_server_config(config).await
    }

    /// Actualiza el volumen por defecto de un servidor
    pub async fn set_default_volume(&self, guild_id: GuildId, volume: u16) -> Result<()> {
        let mut config = self.get_server_config(guild_id).await?;
        config.default_volume = volume.min(200); // Límite duro de volumen
        self.update_server_config(config).await
    }

    /// Lista todas las configuraciones de servidores
    pub fn list_servers(&self) -> Vec<u64> {
        let mut guilds: Vec<u64> = self.servers_cache.read().keys().copied().collect();
        guilds.sort_unstable();
        guilds
    }

    async fn load_server_config(&self, guild_id: u64) -> Result<ServerConfig> {
        let path = self.server_file_path(guild_id);
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("leyendo {}", path.display()))?;
        let mut config: ServerConfig =
            serde_json::from_str(&content).with_context(|| format!("parseando {}", path.display()))?;
        config.guild_id = guild_id;
        Ok(config)
    }

    async fn save_server_config(&self, config: &ServerConfig) -> Result<()> {
        let path = self.server_file_path(config.guild_id);
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("escribiendo {}", path.display()))?;
        Ok(())
    }

    async fn load_all_servers(&self) -> Result<()> {
        let mut files = fs::read_dir(self.data_dir.join("servers")).await?;
        let mut loaded = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Some(guild_id) = path
                .file_stem()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.load_server_config(guild_id).await {
                Ok(config) => {
                    self.servers_cache.write().insert(guild_id, config);
                    loaded += 1;
                }
                Err(e) => warn!("Error cargando configuración para guild {}: {:#}", guild_id, e),
            }
        }

        if loaded > 0 {
            info!("📂 Cargadas {} configuraciones de servidor", loaded);
        }
        Ok(())
    }

    fn server_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir.join("servers").join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl TenantConfigStore for JsonStorage {
    async fn settings(&self, guild_id: GuildId) -> Result<TenantSettings> {
        self.get_server_config(guild_id).await.map(Into::into)
    }
}
