use serde::{Deserialize, Serialize};

use crate::LayerError;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "VKSHADOW_CONFIG";

/// Top-level layer configuration, loaded from vkshadow.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Record image layout transitions per subresource
    #[serde(default = "default_true")]
    pub track_image_layouts: bool,
    /// Attach binding-state snapshots to draw/dispatch/trace commands
    #[serde(default = "default_true")]
    pub capture_binding_state: bool,
    /// Clear descriptor sets disturbed by an incompatible pipeline layout.
    /// Only affects introspection, never forwarded calls.
    #[serde(default)]
    pub invalidate_disturbed_descriptor_sets: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Use timeline semaphores for the layer's own signals when the driver
    /// supports them
    #[serde(default = "default_true")]
    pub use_timeline_semaphores: bool,
    /// Maximum number of idle binary semaphores kept for reuse
    #[serde(default = "default_semaphore_pool_limit")]
    pub semaphore_pool_limit: usize,
    /// Maximum number of idle fences kept for reuse
    #[serde(default = "default_fence_pool_limit")]
    pub fence_pool_limit: usize,
    /// How many backlogged semaphores one submission may wait on to
    /// recycle them
    #[serde(default = "default_max_reset_backlog")]
    pub max_reset_backlog_per_submit: usize,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            recording: RecordingConfig::default(),
            submission: SubmissionConfig::default(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            track_image_layouts: true,
            capture_binding_state: true,
            invalidate_disturbed_descriptor_sets: false,
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            use_timeline_semaphores: true,
            semaphore_pool_limit: default_semaphore_pool_limit(),
            fence_pool_limit: default_fence_pool_limit(),
            max_reset_backlog_per_submit: default_max_reset_backlog(),
        }
    }
}

impl LayerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, LayerError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, LayerError> {
        toml::from_str(content).map_err(|e| LayerError::Config(e.to_string()))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(LayerError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring invalid config {}: {}", path, e);
                Self::default()
            }
        }
    }
}

/// Returns the config file path.
/// Search order:
/// 1. `$VKSHADOW_CONFIG`
/// 2. System-wide config: `%PROGRAMDATA%\vkshadow\vkshadow.toml` (Windows) or `/etc/vkshadow/vkshadow.toml`
/// 3. Local fallback: `./vkshadow.toml`
pub fn default_config_path() -> String {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return path;
    }
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\vkshadow\vkshadow.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/vkshadow/vkshadow.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "vkshadow.toml".to_string()
}

fn default_true() -> bool {
    true
}

fn default_semaphore_pool_limit() -> usize {
    64
}

fn default_fence_pool_limit() -> usize {
    16
}

fn default_max_reset_backlog() -> usize {
    32
}
