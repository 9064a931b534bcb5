//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Dispatchbot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path.
    pub data_dir: PathBuf,

    /// Dispatch tuning (debounce, rate limits, pacing, provider timeouts).
    pub dispatch: DispatchConfig,
}

/// Everything the dispatcher reads at runtime. Instance-level overrides
/// take precedence over these defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub debounce: DebounceConfig,
    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub split_delay: SplitDelayConfig,
    pub provider: ProviderConfig,
    pub dispatcher: DispatcherConfig,
}

/// How the debouncer picks the initial flush delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebounceMode {
    /// Flush as soon as the message is buffered.
    Disabled,
    /// Flush `base_delay_ms` after the first buffered message.
    #[default]
    Fixed,
    /// Flush after a uniform random delay in `[base_delay_ms, max_delay_ms]`.
    Randomized,
}

/// Message coalescing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub mode: DebounceMode,

    /// Delay from the first buffered message to the flush.
    pub base_delay_ms: u64,

    /// Hard cap on buffering time, measured from the first buffered message.
    pub max_delay_ms: u64,

    /// Whether typing presence pushes the flush deadline out.
    pub extend_on_typing: bool,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            mode: DebounceMode::Fixed,
            base_delay_ms: 3_000,
            max_delay_ms: 15_000,
            extend_on_typing: true,
        }
    }
}

impl DebounceConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Pick the delay for a new buffering cycle.
    pub fn initial_delay(&self) -> Duration {
        match self.mode {
            DebounceMode::Disabled => Duration::ZERO,
            DebounceMode::Fixed => self.base_delay(),
            DebounceMode::Randomized => {
                if self.max_delay_ms <= self.base_delay_ms {
                    return self.base_delay();
                }
                let millis = rand::random_range(self.base_delay_ms..=self.max_delay_ms);
                Duration::from_millis(millis)
            }
        }
    }
}

/// Per-identity trigger rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_triggers: u32,
    /// How often idle windows are swept from memory.
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_triggers: 5,
            sweep_interval_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Reaction deduplication cache bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub capacity: usize,
    pub ttl_ms: u64,
    /// Maximum reaction triggers for a single target message while it is tracked.
    pub max_per_message: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_ms: 600_000,
            max_per_message: 3,
        }
    }
}

/// Inter-chunk pacing for multi-part replies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitDelayConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub per_char_ms: u64,
}

impl Default for SplitDelayConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 300,
            max_delay_ms: 1_000,
            per_char_ms: 15,
        }
    }
}

impl SplitDelayConfig {
    /// Typing delay before sending a chunk of `chunk_len` characters.
    pub fn delay_for(&self, chunk_len: usize) -> Duration {
        let raw = (chunk_len as u64).saturating_mul(self.per_char_ms);
        Duration::from_millis(raw.clamp(self.min_delay_ms, self.max_delay_ms.max(self.min_delay_ms)))
    }
}

/// Agent provider call settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Upper bound on a single provider call.
    pub timeout_ms: u64,
    /// How long a resolved provider client stays cached.
    pub cache_ttl_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            cache_ttl_ms: 30_000,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Subscription and lifecycle settings for the dispatcher itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrent handler invocations per subscription.
    pub concurrency: usize,
    /// Redelivery attempts the event source makes for a failed handler.
    pub max_retries: u32,
    /// How long cleanup waits for in-flight dispatches before detaching them.
    pub shutdown_grace_ms: u64,
    /// Duration passed to the connector's "composing" indicator.
    pub typing_duration_ms: u64,
    /// How long instance records stay cached.
    pub instance_cache_ttl_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_retries: 2,
            shutdown_grace_ms: 5_000,
            typing_duration_ms: 30_000,
            instance_cache_ttl_ms: 10_000,
        }
    }
}

impl DispatchConfig {
    /// Parse a TOML document. Missing sections and keys fall back to defaults.
    pub fn from_toml(source: &str, path: &str) -> Result<Self> {
        let config: DispatchConfig = toml::from_str(source).map_err(|error| ConfigError::Parse {
            path: path.to_string(),
            message: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DISPATCHBOT_*` overrides using the given variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let parse = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(value) => value.trim().parse::<u64>().map(Some).map_err(|_| {
                    ConfigError::Invalid(format!("{key} must be an integer, got '{value}'")).into()
                }),
                None => Ok(None),
            }
        };

        if let Some(value) = parse("DISPATCHBOT_PROVIDER_TIMEOUT_MS")? {
            self.provider.timeout_ms = value;
        }
        if let Some(value) = parse("DISPATCHBOT_DEBOUNCE_BASE_MS")? {
            self.debounce.base_delay_ms = value;
        }
        if let Some(value) = parse("DISPATCHBOT_DEBOUNCE_MAX_MS")? {
            self.debounce.max_delay_ms = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce.max_delay_ms < self.debounce.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "debounce.max_delay_ms ({}) must be >= debounce.base_delay_ms ({})",
                self.debounce.max_delay_ms, self.debounce.base_delay_ms
            ))
            .into());
        }
        if self.rate_limit.max_triggers == 0 {
            return Err(ConfigError::Invalid("rate_limit.max_triggers must be at least 1".into()).into());
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_ms must be positive".into()).into());
        }
        if self.dedup.capacity == 0 {
            return Err(ConfigError::Invalid("dedup.capacity must be at least 1".into()).into());
        }
        if self.split_delay.min_delay_ms > self.split_delay.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "split_delay.min_delay_ms ({}) must be <= split_delay.max_delay_ms ({})",
                self.split_delay.min_delay_ms, self.split_delay.max_delay_ms
            ))
            .into());
        }
        if self.provider.timeout_ms == 0 {
            return Err(ConfigError::Invalid("provider.timeout_ms must be positive".into()).into());
        }
        if self.dispatcher.concurrency == 0 {
            return Err(ConfigError::Invalid("dispatcher.concurrency must be at least 1".into()).into());
        }
        Ok(())
    }
}

impl Config {
    /// Default data directory (`<platform data dir>/dispatchbot`).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("dispatchbot"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Load configuration from the default location and environment.
    /// A missing config file means all defaults.
    pub fn load() -> Result<Self> {
        let data_dir = Self::default_data_dir();
        let path = data_dir.join("config.toml");
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            let mut dispatch = DispatchConfig::default();
            dispatch.apply_overrides(|key| std::env::var(key).ok())?;
            dispatch.validate()?;
            Ok(Self { data_dir, dispatch })
        }
    }

    /// Load from a specific config file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(error),
        })?;
        let mut dispatch = DispatchConfig::from_toml(&source, &path.display().to_string())?;
        dispatch.apply_overrides(|key| std::env::var(key).ok())?;
        dispatch.validate()?;

        let data_dir = path
            .parent()
            .map(Path::to_path_buf)
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(Self::default_data_dir);

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        Ok(Self { data_dir, dispatch })
    }
}

/// Hot-swappable dispatch config shared by running components.
///
/// Components call `load()` on each use so `reload()` takes effect
/// without restarting subscriptions.
#[derive(Debug)]
pub struct RuntimeConfig {
    dispatch: ArcSwap<DispatchConfig>,
}

impl RuntimeConfig {
    pub fn new(dispatch: DispatchConfig) -> Self {
        Self {
            dispatch: ArcSwap::from_pointee(dispatch),
        }
    }

    /// Load the current config snapshot.
    pub fn load(&self) -> arc_swap::Guard<Arc<DispatchConfig>> {
        self.dispatch.load()
    }

    /// Owned snapshot for holding across await points.
    pub fn snapshot(&self) -> Arc<DispatchConfig> {
        self.dispatch.load_full()
    }

    /// Validate and publish a new config.
    pub fn reload(&self, dispatch: DispatchConfig) -> Result<()> {
        dispatch.validate()?;
        self.dispatch.store(Arc::new(dispatch));
        tracing::info!("dispatch config reloaded");
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}
