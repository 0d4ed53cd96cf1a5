use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

// ---------------------------------------------------------------------------
// Conference configuration
// ---------------------------------------------------------------------------

/// Complete engine configuration.
///
/// Every section has working defaults. `from_env` overrides them with
/// `OFFICE_HOURS_*` variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    pub signaling: SignalingConfig,
    pub quality: QualityConfig,
    pub sampling: SamplingConfig,
    pub recording: RecordingConfig,
    pub ice_servers: IceConfig,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel("info".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    /// Reconnection attempts before `ReconnectFailed` is surfaced.
    pub reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Random spread applied to each delay, as a fraction of it (0 disables).
    pub backoff_jitter: f64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            reconnect_attempts: 5,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            backoff_jitter: 0.0,
        }
    }
}

impl SignalingConfig {
    /// Delay before reconnection attempt `attempt` (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub window_ms: u64,
    /// Samples required in the window before any evaluation.
    pub min_samples: usize,
    /// Number of most recent samples averaged per evaluation.
    pub recent_samples: usize,
    /// Samples that must accumulate since the last change before upgrading.
    pub upgrade_after_samples: usize,
    /// Evaluate once every this many samples.
    pub evaluation_stride: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            window_ms: 30_000,
            min_samples: 3,
            recent_samples: 5,
            upgrade_after_samples: 10,
            evaluation_stride: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { interval_ms: 5000 }
    }
}

impl SamplingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub chunk_interval_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 1000,
        }
    }
}

impl RecordingConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl ConferenceConfig {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file is loaded first when present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = ConferenceConfig::default();

        if let Ok(url) = std::env::var("OFFICE_HOURS_SIGNALING_URL") {
            config.signaling.url = url;
        }
        config.signaling.reconnect_attempts = env_parse(
            "OFFICE_HOURS_RECONNECT_ATTEMPTS",
            config.signaling.reconnect_attempts,
        );
        config.signaling.initial_backoff_ms = env_parse(
            "OFFICE_HOURS_INITIAL_BACKOFF_MS",
            config.signaling.initial_backoff_ms,
        );
        config.signaling.max_backoff_ms =
            env_parse("OFFICE_HOURS_MAX_BACKOFF_MS", config.signaling.max_backoff_ms);
        config.signaling.backoff_jitter =
            env_parse("OFFICE_HOURS_BACKOFF_JITTER", config.signaling.backoff_jitter);

        config.quality.window_ms = env_parse("OFFICE_HOURS_QUALITY_WINDOW_MS", config.quality.window_ms);
        config.quality.upgrade_after_samples = env_parse(
            "OFFICE_HOURS_UPGRADE_AFTER_SAMPLES",
            config.quality.upgrade_after_samples,
        );
        config.quality.evaluation_stride = env_parse(
            "OFFICE_HOURS_EVALUATION_STRIDE",
            config.quality.evaluation_stride,
        );

        config.sampling.interval_ms =
            env_parse("OFFICE_HOURS_SAMPLE_INTERVAL_MS", config.sampling.interval_ms);
        config.recording.chunk_interval_ms = env_parse(
            "OFFICE_HOURS_CHUNK_INTERVAL_MS",
            config.recording.chunk_interval_ms,
        );

        if let Ok(urls) = std::env::var("OFFICE_HOURS_STUN_URLS") {
            config.ice_servers.stun_urls = urls
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(level) = std::env::var("OFFICE_HOURS_LOG_LEVEL") {
            config.log_level = LogLevel(level);
        }

        config
    }

    /// Log the effective configuration once at startup.
    pub fn log_summary(&self) {
        info!(
            signaling_url = %self.signaling.url,
            reconnect_attempts = self.signaling.reconnect_attempts,
            sample_interval_ms = self.sampling.interval_ms,
            quality_window_ms = self.quality.window_ms,
            upgrade_after = self.quality.upgrade_after_samples,
            chunk_interval_ms = self.recording.chunk_interval_ms,
            "conference configuration loaded"
        );
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
