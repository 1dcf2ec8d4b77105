use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::LazyLock};

/// Which authentication strategy a call should use, and the material it
/// needs. Exactly one variant is active per call; per-call options (see
/// `auth::coordinator`) may override individual fields without replacing the
/// whole variant.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    ApiKey {
        #[serde(default)]
        api_key: String,
    },
    OAuth2 {
        #[serde(default)]
        project_id: String,
        #[serde(default)]
        location: String,
        #[serde(default)]
        service_account_path: Option<String>,
        #[serde(default)]
        access_token: Option<String>,
        #[serde(default)]
        quota_project_id: Option<String>,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::ApiKey {
            api_key: String::new(),
        }
    }
}

/// Named rate-limit profile, see spec §8 for the canonical values of the
/// three shipped profiles.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RateLimitProfile {
    pub max_concurrency_per_model: u32,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub jitter_factor: f64,
    pub non_blocking: bool,
    pub disable_rate_limiter: bool,
    pub adaptive_concurrency: bool,
    pub adaptive_ceiling: u32,
    pub token_budget_per_window: u64,
    pub window_duration_ms: u64,
}

impl RateLimitProfile {
    pub const fn free_tier() -> Self {
        Self {
            max_concurrency_per_model: 2,
            max_attempts: 5,
            base_backoff_ms: 2000,
            jitter_factor: 0.2,
            non_blocking: false,
            disable_rate_limiter: false,
            adaptive_concurrency: false,
            adaptive_ceiling: 2,
            token_budget_per_window: 32_000,
            window_duration_ms: 60_000,
        }
    }

    pub const fn paid_tier_1() -> Self {
        Self {
            max_concurrency_per_model: 10,
            max_attempts: 3,
            base_backoff_ms: 500,
            jitter_factor: 0.2,
            non_blocking: false,
            disable_rate_limiter: false,
            adaptive_concurrency: true,
            adaptive_ceiling: 15,
            token_budget_per_window: 1_000_000,
            window_duration_ms: 60_000,
        }
    }

    pub const fn paid_tier_2() -> Self {
        Self {
            max_concurrency_per_model: 20,
            max_attempts: 2,
            base_backoff_ms: 250,
            jitter_factor: 0.2,
            non_blocking: false,
            disable_rate_limiter: false,
            adaptive_concurrency: true,
            adaptive_ceiling: 30,
            token_budget_per_window: 2_000_000,
            window_duration_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitProfiles {
    pub free_tier: RateLimitProfile,
    pub paid_tier_1: RateLimitProfile,
    pub paid_tier_2: RateLimitProfile,
    /// Profile name used when a call does not pin one explicitly.
    pub default_profile: String,
}

impl Default for RateLimitProfiles {
    fn default() -> Self {
        Self {
            free_tier: RateLimitProfile::free_tier(),
            paid_tier_1: RateLimitProfile::paid_tier_1(),
            paid_tier_2: RateLimitProfile::paid_tier_2(),
            default_profile: "free_tier".to_string(),
        }
    }
}

impl RateLimitProfiles {
    pub fn resolve(&self, name: &str) -> RateLimitProfile {
        match name {
            "paid_tier_1" => self.paid_tier_1,
            "paid_tier_2" => self.paid_tier_2,
            _ => self.free_tier,
        }
    }

    pub fn default_resolved(&self) -> RateLimitProfile {
        self.resolve(&self.default_profile)
    }
}

/// Process-wide configuration, loaded (per spec §6) from defaults merged
/// with an optional TOML file and environment overrides.
///
/// Loading itself is out of scope for the client's own responsibilities;
/// only the values it produces are consumed by `auth`/`rate_limit`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limits: RateLimitProfiles,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default)]
    pub telemetry_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth: AuthConfig::default(),
            rate_limits: RateLimitProfiles::default(),
            default_model: default_model(),
            default_timeout_ms: default_timeout_ms(),
            telemetry_enabled: false,
        }
    }
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_timeout_ms() -> u64 {
    60_000
}

const DEFAULT_CONFIG_FILE: &str = "gemini-client.toml";

impl Config {
    /// Builds a Figment that merges defaults and an optional config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults and `gemini-client.toml` if present.
    pub fn from_optional_toml() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config file): {err}")
        })
    }
}

/// Global, lazily-initialized configuration instance.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_optional_toml);
