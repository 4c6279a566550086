use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{errors::Error, Result};

const DEFAULT_VENDOR_BASE_URL: &str = "https://sms-verification-number.com/stubs/handler_api";
const DEFAULT_SCHEDULE_SECS: [u64; 9] = [5, 5, 7, 7, 10, 10, 15, 15, 20];
const DEFAULT_ERROR_CEILING: u32 = 4;

/// Typed configuration for the bot, read from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    /// Only the subcommands that notify a chat need it.
    pub telegram_bot_token: Option<String>,
    pub vendor: VendorConfig,
    pub watch: WatchConfig,
    pub log_file: Option<PathBuf>,
}

/// Settings for the number rental vendor's `handler_api`.
#[derive(Clone, Debug)]
pub struct VendorConfig {
    pub api_key: String,
    pub base_url: String,
    pub country: u32,
    pub lang: String,
    /// Per-request network timeout. Independent of the watch schedule.
    pub request_timeout: Duration,
    /// Retries for informational calls on 429/5xx/timeouts. Status polls never retry.
    pub max_retries: u32,
    pub proxy_url: Option<String>,
}

/// Backoff schedule and error tolerance for one order watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchConfig {
    /// Waits before each status query, ascending.
    pub schedule: Vec<Duration>,
    /// Consecutive transient errors that abort a watch early.
    pub error_ceiling: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_SCHEDULE_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            error_ceiling: DEFAULT_ERROR_CEILING,
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.schedule.is_empty() {
            return Err(Error::Config("watch schedule must not be empty".to_string()));
        }
        if self.schedule.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::Config(
                "watch schedule must be non-decreasing".to_string(),
            ));
        }
        if self.error_ceiling == 0 {
            return Err(Error::Config(
                "WATCH_ERROR_CEILING must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Total time a watch waits before giving up, ignoring query latency.
    pub fn total_wait(&self) -> Duration {
        self.schedule.iter().sum()
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup; `load` passes the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN")
            .and_then(non_empty)
            .or_else(|| get("BOT_TOKEN").and_then(non_empty));

        let api_key = get("API_KEY").and_then(non_empty).ok_or_else(|| {
            Error::Config("API_KEY environment variable is required".to_string())
        })?;

        let proxy_url = if get("USE_PROXY").map(|s| is_truthy(&s)).unwrap_or(false) {
            get("PROXY_URL").and_then(non_empty)
        } else {
            None
        };

        let timeout_secs = parse_num::<u64>("REQUEST_TIMEOUT_SECS", get("REQUEST_TIMEOUT_SECS"))?
            .unwrap_or(12);
        if timeout_secs == 0 {
            return Err(Error::Config(
                "REQUEST_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        let vendor = VendorConfig {
            api_key,
            base_url: get("VENDOR_BASE_URL")
                .and_then(non_empty)
                .unwrap_or_else(|| DEFAULT_VENDOR_BASE_URL.to_string()),
            country: parse_num("VENDOR_COUNTRY", get("VENDOR_COUNTRY"))?.unwrap_or(10),
            lang: get("VENDOR_LANG")
                .and_then(non_empty)
                .unwrap_or_else(|| "en".to_string()),
            request_timeout: Duration::from_secs(timeout_secs),
            max_retries: parse_num("HTTP_MAX_RETRIES", get("HTTP_MAX_RETRIES"))?.unwrap_or(4),
            proxy_url,
        };

        let mut watch = WatchConfig::default();
        if let Some(raw) = get("WATCH_SCHEDULE_SECS") {
            watch.schedule = parse_schedule_secs(&raw)?;
        }
        if let Some(ceiling) = parse_num("WATCH_ERROR_CEILING", get("WATCH_ERROR_CEILING"))? {
            watch.error_ceiling = ceiling;
        }
        watch.validate()?;

        let log_file = get("LOG_FILE").and_then(non_empty).map(PathBuf::from);

        Ok(Self {
            telegram_bot_token,
            vendor,
            watch,
            log_file,
        })
    }

    /// Token for subcommands that deliver notices to a chat.
    pub fn require_telegram_token(&self) -> Result<&str> {
        self.telegram_bot_token.as_deref().ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })
    }
}

/// Parse `"5,5,7,10"` into durations (seconds).
pub fn parse_schedule_secs(raw: &str) -> Result<Vec<Duration>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| Error::Config(format!("invalid WATCH_SCHEDULE_SECS entry: {s:?}")))
        })
        .collect()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn is_truthy(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Unset or blank is `None`; anything unparseable is a config error.
fn parse_num<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>> {
    let Some(raw) = raw.and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("invalid {key}: {raw:?}")))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
