use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::scheduler::ScheduleWindow;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub name: String,
    pub entry_id: String,

    pub api_url: Url,
    #[serde(serialize_with = "mask_secret")]
    pub api_token: Option<String>,
    pub request_timeout: Duration,

    pub state_dir: PathBuf,
    pub http_bind: String,

    pub update_barrier_minute_min: u32,
    pub update_barrier_minute_max: u32,
    pub measure_max_age: Duration,
    pub historical_max_age: Duration,
    pub historical_poll_interval: Duration,
    pub enable_direct_measure: bool,
    pub rng_seed: Option<u64>,
}

fn mask_secret<S: serde::Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("***"),
        None => serializer.serialize_none(),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = env_string(&lookup, "METER_NAME", Some("meter".to_string()))?;
        let entry_id = env_string(&lookup, "METER_ENTRY_ID", Some("meter".to_string()))?;

        let api_url = env_string(&lookup, "METER_API_URL", None)?;
        let api_url = Url::parse(&api_url).context("invalid METER_API_URL")?;
        let api_token = env_optional(&lookup, "METER_API_TOKEN");
        let request_timeout =
            Duration::from_secs(env_u64(&lookup, "METER_REQUEST_TIMEOUT_SECONDS", Some(30))?);

        let state_dir = PathBuf::from(env_string(
            &lookup,
            "METER_STATE_DIR",
            Some("/var/lib/meter-poller".to_string()),
        )?);
        let http_bind = env_string(&lookup, "METER_HTTP_BIND", Some("127.0.0.1:9110".to_string()))?;

        let update_barrier_minute_min =
            env_u32(&lookup, "METER_UPDATE_BARRIER_MINUTE_MIN", Some(50))?;
        let update_barrier_minute_max =
            env_u32(&lookup, "METER_UPDATE_BARRIER_MINUTE_MAX", Some(60))?;

        let measure_max_age =
            Duration::from_secs(env_u64(&lookup, "METER_MEASURE_MAX_AGE_SECONDS", Some(3600))?);
        let historical_max_age = Duration::from_secs(env_u64(
            &lookup,
            "METER_HISTORICAL_MAX_AGE_SECONDS",
            Some(86_400),
        )?);
        let historical_poll_interval = Duration::from_secs(env_u64(
            &lookup,
            "METER_HISTORICAL_POLL_INTERVAL_SECONDS",
            Some(21_600),
        )?);

        let enable_direct_measure = env_bool(&lookup, "METER_ENABLE_DIRECT_MEASURE", true)?;
        let rng_seed = match env_optional(&lookup, "METER_RNG_SEED") {
            Some(raw) => Some(raw.parse::<u64>().context("invalid METER_RNG_SEED")?),
            None => None,
        };

        let config = Self {
            name,
            entry_id,
            api_url,
            api_token,
            request_timeout,
            state_dir,
            http_bind,
            update_barrier_minute_min,
            update_barrier_minute_max,
            measure_max_age,
            historical_max_age,
            historical_poll_interval,
            enable_direct_measure,
            rng_seed,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.schedule_window()?;
        if self.request_timeout.is_zero() {
            bail!("METER_REQUEST_TIMEOUT_SECONDS must be non-zero");
        }
        if self.historical_poll_interval.is_zero() {
            bail!("METER_HISTORICAL_POLL_INTERVAL_SECONDS must be non-zero");
        }
        if self.name.is_empty() || self.entry_id.is_empty() {
            bail!("METER_NAME and METER_ENTRY_ID must not be empty");
        }
        Ok(())
    }

    pub fn schedule_window(&self) -> Result<ScheduleWindow> {
        ScheduleWindow::new(self.update_barrier_minute_min, self.update_barrier_minute_max)
            .context("invalid METER_UPDATE_BARRIER_MINUTE_MIN/MAX")
    }

    pub fn measure_max_age(&self) -> chrono::Duration {
        to_chrono(self.measure_max_age)
    }

    pub fn historical_max_age(&self) -> chrono::Duration {
        to_chrono(self.historical_max_age)
    }

    pub fn historical_log_path(&self) -> PathBuf {
        self.state_dir.join("historical.jsonl")
    }
}

fn to_chrono(value: Duration) -> chrono::Duration {
    chrono::Duration::from_std(value).unwrap_or(chrono::Duration::MAX)
}

fn env_string<F>(lookup: &F, key: &str, default: Option<String>) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => Ok(value.trim().to_string()),
        None => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64<F>(lookup: &F, key: &str, default: Option<u64>) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        None => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u32<F>(lookup: &F, key: &str, default: Option<u32>) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let value = env_u64(lookup, key, default.map(u64::from))?;
    u32::try_from(value).with_context(|| format!("invalid {key}: {value} is out of range"))
}

fn env_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env_optional(lookup, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("invalid {key}: expected a boolean, got {raw:?}")),
    }
}

fn env_optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
