use std::{
    env, fs,
    path::Path,
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration, loaded from the environment (with an optional `.env`
/// in the working directory).
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub bot_token: String,
    pub admin_ids: Vec<i64>,

    // Store
    pub mongo_uri: String,
    pub mongo_db: String,

    // Lookup upstream
    pub api_url: String,
    pub api_key: String,
    pub lookup_timeout: Duration,

    // Quota policy
    pub initial_credits: i64,
    pub daily_grant_amount: i64,
    pub grant_hour: u32,
    pub grant_minute: u32,

    // Broadcast pacing
    pub broadcast_delay: Duration,
    pub progress_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let bot_token = env_str("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(Error::Config(
                "BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let admin_ids = parse_csv_i64(env_str("ADMIN_IDS"));
        if admin_ids.is_empty() {
            return Err(Error::Config(
                "ADMIN_IDS environment variable is required".to_string(),
            ));
        }

        let mongo_uri = env_str("MONGO_URI").and_then(non_empty).ok_or_else(|| {
            Error::Config("MONGO_URI environment variable is required".to_string())
        })?;
        let mongo_db = env_str("MONGO_DB").and_then(non_empty).unwrap_or_else(|| "nlb".to_string());

        let api_url = env_str("API_URL").and_then(non_empty).ok_or_else(|| {
            Error::Config("API_URL environment variable is required".to_string())
        })?;
        let api_key = env_str("API_KEY").and_then(non_empty).ok_or_else(|| {
            Error::Config("API_KEY environment variable is required".to_string())
        })?;
        let lookup_timeout = Duration::from_millis(env_u64("LOOKUP_TIMEOUT_MS").unwrap_or(20_000));

        let initial_credits = env_i64("INITIAL_CREDITS").unwrap_or(2).max(0);
        let daily_grant_amount = env_i64("DAILY_GRANT_AMOUNT").unwrap_or(1).max(0);

        let grant_hour = env_u32("GRANT_HOUR").unwrap_or(9);
        let grant_minute = env_u32("GRANT_MINUTE").unwrap_or(0);
        if grant_hour > 23 || grant_minute > 59 {
            return Err(Error::Config(format!(
                "invalid grant time {grant_hour:02}:{grant_minute:02}"
            )));
        }

        let broadcast_delay = Duration::from_millis(env_u64("BROADCAST_DELAY_MS").unwrap_or(50));
        let progress_interval =
            Duration::from_millis(env_u64("PROGRESS_INTERVAL_MS").unwrap_or(3_000));

        Ok(Self {
            bot_token,
            admin_ids,
            mongo_uri,
            mongo_db,
            api_url,
            api_key,
            lookup_timeout,
            initial_credits,
            daily_grant_amount,
            grant_hour,
            grant_minute,
            broadcast_delay,
            progress_interval,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

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
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    env_str(key).and_then(|s| s.trim().parse::<i64>().ok())
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
