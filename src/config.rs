//! Bot configuration

use std::path::PathBuf;

use serde::Serialize;

/// All runtime tunables, loaded from the environment with defaults.
#[derive(Debug, Clone, Serialize)]
pub struct BotConfig {
    /// Base URL of the card service.
    pub base_url: String,
    /// Account credentials.
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Id of the operating account, used to skip offering to ourselves.
    pub user_id: u64,
    /// Directory for the target snapshot, inventory and demand cache files.
    pub data_dir: PathBuf,
    /// Optional outbound proxy URL.
    pub proxy_url: Option<String>,
    /// Select and log offers without sending anything.
    pub dry_run: bool,
    /// Run the boost-target and trade-history pollers.
    pub enable_pollers: bool,
    /// Name of the session cookie that marks a live login.
    pub session_cookie: String,

    pub request_timeout_secs: u64,
    pub requests_per_minute: u32,

    /// Demand at or below this is treated as zero for comparisons.
    pub low_demand_threshold: u32,
    /// Cards wanted by more accounts than this are never offered.
    pub demand_ceiling: u32,
    /// Probe budget for the unprobed-first selection phase.
    pub max_probe_attempts: u32,
    /// Flush the demand cache after this many newly probed cards.
    pub cache_flush_every: u32,
    pub cache_validity_hours: i64,

    pub max_failed_cycles: u32,
    /// How long to wait for a boost after all owners were offered.
    pub wait_after_all_owners_secs: u64,
    pub wait_check_interval_secs: u64,
    pub target_poll_interval_secs: u64,
    pub history_poll_interval_secs: u64,
    pub sleep_check_interval_secs: u64,
    /// Settle delay after submitting a replacement.
    pub replace_settle_secs: u64,
    /// Pause between cancelling offers and submitting a replacement.
    pub cancel_pause_secs: u64,
    /// Pause before restarting a cycle that timed out waiting.
    pub cycle_pause_secs: u64,

    /// UTC offset of the service's daily reset clock.
    pub reset_utc_offset_hours: i32,
    pub log_level: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            base_url: "https://example.invalid".to_string(),
            email: String::new(),
            password: String::new(),
            user_id: 0,
            data_dir: default_data_dir(),
            proxy_url: None,
            dry_run: false,
            enable_pollers: true,
            session_cookie: "club_session".to_string(),
            request_timeout_secs: 30,
            requests_per_minute: 60,
            low_demand_threshold: 5,
            demand_ceiling: 70,
            max_probe_attempts: 15,
            cache_flush_every: 5,
            cache_validity_hours: 24,
            max_failed_cycles: 3,
            wait_after_all_owners_secs: 900,
            wait_check_interval_secs: 2,
            target_poll_interval_secs: 30,
            history_poll_interval_secs: 60,
            sleep_check_interval_secs: 60,
            replace_settle_secs: 3,
            cancel_pause_secs: 1,
            cycle_pause_secs: 1,
            reset_utc_offset_hours: 3,
            log_level: "info".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("boost-runner")
}

impl BotConfig {
    /// Load configuration from `BOOST_*` environment variables.
    ///
    /// `BOOST_EMAIL`, `BOOST_PASSWORD`, `BOOST_BASE_URL` and `BOOST_USER_ID`
    /// are required; everything else falls back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        cfg.base_url = require("BOOST_BASE_URL")?;
        cfg.email = require("BOOST_EMAIL")?;
        cfg.password = require("BOOST_PASSWORD")?;
        cfg.user_id = require("BOOST_USER_ID")?
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid BOOST_USER_ID: {}", e))?;

        if let Ok(dir) = std::env::var("BOOST_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        cfg.proxy_url = std::env::var("BOOST_PROXY_URL").ok();
        cfg.dry_run = flag("BOOST_DRY_RUN");
        if flag("BOOST_DISABLE_POLLERS") {
            cfg.enable_pollers = false;
        }
        if let Ok(cookie) = std::env::var("BOOST_SESSION_COOKIE") {
            cfg.session_cookie = cookie;
        }
        if let Ok(level) = std::env::var("BOOST_LOG_LEVEL") {
            cfg.log_level = level;
        }

        parse_into(&mut cfg.requests_per_minute, "BOOST_REQUESTS_PER_MINUTE")?;
        parse_into(&mut cfg.low_demand_threshold, "BOOST_LOW_DEMAND_THRESHOLD")?;
        parse_into(&mut cfg.demand_ceiling, "BOOST_DEMAND_CEILING")?;
        parse_into(&mut cfg.max_probe_attempts, "BOOST_MAX_PROBE_ATTEMPTS")?;
        parse_into(&mut cfg.cache_validity_hours, "BOOST_CACHE_VALIDITY_HOURS")?;
        parse_into(&mut cfg.wait_after_all_owners_secs, "BOOST_WAIT_SECS")?;
        parse_into(&mut cfg.target_poll_interval_secs, "BOOST_TARGET_POLL_SECS")?;
        parse_into(&mut cfg.history_poll_interval_secs, "BOOST_HISTORY_POLL_SECS")?;
        parse_into(&mut cfg.reset_utc_offset_hours, "BOOST_RESET_UTC_OFFSET")?;

        Ok(cfg)
    }
}

fn require(name: &str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("{} environment variable required", name))
}

fn flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, name: &str) -> anyhow::Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        *slot = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", name, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.low_demand_threshold, 5);
        assert_eq!(cfg.demand_ceiling, 70);
        assert_eq!(cfg.max_failed_cycles, 3);
        assert_eq!(cfg.cache_flush_every, 5);
        assert!(cfg.enable_pollers);
        assert!(!cfg.dry_run);
    }
}
