use crate::membership::{ConfigError, MembershipConfig};
use serde::Deserialize;
use std::time::Duration;

/// A seed as given on the command line or in the environment.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SeedAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Node identity
    pub name: String,
    pub host: String,
    pub port: u16,
    pub role: Option<String>,

    // Cluster
    pub seeds: Vec<SeedAddress>,
    pub gossip_interval_ms: u64,
    pub failure_detector_interval_ms: u64,
    pub suspicion_timeout_ms: Option<u64>,
    pub retransmit_multiplier: u32,
    pub leave_without_notification: bool,
    pub failure_detector_off: bool,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            host: "localhost".to_string(),
            port: 4748,
            role: None,
            seeds: Vec::new(),
            gossip_interval_ms: 500,
            failure_detector_interval_ms: 2000,
            suspicion_timeout_ms: None,
            retransmit_multiplier: 3,
            leave_without_notification: false,
            failure_detector_off: false,
            debug: false,
        }
    }
}

impl Config {
    /// Build the membership configuration, resolving host names.
    pub fn membership_config(&self) -> Result<MembershipConfig, ConfigError> {
        let mut config = MembershipConfig::new().host(&self.name, &self.host, self.port)?;
        if let Some(role) = &self.role {
            if let Some(host) = config.host.take() {
                config = config.host_member(host.with_role(role.clone()));
            }
        }

        for seed in &self.seeds {
            config = config.seed(&seed.host, seed.port)?;
        }

        let mut config = config
            .gossip_interval(Duration::from_millis(self.gossip_interval_ms))
            .failure_detector_interval(Duration::from_millis(self.failure_detector_interval_ms))
            .retransmit_multiplier(self.retransmit_multiplier)
            .leave_without_notification(self.leave_without_notification)
            .failure_detector_off(self.failure_detector_off);
        if let Some(ms) = self.suspicion_timeout_ms {
            config = config.suspicion_timeout(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse `host:port[,host:port...]`. Malformed entries are skipped.
pub fn parse_seeds(value: &str) -> Vec<SeedAddress> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let parsed = s
                .rsplit_once(':')
                .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
                .filter(|(host, _)| !host.is_empty());
            if parsed.is_none() {
                tracing::warn!("ignoring malformed seed {:?}", s);
            }
            parsed.map(|(host, port)| SeedAddress {
                host: host.to_string(),
                port,
            })
        })
        .collect()
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let name = std::env::var("NODE_KEEPER_NAME").unwrap_or(defaults.name);

    let host = std::env::var("NODE_KEEPER_HOST").unwrap_or(defaults.host);

    let port = std::env::var("NODE_KEEPER_PORT")
        .unwrap_or_else(|_| "4748".to_string())
        .parse()
        .unwrap_or(defaults.port);

    let role = std::env::var("NODE_KEEPER_ROLE").ok();

    let seeds = std::env::var("NODE_KEEPER_SEEDS")
        .map(|v| parse_seeds(&v))
        .unwrap_or_default();

    let gossip_interval_ms = std::env::var("NODE_KEEPER_GOSSIP_INTERVAL_MS")
        .unwrap_or_else(|_| "500".to_string())
        .parse()
        .unwrap_or(defaults.gossip_interval_ms);

    let failure_detector_interval_ms = std::env::var("NODE_KEEPER_FAILURE_DETECTOR_INTERVAL_MS")
        .unwrap_or_else(|_| "2000".to_string())
        .parse()
        .unwrap_or(defaults.failure_detector_interval_ms);

    let suspicion_timeout_ms = std::env::var("NODE_KEEPER_SUSPICION_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok());

    let retransmit_multiplier = std::env::var("NODE_KEEPER_RETRANSMIT_MULTIPLIER")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .unwrap_or(defaults.retransmit_multiplier);

    let leave_without_notification = env_flag("NODE_KEEPER_LEAVE_WITHOUT_NOTIFICATION");
    let failure_detector_off = env_flag("NODE_KEEPER_FAILURE_DETECTOR_OFF");

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        name,
        host,
        port,
        role,
        seeds,
        gossip_interval_ms,
        failure_detector_interval_ms,
        suspicion_timeout_ms,
        retransmit_multiplier,
        leave_without_notification,
        failure_detector_off,
        debug,
    })
}
