//! Server configuration from flags, falling back to `DUIT_*` environment
//! variables and then to defaults.

use std::time::Duration;

use clap::Parser;

use crate::identity::PolicyKind;

#[derive(Debug, Clone, Parser)]
#[command(name = "duit", version, about = "duit bookkeeping server")]
pub struct ServerConfig {
    /// HTTP listen port.
    #[arg(long, env = "DUIT_PORT", default_value_t = 8080)]
    pub port: u16,

    /// SQLite database URL.
    #[arg(long, env = "DUIT_DATABASE", default_value = "sqlite://duit.db")]
    pub database: String,

    /// Session lifetime in seconds.
    #[arg(long = "session-ttl", env = "DUIT_SESSION_TTL_SECS", default_value_t = 12 * 60 * 60)]
    pub session_ttl_secs: u64,

    /// Seconds between expired-session sweeps; 0 disables the sweeper.
    #[arg(long = "sweep-interval", env = "DUIT_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Authorization policy applied to every /api request.
    #[arg(long, env = "DUIT_POLICY", value_enum, default_value_t = PolicyKind::Roles)]
    pub policy: PolicyKind,
}

impl ServerConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            database: "sqlite://duit.db".to_string(),
            session_ttl_secs: 12 * 60 * 60,
            sweep_interval_secs: 60,
            policy: PolicyKind::Roles,
        }
    }
}
