use std::time::Duration;

use clap::Parser;

/// Command-line + environment configuration of the controller.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Mounts S3 buckets as persistent volume claims")]
pub struct Settings {
    /// Address of the diagnostics server
    #[arg(long, env = "SOURCE_CONTROLLER_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Delay before retrying a source whose secret does not exist yet
    #[arg(long, env = "SOURCE_CONTROLLER_SECRET_REQUEUE_SECS", default_value_t = 60)]
    pub secret_requeue_secs: u64,

    /// Immediate retries of a conflicting write before giving up on the cycle
    #[arg(long, env = "SOURCE_CONTROLLER_CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: u32,

    /// Deadline of a single reconciliation
    #[arg(long, env = "SOURCE_CONTROLLER_RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
    pub reconcile_timeout_secs: u64,

    /// First delay of the error backoff
    #[arg(long, env = "SOURCE_CONTROLLER_BACKOFF_BASE_SECS", default_value_t = 5)]
    pub backoff_base_secs: u64,

    /// Upper bound of the error backoff
    #[arg(long, env = "SOURCE_CONTROLLER_BACKOFF_MAX_SECS", default_value_t = 300)]
    pub backoff_max_secs: u64,

    /// Delay before retrying a cancelled reconciliation
    #[arg(long, env = "SOURCE_CONTROLLER_CANCELLED_REQUEUE_SECS", default_value_t = 5)]
    pub cancelled_requeue_secs: u64,

    /// Maximum number of sources reconciled at once, 0 for no limit
    #[arg(long, env = "SOURCE_CONTROLLER_CONCURRENCY", default_value_t = 0)]
    pub concurrency: u16,

    /// Emit logs as JSON
    #[arg(long, env = "SOURCE_CONTROLLER_JSON_LOGS")]
    pub json_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            secret_requeue_secs: 60,
            conflict_retries: 5,
            reconcile_timeout_secs: 30,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            cancelled_requeue_secs: 5,
            concurrency: 0,
            json_logs: false,
        }
    }
}

impl Settings {
    pub fn secret_requeue(&self) -> Duration {
        Duration::from_secs(self.secret_requeue_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn cancelled_requeue(&self) -> Duration {
        Duration::from_secs(self.cancelled_requeue_secs)
    }

    /// Delay after `failures` consecutive failed reconciliations
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
        let secs = self
            .backoff_base_secs
            .saturating_mul(factor)
            .min(self.backoff_max_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_defaults_match_default() {
        let parsed = Settings::parse_from(["operator"]);
        let default = Settings::default();

        assert_eq!(parsed.listen, default.listen);
        assert_eq!(parsed.secret_requeue(), Duration::from_secs(60));
        assert_eq!(parsed.conflict_retries, default.conflict_retries);
        assert_eq!(parsed.reconcile_timeout(), default.reconcile_timeout());
        assert_eq!(parsed.concurrency, 0);
        assert!(!parsed.json_logs);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let settings = Settings::default();

        assert_eq!(settings.backoff(0), Duration::from_secs(5));
        assert_eq!(settings.backoff(1), Duration::from_secs(10));
        assert_eq!(settings.backoff(3), Duration::from_secs(40));
        assert_eq!(settings.backoff(6), Duration::from_secs(300));
        assert_eq!(settings.backoff(200), Duration::from_secs(300));
    }
}
