//! Engine configuration.
//!
//! Defaults live on [`EngineConfig`]; the binary overrides them from
//! command-line flags or `PAYROLL_*` environment variables via [`EngineArgs`].

use crate::domain::payee::PayCalendar;
use chrono::NaiveDate;
use clap::Args;
use std::time::Duration;
use uuid::Uuid;

/// Bounded exponential backoff for transient settlement failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total submissions allowed per attempt, the first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next submission after `attempt_count` submissions.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.backoff_max)
    }

    pub fn allows_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Upper bound on concurrent settlement submissions within a run.
    pub workers: usize,
    /// Per-call bound on settlement and balance oracle requests.
    pub call_timeout: Duration,
    pub lease_ttl: Duration,
    /// Identifies this engine instance in the run lease.
    pub owner_id: String,
    pub calendar: PayCalendar,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            workers: 4,
            call_timeout: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(300),
            owner_id: format!("engine-{}", Uuid::new_v4()),
            calendar: PayCalendar::default(),
        }
    }
}

impl EngineConfig {
    pub fn lease_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or(chrono::Duration::MAX)
    }
}

/// Command-line and environment overrides for [`EngineConfig`].
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Maximum submissions per payee before the payment is marked failed
    #[arg(long, env = "PAYROLL_MAX_ATTEMPTS", default_value_t = 5)]
    pub max_attempts: u32,

    /// Initial retry backoff in milliseconds (doubles per retry)
    #[arg(long, env = "PAYROLL_BACKOFF_BASE_MS", default_value_t = 200)]
    pub backoff_base_ms: u64,

    /// Retry backoff ceiling in milliseconds
    #[arg(long, env = "PAYROLL_BACKOFF_MAX_MS", default_value_t = 5000)]
    pub backoff_max_ms: u64,

    /// Concurrent settlement submissions per run
    #[arg(long, env = "PAYROLL_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Timeout for each settlement or balance call, in milliseconds
    #[arg(long, env = "PAYROLL_CALL_TIMEOUT_MS", default_value_t = 10_000)]
    pub call_timeout_ms: u64,

    /// Run lease time-to-live in seconds
    #[arg(long, env = "PAYROLL_LEASE_TTL_SECS", default_value_t = 300)]
    pub lease_ttl_secs: u64,

    /// Lease owner identity for this instance (random when omitted)
    #[arg(long, env = "PAYROLL_OWNER_ID")]
    pub owner_id: Option<String>,

    /// Day of month on which monthly payees are paid
    #[arg(long, env = "PAYROLL_MONTHLY_PAY_DAY", default_value_t = 15)]
    pub monthly_pay_day: u32,

    /// Reference payday for weekly and bi-weekly cycles (YYYY-MM-DD)
    #[arg(long, env = "PAYROLL_CYCLE_ANCHOR")]
    pub cycle_anchor: Option<NaiveDate>,
}

impl From<EngineArgs> for EngineConfig {
    fn from(args: EngineArgs) -> Self {
        let defaults = EngineConfig::default();
        Self {
            retry: RetryPolicy {
                max_attempts: args.max_attempts.max(1),
                backoff_base: Duration::from_millis(args.backoff_base_ms),
                backoff_max: Duration::from_millis(args.backoff_max_ms),
            },
            workers: args.workers.max(1),
            call_timeout: Duration::from_millis(args.call_timeout_ms),
            lease_ttl: Duration::from_secs(args.lease_ttl_secs),
            owner_id: args.owner_id.unwrap_or(defaults.owner_id),
            calendar: PayCalendar {
                monthly_pay_day: args.monthly_pay_day,
                cycle_anchor: args
                    .cycle_anchor
                    .unwrap_or(defaults.calendar.cycle_anchor),
            },
        }
    }
}
