//! Brute-force protection keyed by (client ip, email).

use chrono::{Duration, Utc};
use tracing::warn;

use crate::config::SecurityConfig;
use crate::db::SecurityRepository;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Open,
    Locked { remaining_secs: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempts left before the block kicks in.
    Remaining(u32),
    Locked { remaining_secs: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct LoginLockout {
    pub max_attempts: u32,
    pub lock_duration: Duration,
}

impl LoginLockout {
    pub fn new(max_attempts: u32, lock_duration: Duration) -> Self {
        Self { max_attempts, lock_duration }
    }

    pub fn from_settings(security: &SecurityConfig) -> Self {
        Self::new(security.max_login_attempts, Duration::seconds(security.lockout_secs))
    }

    /// An expired block is lifted here; the attempt counter is kept.
    pub async fn check(&self, repo: &dyn SecurityRepository, ip: &str, email: &str) -> Result<LockStatus> {
        let record = match repo.get_lockout(ip, email).await? {
            Some(record) => record,
            None => return Ok(LockStatus::Open),
        };

        match record.bloqueado_hasta {
            Some(until) if until > Utc::now() => Ok(LockStatus::Locked {
                remaining_secs: (until - Utc::now()).num_seconds().max(1),
            }),
            Some(_) => {
                repo.lift_expired_lockout(ip, email).await?;
                Ok(LockStatus::Open)
            }
            None => Ok(LockStatus::Open),
        }
    }

    /// The count comes back from the store, so concurrent failures are
    /// never lost.
    pub async fn record_failure(
        &self,
        repo: &dyn SecurityRepository,
        ip: &str,
        email: &str,
    ) -> Result<FailureOutcome> {
        let max_attempts = i32::try_from(self.max_attempts).unwrap_or(i32::MAX);
        let until = Utc::now() + self.lock_duration;
        let attempts = repo
            .record_failed_attempt(ip, email, max_attempts, until)
            .await?
            .max(0) as u32;

        if attempts >= self.max_attempts {
            warn!("Login blocked for {} from {} after {} attempts", email, ip, attempts);
            Ok(FailureOutcome::Locked {
                remaining_secs: self.lock_duration.num_seconds(),
            })
        } else {
            Ok(FailureOutcome::Remaining(self.max_attempts - attempts))
        }
    }

    pub async fn reset(&self, repo: &dyn SecurityRepository, ip: &str, email: &str) -> Result<()> {
        repo.clear_lockout(ip, email).await
    }
}

/// Human wait time: `45 segundos`, `14 minutos y 5 segundos`, `1 horas y 2 minutos`.
pub fn format_remaining(secs: i64) -> String {
    let secs = secs.max(0);
    if secs < 60 {
        format!("{} segundos", secs)
    } else if secs < 3600 {
        format!("{} minutos y {} segundos", secs / 60, secs % 60)
    } else {
        format!("{} horas y {} minutos", secs / 3600, (secs % 3600) / 60)
    }
}
