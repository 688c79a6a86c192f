//! Cross-worker rate governor.
//!
//! Sliding 60-second windows in the shared KV store so N worker
//! processes observe one global budget per provider. RPM members are
//! bare instants; TPM members encode `<timestamp>:<tokens>` with the
//! timestamp as score. The governor is advisory: it answers "may I
//! send now, and if not, how long should I wait?".

use crate::clock::Clock;
use crate::error::{KvError, Result};
use crate::kv::Kv;
use graphloom_protocol::defaults::{GOVERNOR_BACKOFF_CAP_SECS, GOVERNOR_MAX_WAIT_ATTEMPTS};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const WINDOW_SECS: f64 = 60.0;
/// Window keys expire a second after the window so idle providers
/// leave no state behind.
const KEY_TTL_SECS: u64 = 61;

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Granted,
    /// Denied; retry after roughly this many seconds.
    Wait(f64),
}

impl Admission {
    pub fn granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

pub struct RateGovernor {
    kv: Arc<dyn Kv>,
    clock: Arc<dyn Clock>,
    provider: String,
    rpm_limit: Option<u64>,
    tpm_limit: Option<u64>,
}

impl RateGovernor {
    pub fn new(
        kv: Arc<dyn Kv>,
        clock: Arc<dyn Clock>,
        provider: impl Into<String>,
        rpm_limit: Option<u64>,
        tpm_limit: Option<u64>,
    ) -> Self {
        Self {
            kv,
            clock,
            provider: provider.into(),
            rpm_limit,
            tpm_limit,
        }
    }

    fn rpm_key(&self) -> String {
        format!("rate_limit:{}:rpm", self.provider)
    }

    fn tpm_key(&self) -> String {
        format!("rate_limit:{}:tpm", self.provider)
    }

    /// Acquire permission for one request (RPM window).
    pub async fn acquire_request(&self) -> Result<Admission> {
        let Some(limit) = self.rpm_limit else {
            return Ok(Admission::Granted);
        };

        let now = self.clock.now_secs();
        let key = self.rpm_key();

        self.kv.zremrangebyscore(&key, now - WINDOW_SECS).await?;
        let current = self.kv.zcard(&key).await?;

        if current < limit {
            self.kv.zadd(&key, &format!("{now}"), now).await?;
            self.kv.expire(&key, KEY_TTL_SECS).await?;
            debug!(provider = %self.provider, used = current + 1, limit, "rpm grant");
            return Ok(Admission::Granted);
        }

        let oldest = self.kv.zrange_withscores(&key).await?;
        let wait = oldest
            .first()
            .map(|(_, ts)| (ts + WINDOW_SECS - now).max(0.0))
            .unwrap_or(1.0);
        warn!(provider = %self.provider, used = current, limit, wait, "rpm limit");
        Ok(Admission::Wait(wait))
    }

    /// Acquire permission to spend `token_count` tokens (TPM window).
    pub async fn acquire_tokens(&self, token_count: u64) -> Result<Admission> {
        let Some(limit) = self.tpm_limit else {
            return Ok(Admission::Granted);
        };

        let now = self.clock.now_secs();
        let key = self.tpm_key();

        self.kv.zremrangebyscore(&key, now - WINDOW_SECS).await?;
        let entries = self.kv.zrange_withscores(&key).await?;
        let current: u64 = entries.iter().map(|(member, _)| member_tokens(member)).sum();

        if current + token_count <= limit {
            let member = format!("{now}:{token_count}");
            self.kv.zadd(&key, &member, now).await?;
            self.kv.expire(&key, KEY_TTL_SECS).await?;
            debug!(
                provider = %self.provider,
                reserved = token_count,
                used = current + token_count,
                limit,
                "tpm grant"
            );
            return Ok(Admission::Granted);
        }

        // Walk the window oldest-first until enough tokens would have
        // aged out to admit this reservation.
        let deficit = current + token_count - limit;
        let mut freed = 0u64;
        let mut wait = 1.0;
        for (member, ts) in &entries {
            freed += member_tokens(member);
            if freed >= deficit {
                wait = (ts + WINDOW_SECS - now).max(0.0);
                break;
            }
        }
        warn!(
            provider = %self.provider,
            requested = token_count,
            used = current,
            limit,
            wait,
            "tpm limit"
        );
        Ok(Admission::Wait(wait))
    }

    /// Tokens currently counted in the TPM window.
    pub async fn current_tpm(&self) -> Result<u64> {
        if self.tpm_limit.is_none() {
            return Ok(0);
        }
        let now = self.clock.now_secs();
        let key = self.tpm_key();
        self.kv.zremrangebyscore(&key, now - WINDOW_SECS).await?;
        let entries = self.kv.zrange_withscores(&key).await?;
        Ok(entries.iter().map(|(member, _)| member_tokens(member)).sum())
    }

    /// Block (by suspending) until a request slot is granted.
    pub async fn wait_for_request(&self) -> Result<()> {
        self.wait_until(Reservation::Request).await
    }

    /// Block (by suspending) until a token reservation is granted.
    pub async fn wait_for_tokens(&self, token_count: u64) -> Result<()> {
        self.wait_until(Reservation::Tokens(token_count)).await
    }

    /// Bounded acquire loop: exponential backoff (base 2, capped)
    /// stretched by the governor's suggested wait, with jitter so
    /// workers don't stampede the same expiry instant.
    async fn wait_until(&self, reservation: Reservation) -> Result<()> {
        for attempt in 0..GOVERNOR_MAX_WAIT_ATTEMPTS {
            let admission = match reservation {
                Reservation::Request => self.acquire_request().await?,
                Reservation::Tokens(count) => self.acquire_tokens(count).await?,
            };
            match admission {
                Admission::Granted => return Ok(()),
                Admission::Wait(wait) => {
                    let sleep = jittered_wait(wait, attempt);
                    debug!(provider = %self.provider, attempt, sleep, "governor wait");
                    tokio::time::sleep(Duration::from_secs_f64(sleep)).await;
                }
            }
        }
        Err(KvError::CapacityExhausted(format!(
            "failed to acquire {} capacity after {} attempts",
            self.provider, GOVERNOR_MAX_WAIT_ATTEMPTS
        )))
    }
}

#[derive(Debug, Clone, Copy)]
enum Reservation {
    Request,
    Tokens(u64),
}

fn member_tokens(member: &str) -> u64 {
    member
        .split(':')
        .nth(1)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0)
}

/// max(advised wait, 2^attempt capped) scaled by jitter in [0.8, 1.2].
pub fn jittered_wait(advised: f64, attempt: u32) -> f64 {
    let backoff = 2f64
        .powi(attempt.min(31) as i32)
        .min(GOVERNOR_BACKOFF_CAP_SECS as f64);
    let jitter = 0.8 + rand::thread_rng().gen_range(0.0..0.4);
    advised.max(backoff) * jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mem::MemoryKv;

    fn governor(
        clock: Arc<ManualClock>,
        rpm: Option<u64>,
        tpm: Option<u64>,
    ) -> RateGovernor {
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        RateGovernor::new(kv, clock, "test", rpm, tpm)
    }

    #[tokio::test]
    async fn rpm_cap_is_enforced_then_releases() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let governor = governor(clock.clone(), Some(3), None);

        for _ in 0..3 {
            assert!(governor.acquire_request().await.unwrap().granted());
        }
        let denied = governor.acquire_request().await.unwrap();
        let Admission::Wait(wait) = denied else {
            panic!("expected denial at the cap");
        };
        assert!(wait > 0.0 && wait <= 60.0);

        // The window slides: a minute later the slot frees up.
        clock.advance(61.0);
        assert!(governor.acquire_request().await.unwrap().granted());
    }

    #[tokio::test]
    async fn tpm_tracks_token_sums() {
        let clock = Arc::new(ManualClock::new(5_000.0));
        let governor = governor(clock.clone(), None, Some(1_000));

        assert!(governor.acquire_tokens(600).await.unwrap().granted());
        assert!(governor.acquire_tokens(400).await.unwrap().granted());
        assert!(!governor.acquire_tokens(1).await.unwrap().granted());
        assert_eq!(governor.current_tpm().await.unwrap(), 1_000);

        clock.advance(61.0);
        assert!(governor.acquire_tokens(1_000).await.unwrap().granted());
    }

    #[tokio::test]
    async fn tpm_wait_points_at_enough_expiry() {
        let clock = Arc::new(ManualClock::new(0.0));
        let governor = governor(clock.clone(), None, Some(100));

        assert!(governor.acquire_tokens(60).await.unwrap().granted());
        clock.advance(30.0);
        assert!(governor.acquire_tokens(40).await.unwrap().granted());

        // Needs 50 freed; the 60-token entry at t=0 frees at t=60,
        // i.e. 30 seconds from now.
        let Admission::Wait(wait) = governor.acquire_tokens(50).await.unwrap() else {
            panic!("expected denial");
        };
        assert!((wait - 30.0).abs() < 0.5, "wait was {wait}");
    }

    #[tokio::test]
    async fn unlimited_providers_always_grant() {
        let clock = Arc::new(ManualClock::new(0.0));
        let governor = governor(clock, None, None);
        assert!(governor.acquire_request().await.unwrap().granted());
        assert!(governor.acquire_tokens(u64::MAX / 2).await.unwrap().granted());
    }

    /// Property sweep: under random acquires and clock jumps, no
    /// 60-second window ever exceeds the caps.
    #[tokio::test]
    async fn windows_never_exceed_caps_under_fuzz() {
        let clock = Arc::new(ManualClock::new(0.0));
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let governor = RateGovernor::new(kv, clock.clone(), "fuzz", Some(20), Some(500));

        let mut grants: Vec<(f64, u64)> = Vec::new();
        let mut rng = rand::thread_rng();

        for _ in 0..400 {
            // Always advance past the clock's millisecond resolution
            // so no two grants share a window member.
            clock.advance(rng.gen_range(0.01..7.0));
            let tokens = rng.gen_range(1..120);
            if governor.acquire_request().await.unwrap().granted()
                && governor.acquire_tokens(tokens).await.unwrap().granted()
            {
                grants.push((clock.now_secs(), tokens));
            }
        }

        for (at, _) in &grants {
            let in_window: Vec<_> = grants
                .iter()
                .filter(|(t, _)| *t > at - 60.0 && *t <= *at)
                .collect();
            assert!(in_window.len() as u64 <= 20, "rpm window overflow at {at}");
            let tokens: u64 = in_window.iter().map(|(_, n)| n).sum();
            assert!(tokens <= 500, "tpm window overflow at {at}: {tokens}");
        }
    }

    #[test]
    fn jitter_stays_in_band() {
        for attempt in 0..10 {
            let wait = jittered_wait(1.0, attempt);
            let backoff = 2f64.powi(attempt as i32).min(30.0);
            assert!(wait >= backoff * 0.8 - f64::EPSILON);
            assert!(wait <= backoff * 1.2 + f64::EPSILON);
        }
    }
}
