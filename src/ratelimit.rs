//! Brute-Force / Rate State (C11): tiered request counters keyed by ip,
//! account, and the (ip, account) pair, with escalating blocks, a whitelist,
//! and a suspicion score. Shares the "stateful middleware" concurrency shape
//! of the engine's other shared registries (spec section 1).

use chrono::{Timelike, Utc};
use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use once_cell::sync::Lazy;
use regex::Regex;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seam for a future geo-IP collaborator. Spec section 9 explicitly defers
/// real geo data to an external collaborator; no stub implementation is
/// fabricated here, only the trait a caller could wire in.
#[async_trait::async_trait]
pub trait GeoLookup: Send + Sync {
    async fn is_high_risk_country(&self, ip: &str) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct EscalationLevel {
    pub attempts: u32,
    pub block_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub ip_max: u32,
    pub ip_block_duration: Duration,
    pub level2: EscalationLevel,
    pub level3: EscalationLevel,
    pub account_permanent_lock_threshold: u32,
    pub requests_per_second: u32,
    pub burst_capacity: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(900),
            ip_max: 20,
            ip_block_duration: Duration::from_secs(900),
            level2: EscalationLevel { attempts: 50, block_duration: Duration::from_secs(3600) },
            level3: EscalationLevel { attempts: 100, block_duration: Duration::from_secs(86_400) },
            account_permanent_lock_threshold: 200,
            requests_per_second: 10,
            burst_capacity: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Ip,
    Account,
    IpAccount,
}

#[derive(Debug, Clone)]
struct TierState {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
    permanently_locked: bool,
}

impl TierState {
    fn fresh(now: Instant) -> Self {
        Self { count: 0, window_start: now, blocked_until: None, permanently_locked: false }
    }
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retry_after: Option<Duration>,
}

/// Suspicious-looking identifiers: sequential digits, obvious script/test
/// accounts, or typical credential-stuffing username shapes.
static SUSPICIOUS_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(admin|root|test|bot|script)[0-9]*$|^[0-9]{6,}$").unwrap());

/// Common automated-client user agents: bare HTTP libraries, headless
/// browsers, and generic scraping toolkits.
static AUTOMATION_USER_AGENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)curl|python-requests|go-http-client|headlesschrome|scrapy|bot|crawler").unwrap());

/// Tiered counters (ip / account / (ip,account)) with escalating blocks, a
/// whitelist, and a steady-state token-bucket throttle layered on top via
/// `governor` -- the tiers answer "how many recent failures", the limiter
/// answers "how fast can this subject call at all, right now".
pub struct RateLimitState {
    config: RateLimitConfig,
    ip_tier: DashMap<String, TierState>,
    account_tier: DashMap<String, TierState>,
    ip_account_tier: DashMap<(String, String), TierState>,
    whitelist: DashMap<String, ()>,
    limiters: DashMap<String, Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
    geo_lookup: Option<Arc<dyn GeoLookup>>,
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            ip_tier: DashMap::new(),
            account_tier: DashMap::new(),
            ip_account_tier: DashMap::new(),
            whitelist: DashMap::new(),
            limiters: DashMap::new(),
            geo_lookup: None,
        }
    }

    pub fn with_geo_lookup(mut self, geo_lookup: Arc<dyn GeoLookup>) -> Self {
        self.geo_lookup = Some(geo_lookup);
        self
    }

    pub fn whitelist(&self, subject: impl Into<String>) {
        self.whitelist.insert(subject.into(), ());
    }

    fn is_whitelisted(&self, ip: &str, account: Option<&str>) -> bool {
        self.whitelist.contains_key(ip) || account.map(|a| self.whitelist.contains_key(a)).unwrap_or(false)
    }

    fn limiter_for(&self, key: &str) -> Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>> {
        self.limiters
            .entry(key.to_string())
            .or_insert_with(|| {
                let per_second = NonZeroU32::new(self.config.requests_per_second.max(1)).unwrap();
                let burst = NonZeroU32::new(self.config.burst_capacity.max(1)).unwrap();
                Arc::new(RateLimiter::direct(Quota::per_second(per_second).allow_burst(burst)))
            })
            .clone()
    }

    /// Returns `{allowed, reason, retry_after}`. Blocked iff any tier's
    /// `blocked_until` is still in the future, or the steady-state limiter
    /// for this ip has no tokens left.
    pub fn check(&self, ip: &str, account: Option<&str>, _user_agent: Option<&str>) -> CheckResult {
        if self.is_whitelisted(ip, account) {
            return CheckResult { allowed: true, reason: None, retry_after: None };
        }

        let now = Instant::now();
        if let Some(blocked) = self.blocked_until(&self.ip_tier, ip, now) {
            return CheckResult { allowed: false, reason: Some("ip blocked".into()), retry_after: Some(blocked - now) };
        }
        if let Some(account) = account {
            if let Some(blocked) = self.blocked_until(&self.account_tier, account, now) {
                return CheckResult { allowed: false, reason: Some("account blocked".into()), retry_after: Some(blocked - now) };
            }
            let key = (ip.to_string(), account.to_string());
            if let Some(blocked) = self.blocked_until(&self.ip_account_tier, &key, now) {
                return CheckResult { allowed: false, reason: Some("ip+account blocked".into()), retry_after: Some(blocked - now) };
            }
        }

        if self.limiter_for(ip).check().is_err() {
            return CheckResult { allowed: false, reason: Some("rate exceeded".into()), retry_after: Some(Duration::from_secs(1)) };
        }

        CheckResult { allowed: true, reason: None, retry_after: None }
    }

    fn blocked_until<K: std::hash::Hash + Eq + Clone>(&self, tier: &DashMap<K, TierState>, key: &K, now: Instant) -> Option<Instant> {
        tier.get(key).and_then(|entry| {
            if entry.permanently_locked {
                Some(now + Duration::from_secs(365 * 24 * 3600))
            } else {
                entry.blocked_until.filter(|&until| until > now)
            }
        })
    }

    /// Increments every applicable tier's counter within its rolling window
    /// and applies escalation thresholds. A suspicion score (suspicious
    /// identifier shape, automation user-agent, outside business hours)
    /// counts as extra failures on top of the literal one observed.
    pub fn record_failure(&self, ip: &str, account: Option<&str>, user_agent: Option<&str>) {
        let suspicion = self.suspicion_score(ip, account, user_agent);
        let weight = 1 + suspicion;

        self.bump_tier(&self.ip_tier, ip.to_string(), weight, self.config.ip_max, self.config.ip_block_duration);

        if let Some(account) = account {
            self.bump_account_tier(account, weight);
            let key = (ip.to_string(), account.to_string());
            self.bump_tier(&self.ip_account_tier, key, weight, self.config.ip_max, self.config.ip_block_duration);
        }
    }

    fn bump_account_tier(&self, account: &str, weight: u32) {
        let now = Instant::now();
        let mut entry = self.account_tier.entry(account.to_string()).or_insert_with(|| TierState::fresh(now));
        if now.duration_since(entry.window_start) > self.config.window && entry.blocked_until.is_none() {
            *entry = TierState::fresh(now);
        }
        entry.count += weight;

        if entry.count >= self.config.account_permanent_lock_threshold {
            entry.permanently_locked = true;
        } else if entry.count >= self.config.level3.attempts {
            entry.blocked_until = Some(now + self.config.level3.block_duration);
        } else if entry.count >= self.config.level2.attempts {
            entry.blocked_until = Some(now + self.config.level2.block_duration);
        } else if entry.count >= self.config.ip_max {
            entry.blocked_until = Some(now + self.config.ip_block_duration);
        }
    }

    fn bump_tier<K: std::hash::Hash + Eq + Clone>(
        &self,
        tier: &DashMap<K, TierState>,
        key: K,
        weight: u32,
        base_threshold: u32,
        base_block_duration: Duration,
    ) {
        let now = Instant::now();
        let mut entry = tier.entry(key).or_insert_with(|| TierState::fresh(now));
        if now.duration_since(entry.window_start) > self.config.window && entry.blocked_until.is_none() {
            *entry = TierState::fresh(now);
        }
        entry.count += weight;

        if entry.count >= self.config.level3.attempts {
            entry.blocked_until = Some(now + self.config.level3.block_duration);
        } else if entry.count >= self.config.level2.attempts {
            entry.blocked_until = Some(now + self.config.level2.block_duration);
        } else if entry.count >= base_threshold {
            entry.blocked_until = Some(now + base_block_duration);
        }
    }

    /// Resets the account and (ip,account) counters; an ip-tier block
    /// persists across a success, since the ip itself remains suspect.
    pub fn record_success(&self, ip: &str, account: Option<&str>) {
        if let Some(account) = account {
            self.account_tier.remove(account);
            self.ip_account_tier.remove(&(ip.to_string(), account.to_string()));
        }
    }

    fn suspicion_score(&self, _ip: &str, account: Option<&str>, user_agent: Option<&str>) -> u32 {
        let mut score = 0;
        if let Some(account) = account {
            if SUSPICIOUS_IDENTIFIER.is_match(account) {
                score += 2;
            }
        }
        if let Some(ua) = user_agent {
            if AUTOMATION_USER_AGENT.is_match(ua) {
                score += 2;
            }
        }
        let hour = Utc::now().hour();
        if !(8..20).contains(&hour) {
            score += 1;
        }
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(900),
            ip_max: 20,
            ip_block_duration: Duration::from_secs(60),
            level2: EscalationLevel { attempts: 50, block_duration: Duration::from_secs(120) },
            level3: EscalationLevel { attempts: 100, block_duration: Duration::from_secs(240) },
            account_permanent_lock_threshold: 1_000_000,
            requests_per_second: 1_000_000,
            burst_capacity: 1_000_000,
        }
    }

    #[test]
    fn whitelisted_subject_always_allowed() {
        let state = RateLimitState::new(config());
        state.whitelist("10.0.0.1");
        for _ in 0..30 {
            state.record_failure("10.0.0.1", None, None);
        }
        assert!(state.check("10.0.0.1", None, None).allowed);
    }

    #[test]
    fn ip_blocks_after_reaching_max_attempts() {
        let state = RateLimitState::new(config());
        for _ in 0..20 {
            state.record_failure("10.0.0.2", Some("user1"), None);
        }
        assert!(!state.check("10.0.0.2", Some("user1"), None).allowed);
    }

    #[test]
    fn escalation_reaches_level2_and_level3() {
        let state = RateLimitState::new(config());
        for _ in 0..50 {
            state.record_failure("10.0.0.3", Some("user2"), None);
        }
        let result = state.check("10.0.0.3", Some("user2"), None);
        assert!(!result.allowed);
        assert!(result.retry_after.unwrap() >= Duration::from_secs(100));

        for _ in 0..50 {
            state.record_failure("10.0.0.3", Some("user2"), None);
        }
        let result = state.check("10.0.0.3", Some("user2"), None);
        assert!(result.retry_after.unwrap() >= Duration::from_secs(200));
    }

    #[test]
    fn record_success_resets_account_tier_not_ip_tier() {
        let state = RateLimitState::new(config());
        for _ in 0..20 {
            state.record_failure("10.0.0.4", Some("user3"), None);
        }
        state.record_success("10.0.0.4", Some("user3"));
        // ip tier block remains: a success for this account doesn't clear the ip block.
        assert!(!state.check("10.0.0.4", Some("user3"), None).allowed);
    }
}
