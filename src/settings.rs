//! Runtime settings of pools and agents
//!
//! A pool carries the defaults ([`PoolSettings`]); every field of
//! [`AgentSettings`] that is set overrides the pool default for that agent.

use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PoolConfig, RestartWindow};
use crate::types::{Game, UserId};

const HOUR: f64 = 3600.0;

/// How long an agent's session lives before it restarts itself
#[derive(Clone)]
pub enum RestartPolicy {
    /// `rand(from..=to)` whole hours plus a random fraction of an hour
    Hours { from: u32, to: u32 },
    Fixed(Duration),
    Custom(Arc<dyn Fn() -> Duration + Send + Sync>),
}

impl RestartPolicy {
    pub fn hours(from: u32, to: u32) -> Self {
        let (from, to) = if from <= to { (from, to) } else { (to, from) };
        RestartPolicy::Hours { from, to }
    }

    /// Anywhere from zero to two hours
    pub fn hour() -> Self {
        Self::hours(0, 1)
    }

    pub fn two_hours() -> Self {
        Self::hours(1, 1)
    }

    pub fn four_hours() -> Self {
        Self::hours(2, 3)
    }

    pub fn six_hours() -> Self {
        Self::hours(4, 5)
    }

    pub fn eight_hours() -> Self {
        Self::hours(6, 7)
    }

    pub fn half_day() -> Self {
        Self::hours(10, 11)
    }

    pub fn day() -> Self {
        Self::hours(21, 23)
    }

    pub fn two_days() -> Self {
        Self::hours(39, 47)
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        RestartPolicy::Custom(Arc::new(f))
    }

    /// Delay until the next restart
    pub fn next_delay(&self) -> Duration {
        match self {
            RestartPolicy::Hours { from, to } => {
                let mut rng = rand::thread_rng();
                let whole = rng.gen_range(*from..=*to) as f64;
                let fraction: f64 = rng.gen_range(0.0..1.0);
                Duration::from_secs_f64((whole + fraction) * HOUR)
            }
            RestartPolicy::Fixed(delay) => *delay,
            RestartPolicy::Custom(f) => f(),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::six_hours()
    }
}

impl From<&RestartWindow> for RestartPolicy {
    fn from(window: &RestartWindow) -> Self {
        Self::hours(window.from_hours, window.to_hours)
    }
}

impl std::fmt::Debug for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::Hours { from, to } => write!(f, "Hours({}..={})", from, to),
            RestartPolicy::Fixed(delay) => write!(f, "Fixed({:?})", delay),
            RestartPolicy::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Pool-wide defaults
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// `None` disables self-restart
    pub restart_policy: Option<RestartPolicy>,
    /// Partners whose incoming offers are accepted automatically
    pub whitelist: HashSet<UserId>,
    /// `None` disables auto-cancel of sent offers
    pub offer_cancel_delay: Option<Duration>,
    /// Domain used when registering an api key
    pub registration_domain: String,
    /// Games fetched as soon as a session is ready
    pub prefetch_games: Vec<Game>,
    /// How long `startup` waits for each agent
    pub start_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            restart_policy: Some(RestartPolicy::six_hours()),
            whitelist: HashSet::new(),
            offer_cancel_delay: Some(Duration::from_secs(5 * 60)),
            registration_domain: "localhost".to_string(),
            prefetch_games: Vec::new(),
            start_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            restart_policy: config
                .auto_restart
                .then(|| RestartPolicy::from(&config.restart_policy)),
            whitelist: config.whitelist.iter().copied().map(UserId).collect(),
            offer_cancel_delay: config
                .auto_cancel_offers
                .then(|| Duration::from_secs(config.offer_cancel_delay_secs)),
            registration_domain: config.registration_domain.clone(),
            prefetch_games: config.prefetch_games.clone(),
            start_timeout: Duration::from_secs(config.start_timeout_secs),
        }
    }

    pub fn with_restart_policy(mut self, policy: Option<RestartPolicy>) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_offer_cancel_delay(mut self, delay: Option<Duration>) -> Self {
        self.offer_cancel_delay = delay;
        self
    }

    pub fn with_whitelist(mut self, partners: impl IntoIterator<Item = UserId>) -> Self {
        self.whitelist = partners.into_iter().collect();
        self
    }

    pub fn with_prefetch_games(mut self, games: Vec<Game>) -> Self {
        self.prefetch_games = games;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }
}

/// Agent-local overrides of the pool defaults; unset fields inherit
#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    pub restart_policy: Option<RestartPolicy>,
    pub whitelist: Option<HashSet<UserId>>,
    pub offer_cancel_delay: Option<Duration>,
    pub registration_domain: Option<String>,
    pub prefetch_games: Option<Vec<Game>>,
}

impl AgentSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }

    pub fn whitelist(mut self, partners: impl IntoIterator<Item = UserId>) -> Self {
        self.whitelist = Some(partners.into_iter().collect());
        self
    }

    pub fn offer_cancel_delay(mut self, delay: Duration) -> Self {
        self.offer_cancel_delay = Some(delay);
        self
    }

    pub fn registration_domain(mut self, domain: impl Into<String>) -> Self {
        self.registration_domain = Some(domain.into());
        self
    }

    pub fn prefetch_games(mut self, games: Vec<Game>) -> Self {
        self.prefetch_games = Some(games);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_within(policy: RestartPolicy, from: u32, to: u32) {
        for _ in 0..200 {
            let delay = policy.next_delay().as_secs_f64();
            assert!(delay >= from as f64 * HOUR, "{:?} below {}h", policy, from);
            assert!(delay < (to + 1) as f64 * HOUR, "{:?} above {}h", policy, to + 1);
        }
    }

    #[test]
    fn test_restart_presets_stay_in_range() {
        assert_within(RestartPolicy::hour(), 0, 1);
        assert_within(RestartPolicy::two_hours(), 1, 1);
        assert_within(RestartPolicy::four_hours(), 2, 3);
        assert_within(RestartPolicy::six_hours(), 4, 5);
        assert_within(RestartPolicy::eight_hours(), 6, 7);
        assert_within(RestartPolicy::half_day(), 10, 11);
        assert_within(RestartPolicy::day(), 21, 23);
        assert_within(RestartPolicy::two_days(), 39, 47);
    }

    #[test]
    fn test_reversed_range_is_normalised() {
        assert!(matches!(
            RestartPolicy::hours(5, 2),
            RestartPolicy::Hours { from: 2, to: 5 }
        ));
    }

    #[test]
    fn test_fixed_and_custom_policies() {
        let fixed = RestartPolicy::Fixed(Duration::from_millis(20));
        assert_eq!(fixed.next_delay(), Duration::from_millis(20));

        let custom = RestartPolicy::custom(|| Duration::from_secs(7));
        assert_eq!(custom.next_delay(), Duration::from_secs(7));
    }

    #[test]
    fn test_pool_defaults() {
        let settings = PoolSettings::default();
        assert!(matches!(
            settings.restart_policy,
            Some(RestartPolicy::Hours { from: 4, to: 5 })
        ));
        assert_eq!(settings.offer_cancel_delay, Some(Duration::from_secs(300)));
        assert_eq!(settings.registration_domain, "localhost");
        assert!(settings.whitelist.is_empty());
        assert!(settings.prefetch_games.is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = PoolConfig::default();
        config.auto_cancel_offers = false;
        config.whitelist = vec![76_561_198_000_000_001];
        let settings = PoolSettings::from_config(&config);
        assert!(settings.offer_cancel_delay.is_none());
        assert!(settings
            .whitelist
            .contains(&UserId(76_561_198_000_000_001)));
    }
}
