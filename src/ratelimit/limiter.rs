//! Sliding-window rate limiter keyed by sender.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::action::Action;
use super::backend::PolicyBackend;
use super::clock::{Clock, SystemClock};
use super::registry::{RegistryStats, SnapshotLoad, TokenRegistry};
use super::store::KeyValueStore;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// Limit applied when no configuration sets one.
pub const DEFAULT_LIMIT: u64 = 120;
/// Window applied when no configuration sets one.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3660);
/// Text sent with `defer_if_permit` when none is configured.
pub const DEFAULT_DEFER_MESSAGE: &str = "rate limit exceeded";

/// The rate limiter deciding whether a sender may send another message.
///
/// Every decision runs under one lock, so the prune, compare and record
/// steps for a sender are atomic. This caps decision throughput at one at
/// a time process-wide.
pub struct RateLimiter {
    settings: Mutex<Settings>,
    registry: TokenRegistry,
    clock: Arc<dyn Clock>,
}

/// Replaceable configuration state.
struct Settings {
    default_limit: u64,
    window: Duration,
    defer_message: String,
    whitelist: Arc<KeyValueStore>,
    domain_limits: Arc<KeyValueStore>,
}

impl Settings {
    /// Effective limit for a sender at `domain`.
    ///
    /// A domain entry whose value is not a number denies all mail from
    /// that domain.
    fn limit_for(&self, domain: &str) -> u64 {
        match self.domain_limits.get(domain) {
            None => self.default_limit,
            Some(value) => value.parse().unwrap_or_else(|_| {
                warn!(domain, value = %value, "Cannot parse domain limit, using 0");
                0
            }),
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Split an address into its domain, using the last `@`.
///
/// Returns an empty string when there is no `@`.
pub fn sender_domain(sender: &str) -> &str {
    sender.rsplit_once('@').map(|(_, domain)| domain).unwrap_or("")
}

impl RateLimiter {
    /// Create a rate limiter with default settings and the system clock.
    pub fn new(whitelist: Arc<KeyValueStore>, domain_limits: Arc<KeyValueStore>) -> Self {
        Self::with_clock(whitelist, domain_limits, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter reading time from `clock`.
    pub fn with_clock(
        whitelist: Arc<KeyValueStore>,
        domain_limits: Arc<KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings: Mutex::new(Settings {
                default_limit: DEFAULT_LIMIT,
                window: DEFAULT_WINDOW,
                defer_message: DEFAULT_DEFER_MESSAGE.to_string(),
                whitelist,
                domain_limits,
            }),
            registry: TokenRegistry::new(),
            clock,
        }
    }

    /// Create a rate limiter from the rate limiting configuration section.
    pub fn from_config(
        config: &RateLimitingConfig,
        whitelist: Arc<KeyValueStore>,
        domain_limits: Arc<KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Self::with_clock(whitelist, domain_limits, clock);
        limiter.set_default_limit(config.default_limit);
        limiter.set_window(config.window());
        if let Some(message) = &config.defer_message {
            limiter.set_defer_message(message.clone());
        }
        limiter
    }

    pub fn set_default_limit(&self, limit: u64) {
        self.settings.lock().default_limit = limit;
    }

    pub fn set_window(&self, window: Duration) {
        self.settings.lock().window = window;
    }

    pub fn set_defer_message(&self, message: impl Into<String>) {
        self.settings.lock().defer_message = message.into();
    }

    /// Swap in a new whitelist; decisions already running keep the old one.
    pub fn set_whitelist(&self, whitelist: Arc<KeyValueStore>) {
        self.settings.lock().whitelist = whitelist;
    }

    /// Swap in a new domain limit table.
    pub fn set_domain_list(&self, domain_limits: Arc<KeyValueStore>) {
        self.settings.lock().domain_limits = domain_limits;
    }

    pub fn default_limit(&self) -> u64 {
        self.settings.lock().default_limit
    }

    pub fn window(&self) -> Duration {
        self.settings.lock().window
    }

    /// The token registry backing this limiter.
    pub fn registry(&self) -> &TokenRegistry {
        &self.registry
    }

    /// Check `sender` against its limit and record the message if allowed.
    ///
    /// A deferred message is not counted toward the window.
    pub fn decide(&self, sender: &str, recipients: u64) -> Action {
        let settings = self.settings.lock();

        let recipients = if recipients == 0 {
            debug!(sender, "Recipient count is 0, counting as 1");
            1
        } else {
            recipients
        };

        let domain = sender_domain(sender);

        if settings.whitelist.contains(sender) {
            debug!(sender, "Allowing whitelisted sender");
            return Action::Accept;
        }
        if settings.whitelist.contains(domain) {
            debug!(sender, domain, "Allowing whitelisted domain");
            return Action::Accept;
        }

        let limit = settings.limit_for(domain);
        let token = self.registry.get_or_create(sender);

        let now = self.clock.now();
        token.prune(settings.cutoff(now));

        let projected = token.count().saturating_add(recipients);
        if projected > limit {
            info!(sender, limit, projected, "Message deferred, rate limit reached");
            return Action::Defer(settings.defer_message.clone());
        }

        if let Err(err) = token.record(now, recipients) {
            warn!(sender, limit, error = %err, "Message deferred, recipient count overflow");
            return Action::Defer(settings.defer_message.clone());
        }
        debug!(
            sender,
            recipients,
            current = token.count(),
            limit,
            senders = self.registry.len(),
            "Message accepted"
        );
        Action::Accept
    }

    /// Aggregate token statistics.
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Log aggregate token statistics.
    pub fn report(&self) {
        let stats = self.stats();
        info!(
            tokens = stats.tokens,
            buckets = stats.buckets,
            buckets_per_token = stats.buckets_per_token(),
            messages = stats.messages,
            messages_per_token = stats.messages_per_token(),
            "Token statistics"
        );
    }

    /// Write all tokens to a snapshot file.
    pub fn save_tokens<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let _settings = self.settings.lock();
        self.registry.serialize(path)
    }

    /// Merge tokens from a snapshot file.
    pub fn load_tokens<P: AsRef<Path>>(&self, path: P) -> Result<SnapshotLoad> {
        let _settings = self.settings.lock();
        self.registry.deserialize(path)
    }
}

impl PolicyBackend for RateLimiter {
    fn decide(&self, sender: &str, recipients: u64) -> Action {
        RateLimiter::decide(self, sender, recipients)
    }
}
