//! Startup, reload and shutdown operations of the policy daemon.

use std::io;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SendgateConfig;
use crate::error::{Result, SendgateError};
use crate::policy::PolicyServer;
use crate::ratelimit::{Clock, KeyValueStore, RateLimiter, SystemClock};

/// A configured rate limiter plus the operations signals trigger on it.
pub struct Daemon {
    config: SendgateConfig,
    limiter: Arc<RateLimiter>,
}

impl Daemon {
    /// Load the map files and any saved tokens, using the system clock.
    pub fn bootstrap(config: SendgateConfig) -> Result<Self> {
        Self::bootstrap_with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Like [`Daemon::bootstrap`] with an explicit time source.
    ///
    /// Unreadable map files and an unreachable snapshot path are fatal. A
    /// snapshot that exists but cannot be read is logged and skipped.
    pub fn bootstrap_with_clock(config: SendgateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let settings = &config.rate_limiting;
        let (whitelist, domain_limits) = load_maps(&config)?;

        info!(
            default_limit = settings.default_limit,
            window_secs = settings.window_secs,
            whitelist_entries = whitelist.len(),
            domain_entries = domain_limits.len(),
            "Rate limiter configured"
        );

        let limiter = Arc::new(RateLimiter::from_config(
            settings,
            whitelist,
            domain_limits,
            clock,
        ));
        let daemon = Self { config, limiter };
        daemon.restore_state()?;
        Ok(daemon)
    }

    pub fn config(&self) -> &SendgateConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn restore_state(&self) -> Result<()> {
        let Some(path) = &self.config.rate_limiting.snapshot_path else {
            return Ok(());
        };

        match std::fs::metadata(path) {
            Ok(_) => {
                info!(path = %path.display(), "Found saved token snapshot, loading");
                if let Err(e) = self.limiter.load_tokens(path) {
                    warn!(error = %e, "Continuing without saved tokens");
                }
                self.limiter.report();
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No token snapshot found, starting empty");
                Ok(())
            }
            Err(source) => Err(SendgateError::Snapshot {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Re-read both map files and swap them into the limiter.
    ///
    /// Nothing is swapped unless both files load.
    pub fn reload_maps(&self) -> Result<()> {
        let (whitelist, domain_limits) = load_maps(&self.config)?;
        info!(
            whitelist_entries = whitelist.len(),
            domain_entries = domain_limits.len(),
            "Reloaded map files"
        );
        self.limiter.set_whitelist(whitelist);
        self.limiter.set_domain_list(domain_limits);
        self.limiter.report();
        Ok(())
    }

    /// [`Daemon::reload_maps`] on the blocking thread pool.
    pub async fn reload_maps_blocking(self: &Arc<Self>) -> Result<()> {
        let daemon = Arc::clone(self);
        tokio::task::spawn_blocking(move || daemon.reload_maps())
            .await
            .map_err(|e| SendgateError::Io(io::Error::other(e)))?
    }

    /// Write the token snapshot if a snapshot path is configured.
    ///
    /// Returns the number of bytes written.
    pub fn save_state(&self) -> Result<Option<usize>> {
        match &self.config.rate_limiting.snapshot_path {
            Some(path) => {
                info!(path = %path.display(), "Saving tokens");
                self.limiter.save_tokens(path).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Bind the policy listener on the configured address.
    pub async fn bind(&self) -> Result<PolicyServer<RateLimiter>> {
        let server = &self.config.server;
        PolicyServer::bind(
            (server.listen_address.as_str(), server.port),
            Arc::clone(&self.limiter),
        )
        .await
    }

    /// Serve policy requests until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        self.bind().await?.serve_with_shutdown(shutdown).await
    }

    /// [`Daemon::run`], then save the snapshot whether or not serving failed.
    ///
    /// A failed save is logged; the serving result is returned.
    pub async fn run_and_save<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let served = self.run(shutdown).await;
        if let Err(e) = &served {
            warn!(error = %e, "Policy server failed, saving tokens before exit");
        }
        if let Err(e) = self.save_state() {
            warn!(error = %e, "Failed to save tokens");
        }
        served
    }
}

fn load_maps(config: &SendgateConfig) -> Result<(Arc<KeyValueStore>, Arc<KeyValueStore>)> {
    let settings = &config.rate_limiting;
    let whitelist = KeyValueStore::load(&settings.whitelist_path)?;
    let domain_limits = KeyValueStore::load(&settings.domain_list_path)?;
    Ok((Arc::new(whitelist), Arc::new(domain_limits)))
}
