use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::client::TokenRefresher;
use super::token::{Clock, TokenStore};
use crate::config::Config;
use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub check_interval: Duration,
    pub refresh_threshold: Duration,
}

impl KeepAliveConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            check_interval: config.token_check_interval,
            refresh_threshold: config.token_refresh_threshold,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5 * 60),
            refresh_threshold: Duration::from_secs(10 * 60),
        }
    }
}

/// Result of one token check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    NoToken,
    Valid,
    Refreshed,
    RefreshFailed(AuthError),
    Expired,
}

/// Background task that refreshes the stored token before it expires.
///
/// Checks once right away and then every `check_interval`. An expired token
/// is cleared and reported on the returned channel so the caller can log
/// the user out.
pub struct TokenKeepAlive {
    handle: Option<JoinHandle<()>>,
}

impl TokenKeepAlive {
    pub fn spawn(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
        config: KeepAliveConfig,
    ) -> (Self, mpsc::UnboundedReceiver<AuthError>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = check_once(store.as_ref(), refresher.as_ref(), clock.as_ref(), config).await;
                if outcome == CheckOutcome::Expired && expired_tx.send(AuthError::Expired).is_err() {
                    log::debug!("Nobody listening for token expiry, stopping keep-alive");
                    break;
                }
            }
        });

        (Self { handle: Some(handle) }, expired_rx)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            log::debug!("Token keep-alive stopped");
        }
    }
}

impl Drop for TokenKeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

pub async fn check_once(
    store: &dyn TokenStore,
    refresher: &dyn TokenRefresher,
    clock: &dyn Clock,
    config: KeepAliveConfig,
) -> CheckOutcome {
    let Some(token) = store.load() else {
        return CheckOutcome::NoToken;
    };
    let now = clock.now();

    if token.is_expired(now) {
        log::warn!("Access token expired at {}, logging out", token.expires_at);
        store.clear();
        return CheckOutcome::Expired;
    }

    if !token.expires_within(now, config.refresh_threshold) {
        log::trace!("Access token valid until {}", token.expires_at);
        return CheckOutcome::Valid;
    }

    log::info!("Access token expires at {}, refreshing", token.expires_at);
    match refresher.refresh(&token).await {
        Ok(fresh) => {
            if let Err(e) = store.save(&fresh) {
                log::error!("Failed to store refreshed token: {:#}", e);
            }
            log::info!("Access token refreshed, now valid until {}", fresh.expires_at);
            CheckOutcome::Refreshed
        }
        Err(e) => {
            // 刷新失败时保留旧令牌，下次检查再试
            log::error!("Token refresh failed: {}", e);
            CheckOutcome::RefreshFailed(e)
        }
    }
}
