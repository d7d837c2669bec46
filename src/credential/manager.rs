//! Per-instance credential orchestration: ordered election, cached reads,
//! collapsed refresh, taint-aware re-election.

use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use super::{Credential, CredentialStrategy, StrategyContext};
use crate::config::AuthenticationConfig;
use crate::{JanusError, Result};

#[derive(Clone)]
struct CurrentState {
    index: usize,
    credential: Credential,
}

pub struct CredentialManager {
    instance_name: String,
    strategies: Vec<CredentialStrategy>,
    cx: StrategyContext,
    current: RwLock<Option<CurrentState>>,
    /// Collapses concurrent refreshers; at most one refresh in flight.
    refresh_lock: Mutex<()>,
    /// Incremented on every strategy change; observable in metrics.
    epoch: AtomicU64,
}

impl CredentialManager {
    pub fn new(
        instance_name: impl Into<String>,
        authentication: &AuthenticationConfig,
        cx: StrategyContext,
    ) -> Self {
        let strategies = authentication
            .strategies
            .iter()
            .map(CredentialStrategy::from_config)
            .collect();
        Self {
            instance_name: instance_name.into(),
            strategies,
            cx,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_strategies(
        instance_name: impl Into<String>,
        strategies: Vec<CredentialStrategy>,
        cx: StrategyContext,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            strategies,
            cx,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Tries strategies in declared order; the first whose `init` and first
    /// `get` both succeed becomes current. Returns an error when none do,
    /// leaving the instance unusable.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        match self.elect(None).await {
            Some((index, credential)) => {
                tracing::info!(
                    instance = %self.instance_name,
                    strategy = self.strategies[index].kind(),
                    "elected credential strategy"
                );
                *self.current.write().await = Some(CurrentState { index, credential });
                Ok(())
            }
            None => Err(self.unavailable()),
        }
    }

    /// Returns a fresh credential, refreshing or re-electing as needed.
    /// Concurrent callers that observe an expired credential collapse onto a
    /// single refresh.
    pub async fn get(&self) -> Result<Credential> {
        let now = OffsetDateTime::now_utc();
        {
            let current = self.current.read().await;
            if let Some(state) = current.as_ref() {
                if state.credential.is_fresh(now) {
                    return Ok(state.credential.clone());
                }
            }
        }

        let _guard = self.refresh_lock.lock().await;
        // A collapsed racer may already have refreshed.
        let now = OffsetDateTime::now_utc();
        let current_index = {
            let current = self.current.read().await;
            match current.as_ref() {
                Some(state) if state.credential.is_fresh(now) => {
                    return Ok(state.credential.clone());
                }
                Some(state) => Some(state.index),
                None => None,
            }
        };

        if let Some(index) = current_index {
            match self.strategies[index].refresh(&self.cx).await {
                Ok(credential) => {
                    *self.current.write().await = Some(CurrentState {
                        index,
                        credential: credential.clone(),
                    });
                    return Ok(credential);
                }
                Err(err) => {
                    tracing::warn!(
                        instance = %self.instance_name,
                        strategy = self.strategies[index].kind(),
                        error = %err,
                        "credential refresh failed, attempting re-election"
                    );
                }
            }
        }

        match self.elect(current_index).await {
            Some((index, credential)) => {
                if current_index != Some(index) {
                    self.epoch.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(
                        instance = %self.instance_name,
                        strategy = self.strategies[index].kind(),
                        epoch = self.epoch.load(Ordering::SeqCst),
                        "credential strategy changed"
                    );
                }
                *self.current.write().await = Some(CurrentState {
                    index,
                    credential: credential.clone(),
                });
                Ok(credential)
            }
            None => {
                *self.current.write().await = None;
                Err(self.unavailable())
            }
        }
    }

    /// Full-list election, skipping tainted strategies and the strategy that
    /// just failed.
    async fn elect(&self, failed: Option<usize>) -> Option<(usize, Credential)> {
        for (index, strategy) in self.strategies.iter().enumerate() {
            if Some(index) == failed || strategy.is_tainted().await {
                continue;
            }
            if let Err(err) = strategy.init(&self.cx).await {
                tracing::debug!(
                    instance = %self.instance_name,
                    strategy = strategy.kind(),
                    error = %err,
                    "strategy ineligible"
                );
                continue;
            }
            match strategy.get(&self.cx).await {
                Ok(credential) => return Some((index, credential)),
                Err(err) => {
                    tracing::debug!(
                        instance = %self.instance_name,
                        strategy = strategy.kind(),
                        error = %err,
                        "strategy acquisition failed during election"
                    );
                }
            }
        }
        None
    }

    pub async fn current_strategy(&self) -> Option<&'static str> {
        let current = self.current.read().await;
        current.as_ref().map(|state| self.strategies[state.index].kind())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn unavailable(&self) -> JanusError {
        let tried = self
            .strategies
            .iter()
            .map(|s| s.kind())
            .collect::<Vec<_>>()
            .join(", ");
        JanusError::ServiceUnavailable {
            message: format!(
                "instance {}: no credential strategy succeeded (tried: {tried})",
                self.instance_name
            ),
        }
    }
}
