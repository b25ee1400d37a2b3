//! Periodic credential health sweeps
//!
//! Every provider is swept on its own period. A sweep probes active
//! credentials and cooling credentials whose window has elapsed, applies the
//! resulting transitions through the [`CredentialPool`], then purges invalid
//! credentials. Sweeps run beside live translation traffic and share nothing
//! with it but the pool.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::credentials::CredentialPool;
use crate::error::{ProviderFailure, RelayError, Result};
use crate::providers::ProviderRegistry;
use crate::types::{Credential, CredentialStatus, Provider};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    /// Cooling credentials returned to active
    pub recovered: usize,
    /// Active credentials found rate limited
    pub exhausted: usize,
    pub invalidated: usize,
    /// Invalid credentials deleted at the end of the sweep
    pub removed: u64,
}

#[derive(Clone)]
pub struct HealthMonitor {
    pool: CredentialPool,
    providers: ProviderRegistry,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(pool: CredentialPool, providers: ProviderRegistry, probe_timeout: Duration) -> Self {
        Self {
            pool,
            providers,
            probe_timeout,
        }
    }

    pub async fn sweep(&self, provider: Provider) -> Result<SweepReport> {
        self.sweep_at(provider, chrono::Utc::now().timestamp()).await
    }

    pub async fn sweep_at(&self, provider: Provider, now: i64) -> Result<SweepReport> {
        let adapter = self.providers.get(provider).ok_or_else(|| {
            RelayError::InvalidInput(format!("no adapter registered for {}", provider))
        })?;

        let mut report = SweepReport::default();
        for credential in self.pool.list(provider).await? {
            match credential.status {
                CredentialStatus::Active => {
                    report.probed += 1;
                    match self.probe(adapter.as_ref(), &credential).await {
                        Ok(()) => {}
                        Err(ProviderFailure::Unauthorized(_)) => {
                            self.pool.mark_invalid(&credential).await?;
                            report.invalidated += 1;
                        }
                        Err(ProviderFailure::RateLimited(_)) => {
                            self.pool
                                .mark_exhausted_at(&credential, adapter.cooldown(), now)
                                .await?;
                            report.exhausted += 1;
                        }
                        Err(failure) => {
                            debug!(credential_id = credential.id, "Probe inconclusive: {}", failure);
                        }
                    }
                }
                CredentialStatus::Cooling if credential.cooldown_elapsed(now) => {
                    report.probed += 1;
                    match self.probe(adapter.as_ref(), &credential).await {
                        Ok(()) => {
                            self.pool.mark_healthy(&credential).await?;
                            report.recovered += 1;
                        }
                        Err(ProviderFailure::Unauthorized(_)) => {
                            self.pool.mark_invalid(&credential).await?;
                            report.invalidated += 1;
                        }
                        // Cooldown stays as it is
                        Err(failure) => {
                            debug!(credential_id = credential.id, "Still unavailable: {}", failure);
                        }
                    }
                }
                CredentialStatus::Cooling | CredentialStatus::Invalid => {}
            }
        }

        report.removed = self.pool.purge_invalid(provider).await?;
        info!(
            provider = %provider,
            probed = report.probed,
            recovered = report.recovered,
            exhausted = report.exhausted,
            invalidated = report.invalidated,
            removed = report.removed,
            "Health sweep finished"
        );
        Ok(report)
    }

    async fn probe(
        &self,
        adapter: &dyn crate::providers::TranslationProvider,
        credential: &Credential,
    ) -> std::result::Result<(), ProviderFailure> {
        match timeout(self.probe_timeout, adapter.probe(credential)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderFailure::Transient(format!(
                "probe timed out after {}s",
                self.probe_timeout.as_secs()
            ))),
        }
    }

    /// Start one background sweep loop per provider, each on its own period.
    ///
    /// Loops stop once `shutdown` turns true or its sender is dropped.
    pub fn spawn(
        &self,
        periods: &[(Provider, Duration)],
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        periods
            .iter()
            .map(|&(provider, period)| {
                let monitor = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    info!(provider = %provider, period_secs = period.as_secs(), "Health monitor started");

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if let Err(e) = monitor.sweep(provider).await {
                                    error!(provider = %provider, "Health sweep failed: {}", e);
                                }
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    info!(provider = %provider, "Health monitor stopped");
                })
            })
            .collect()
    }
}
