//! Withdrawal Pipeline
//!
//! Drives one withdrawal through its lifecycle:
//! 1. validate, persist as `Requested`, reserve funds with a pending debit
//!    (a balance shortfall rejects without touching the chain)
//! 2. evaluate risk against the history preceding the reservation
//! 3. submit the transfer keyed by the withdrawal id
//! 4. poll the receipt until it is terminal, then finalize or release
//!
//! The request record is persisted before each step that touches the chain,
//! so a restart can pick up from the stored state through [`WithdrawalPipeline::resume`].

use chain_gateway::{
    ChainGateway, GatewayError, RetryError, RetryPolicy, Retryable, TransactionStatus,
};
use chrono::Utc;
use ledger::{
    BlacklistRepository, LedgerError, LedgerRecorder, RepositoryError, RiskConfigRepository,
    WithdrawRepository,
};
use risk_engine::{RiskEngine, RiskInputs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::errors::{TransitionError, ValidationError};
use types::ids::{AssetId, WithdrawId};
use types::ledger::EntryStatus;
use types::risk::{Rejection, RiskConfig, RiskDecision, RiskScope};
use types::withdrawal::{
    WithdrawOrder, WithdrawRequest, WithdrawStatus, CONFIRMATION_TIMEOUT, SUBMISSION_TIMEOUT,
};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid withdrawal: {0}")]
    Validation(#[from] ValidationError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Chain error: {0}")]
    Chain(#[from] GatewayError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Withdrawal {0} not found")]
    NotFound(WithdrawId),

    #[error("Withdrawal {id} is {status}; cannot {operation}")]
    InvalidState {
        id: WithdrawId,
        status: WithdrawStatus,
        operation: &'static str,
    },

    #[error("Confirmation polling for {0} cancelled")]
    Cancelled(WithdrawId),
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Resubmission of a transfer that never reached the chain
    pub submission_retry: RetryPolicy,
    /// Applied to each receipt poll; exhaustion ends in "confirmation timeout"
    pub confirmation_retry: RetryPolicy,
    /// Wait between polls while the transaction is not yet mined
    pub poll_interval: Duration,
    /// Not-yet-mined polls tolerated before giving up
    pub max_pending_polls: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            submission_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(5),
                multiplier: 2.0,
            },
            confirmation_retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                multiplier: 2.0,
            },
            poll_interval: Duration::from_secs(3),
            max_pending_polls: 200,
        }
    }
}

/// Transfer failure as seen by the submission retry.
///
/// Only transport errors are retried. A timeout may hide a transfer that
/// landed, so it is left to reconciliation.
#[derive(Debug)]
struct SubmitFailure(GatewayError);

impl Retryable for SubmitFailure {
    fn is_retryable(&self) -> bool {
        matches!(self.0, GatewayError::Transient(_))
    }
}

impl fmt::Display for SubmitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Collaborators handed to the pipeline at construction
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<LedgerRecorder>,
    pub withdrawals: Arc<dyn WithdrawRepository>,
    pub risk_configs: Arc<dyn RiskConfigRepository>,
    pub blacklist: Arc<dyn BlacklistRepository>,
    pub gateway: Arc<ChainGateway>,
}

// ── Pipeline ────────────────────────────────────────────────────────

pub struct WithdrawalPipeline {
    ledger: Arc<LedgerRecorder>,
    withdrawals: Arc<dyn WithdrawRepository>,
    risk_configs: Arc<dyn RiskConfigRepository>,
    blacklist: Arc<dyn BlacklistRepository>,
    gateway: Arc<ChainGateway>,
    risk: RiskEngine,
    config: PipelineConfig,
    shutdown: CancellationToken,
}

impl WithdrawalPipeline {
    pub fn new(collaborators: Collaborators, risk: RiskEngine, config: PipelineConfig) -> Self {
        Self {
            ledger: collaborators.ledger,
            withdrawals: collaborators.withdrawals,
            risk_configs: collaborators.risk_configs,
            blacklist: collaborators.blacklist,
            gateway: collaborators.gateway,
            risk,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie confirmation polling to an external shutdown signal.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run a new withdrawal as far as it can go without operator input.
    ///
    /// Returns the request in its last persisted state: a terminal state,
    /// `RiskChecked` when held for manual review.
    pub async fn process(&self, order: WithdrawOrder) -> Result<WithdrawRequest, PipelineError> {
        let request = order.validate()?;
        info!(
            withdraw_id = %request.id,
            user_id = %request.user_id,
            asset = %request.asset_id,
            to = %request.to_address,
            amount = %request.amount,
            "Withdrawal requested"
        );
        self.withdrawals.save_withdraw(&request).await?;
        self.drive(request).await
    }

    /// Continue a persisted withdrawal from its stored state.
    ///
    /// A submitted request is polled, never resubmitted. A failed request
    /// with a known chain outcome gets its reservation released if a crash
    /// interrupted that step.
    pub async fn resume(&self, id: WithdrawId) -> Result<WithdrawRequest, PipelineError> {
        let request = self.load(id).await?;
        debug!(withdraw_id = %id, status = %request.status, "Resuming withdrawal");
        if request.status == WithdrawStatus::Failed && !request.is_unresolved() {
            let reference = request.reference();
            if self.ledger.reservation_status(&reference) == Some(EntryStatus::Pending) {
                self.ledger.release(&reference)?;
                info!(withdraw_id = %id, "Reservation released for failed withdrawal");
            }
            return Ok(request);
        }
        self.drive(request).await
    }

    /// Operator decision on a request held for manual review.
    pub async fn resolve_review(
        &self,
        id: WithdrawId,
        approve: bool,
        note: &str,
    ) -> Result<WithdrawRequest, PipelineError> {
        let mut request = self.load(id).await?;
        let held = request.status == WithdrawStatus::RiskChecked
            && matches!(request.risk_decision, Some(RiskDecision::ManualReview { .. }));
        if !held {
            return Err(PipelineError::InvalidState {
                id,
                status: request.status,
                operation: "resolve review",
            });
        }
        let decision = if approve {
            RiskDecision::Approve
        } else {
            RiskDecision::Reject(Rejection::ReviewDeclined {
                reason: note.to_string(),
            })
        };
        info!(withdraw_id = %id, approve, note, "Manual review resolved");
        request.risk_reason = Some(note.to_string());
        request.risk_decision = Some(decision);
        let request = self.apply_decision(request).await?;
        self.drive(request).await
    }

    /// Re-poll a timed-out request once. A success receipt finalizes it, a
    /// failure receipt releases it, a still-pending one is left unchanged.
    pub async fn reconcile_timeout(&self, id: WithdrawId) -> Result<WithdrawRequest, PipelineError> {
        let mut request = self.load(id).await?;
        let tx_hash = match request.tx_hash {
            Some(hash) if request.is_confirmation_timeout() => hash,
            _ => {
                return Err(PipelineError::InvalidState {
                    id,
                    status: request.status,
                    operation: "reconcile timeout",
                })
            }
        };
        let status = self
            .config
            .confirmation_retry
            .run("transaction_receipt", |_| self.gateway.transaction_status(tx_hash))
            .await
            .map_err(RetryError::into_inner)?;
        let reference = request.reference();
        match status {
            TransactionStatus::Pending => {
                info!(withdraw_id = %id, tx_hash = %tx_hash, "Transaction still pending");
            }
            TransactionStatus::Confirmed(receipt) => {
                self.ledger.finalize(&reference)?;
                request.advance(WithdrawStatus::Confirmed)?;
                request.failure_reason = None;
                self.withdrawals.save_withdraw(&request).await?;
                info!(
                    withdraw_id = %id,
                    tx_hash = %tx_hash,
                    block = receipt.block_number,
                    "Timed-out withdrawal reconciled as confirmed"
                );
            }
            TransactionStatus::Failed { reason, .. } => {
                request.failure_reason = Some(reason.as_str().to_string());
                request.updated_at = Utc::now();
                self.withdrawals.save_withdraw(&request).await?;
                self.ledger.release(&reference)?;
                warn!(withdraw_id = %id, reason = %reason, "Timed-out withdrawal reconciled as failed");
            }
        }
        Ok(request)
    }

    /// Administrative override: release the funds of a request whose chain
    /// outcome is unknown.
    pub async fn release_timed_out(
        &self,
        id: WithdrawId,
        reason: &str,
    ) -> Result<WithdrawRequest, PipelineError> {
        let mut request = self.load(id).await?;
        if !request.is_unresolved() {
            return Err(PipelineError::InvalidState {
                id,
                status: request.status,
                operation: "release reservation",
            });
        }
        request.failure_reason = Some(reason.to_string());
        request.updated_at = Utc::now();
        self.withdrawals.save_withdraw(&request).await?;
        self.ledger.release(&request.reference())?;
        warn!(withdraw_id = %id, reason, "Unresolved reservation released by operator");
        Ok(request)
    }

    /// Administrative compensation of a confirmed withdrawal.
    pub async fn revert_confirmed(
        &self,
        id: WithdrawId,
        reason: &str,
    ) -> Result<WithdrawRequest, PipelineError> {
        let mut request = self.load(id).await?;
        if request.status != WithdrawStatus::Confirmed {
            return Err(PipelineError::InvalidState {
                id,
                status: request.status,
                operation: "revert",
            });
        }
        self.ledger.reverse_final(&request.reference())?;
        request.advance(WithdrawStatus::Reverted)?;
        request.failure_reason = Some(reason.to_string());
        self.withdrawals.save_withdraw(&request).await?;
        warn!(withdraw_id = %id, reason, "Confirmed withdrawal reverted");
        Ok(request)
    }

    /// Requests a restart should pick up.
    pub async fn in_flight(&self) -> Result<Vec<WithdrawId>, PipelineError> {
        let requests = self
            .withdrawals
            .withdraws_with_status(&[
                WithdrawStatus::Requested,
                WithdrawStatus::RiskChecked,
                WithdrawStatus::Approved,
                WithdrawStatus::Submitted,
                WithdrawStatus::Failed,
            ])
            .await?;
        Ok(requests
            .into_iter()
            .filter(|r| match r.status {
                WithdrawStatus::RiskChecked => {
                    !matches!(r.risk_decision, Some(RiskDecision::ManualReview { .. }))
                }
                WithdrawStatus::Failed => {
                    !r.is_unresolved()
                        && self.ledger.reservation_status(&r.reference())
                            == Some(EntryStatus::Pending)
                }
                _ => true,
            })
            .map(|r| r.id)
            .collect())
    }

    // ── State Machine ───────────────────────────────────────────────

    async fn drive(&self, mut request: WithdrawRequest) -> Result<WithdrawRequest, PipelineError> {
        loop {
            request = match request.status {
                WithdrawStatus::Requested => self.evaluate(request).await?,
                WithdrawStatus::RiskChecked => match request.risk_decision {
                    Some(RiskDecision::Approve) | Some(RiskDecision::Reject(_)) => {
                        self.apply_decision(request).await?
                    }
                    _ => return Ok(request),
                },
                WithdrawStatus::Approved => self.submit(request).await?,
                WithdrawStatus::Submitted => self.confirm(request).await?,
                _ => return Ok(request),
            };
        }
    }

    async fn evaluate(&self, mut request: WithdrawRequest) -> Result<WithdrawRequest, PipelineError> {
        let reference = request.reference();
        let shortfall = if self.ledger.reservation_status(&reference).is_none() {
            match self.ledger.reserve(&request) {
                Ok(_) => None,
                Err(LedgerError::InsufficientFunds {
                    available,
                    requested,
                    ..
                }) => Some(Rejection::InsufficientFunds {
                    available,
                    requested,
                }),
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };

        let decision = match (shortfall, self.risk_config(&request.asset_id).await?) {
            (Some(rejection), _) => RiskDecision::Reject(rejection),
            (None, None) => {
                warn!(withdraw_id = %request.id, asset = %request.asset_id, "No risk configuration");
                RiskDecision::Reject(Rejection::ConfigUnavailable)
            }
            (None, Some(config)) => {
                let mut addresses = vec![request.to_address];
                addresses.extend(request.owner_address);
                let blacklist = self.blacklist.blacklist_entries(&addresses).await?;
                // A blacklisted destination rejects regardless of pause state
                let destination_blocked = blacklist.iter().any(|e| e.address == request.to_address);
                let contract_paused = if destination_blocked {
                    false
                } else {
                    self.gateway.is_paused().await?
                };
                let history =
                    self.ledger
                        .history_before(request.user_id, &request.asset_id, &reference);
                self.risk.evaluate(&RiskInputs {
                    request: &request,
                    history: &history,
                    config: &config,
                    blacklist: &blacklist,
                    contract_paused,
                })
            }
        };

        request.advance(WithdrawStatus::RiskChecked)?;
        request.risk_reason = decision.reason().map(str::to_string);
        request.risk_decision = Some(decision);
        self.withdrawals.save_withdraw(&request).await?;
        self.apply_decision(request).await
    }

    async fn risk_config(&self, asset: &AssetId) -> Result<Option<RiskConfig>, PipelineError> {
        if let Some(config) = self
            .risk_configs
            .load_risk_config(&RiskScope::Asset(asset.clone()))
            .await?
        {
            return Ok(Some(config));
        }
        Ok(self.risk_configs.load_risk_config(&RiskScope::Global).await?)
    }

    async fn apply_decision(
        &self,
        mut request: WithdrawRequest,
    ) -> Result<WithdrawRequest, PipelineError> {
        match request.risk_decision.clone() {
            Some(RiskDecision::Approve) => {
                request.advance(WithdrawStatus::Approved)?;
                self.withdrawals.save_withdraw(&request).await?;
                info!(withdraw_id = %request.id, "Withdrawal approved");
            }
            Some(RiskDecision::Reject(rejection)) => {
                let reference = request.reference();
                // A shortfall leaves nothing reserved
                if self.ledger.reservation_status(&reference).is_some() {
                    self.ledger.release(&reference)?;
                }
                request.advance(WithdrawStatus::Rejected)?;
                self.withdrawals.save_withdraw(&request).await?;
                info!(
                    withdraw_id = %request.id,
                    reason = rejection.reason(),
                    detail = %rejection,
                    "Withdrawal rejected"
                );
            }
            Some(RiskDecision::ManualReview { reason }) => {
                info!(withdraw_id = %request.id, reason = %reason, "Withdrawal held for manual review");
            }
            None => {}
        }
        Ok(request)
    }

    async fn submit(&self, mut request: WithdrawRequest) -> Result<WithdrawRequest, PipelineError> {
        let reference = request.reference();
        if request.tx_hash.is_some() {
            request.advance(WithdrawStatus::Submitted)?;
            self.withdrawals.save_withdraw(&request).await?;
            return Ok(request);
        }
        if self.ledger.reservation_status(&reference) != Some(EntryStatus::Pending) {
            return Err(PipelineError::InvalidState {
                id: request.id,
                status: request.status,
                operation: "submit without an open reservation",
            });
        }

        let submitted = self
            .config
            .submission_retry
            .run("transfer", |_| {
                let transfer =
                    self.gateway
                        .transfer(&reference, request.to_address, &request.amount);
                async move { transfer.await.map_err(SubmitFailure) }
            })
            .await
            .map_err(|err| err.into_inner().0);

        match submitted {
            Ok(tx_hash) => {
                request.tx_hash = Some(tx_hash);
                request.advance(WithdrawStatus::Submitted)?;
                self.withdrawals.save_withdraw(&request).await?;
                info!(withdraw_id = %request.id, tx_hash = %tx_hash, "Withdrawal submitted");
                Ok(request)
            }
            Err(err @ GatewayError::Timeout { .. }) => {
                request.failure_reason = Some(SUBMISSION_TIMEOUT.to_string());
                request.advance(WithdrawStatus::Failed)?;
                self.withdrawals.save_withdraw(&request).await?;
                error!(
                    withdraw_id = %request.id,
                    error = %err,
                    "Transfer outcome unknown; reservation held for reconciliation"
                );
                Ok(request)
            }
            Err(err) if err.is_retryable() || matches!(err, GatewayError::MissingSigner { .. }) => {
                warn!(withdraw_id = %request.id, error = %err, "Transfer not submitted");
                Err(err.into())
            }
            Err(err) => {
                request.failure_reason = Some(err.reason());
                request.advance(WithdrawStatus::Failed)?;
                self.withdrawals.save_withdraw(&request).await?;
                self.ledger.release(&reference)?;
                warn!(withdraw_id = %request.id, reason = %err.reason(), "Transfer rejected by chain");
                Ok(request)
            }
        }
    }

    async fn confirm(&self, mut request: WithdrawRequest) -> Result<WithdrawRequest, PipelineError> {
        let id = request.id;
        let tx_hash = request.tx_hash.ok_or(PipelineError::InvalidState {
            id,
            status: request.status,
            operation: "poll without a transaction hash",
        })?;
        let reference = request.reference();
        let mut pending_polls = 0u32;

        loop {
            let poll = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(PipelineError::Cancelled(id)),
                poll = self
                    .config
                    .confirmation_retry
                    .run("transaction_receipt", |_| self.gateway.transaction_status(tx_hash)) => poll,
            };

            match poll {
                Ok(TransactionStatus::Pending) => {
                    pending_polls += 1;
                    if pending_polls >= self.config.max_pending_polls {
                        return self.mark_timed_out(request, "still pending").await;
                    }
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Err(PipelineError::Cancelled(id)),
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(TransactionStatus::Confirmed(receipt)) => {
                    self.ledger.finalize(&reference)?;
                    request.advance(WithdrawStatus::Confirmed)?;
                    self.withdrawals.save_withdraw(&request).await?;
                    info!(
                        withdraw_id = %id,
                        tx_hash = %tx_hash,
                        block = receipt.block_number,
                        "Withdrawal confirmed"
                    );
                    return Ok(request);
                }
                Ok(TransactionStatus::Failed { reason, .. }) => {
                    request.failure_reason = Some(reason.as_str().to_string());
                    request.advance(WithdrawStatus::Failed)?;
                    self.withdrawals.save_withdraw(&request).await?;
                    self.ledger.release(&reference)?;
                    warn!(withdraw_id = %id, tx_hash = %tx_hash, reason = %reason, "Withdrawal failed on chain");
                    return Ok(request);
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    warn!(withdraw_id = %id, attempts, error = %last, "Receipt polling exhausted");
                    return self.mark_timed_out(request, "retries exhausted").await;
                }
                Err(RetryError::Terminal(err)) => return Err(err.into()),
            }
        }
    }

    async fn mark_timed_out(
        &self,
        mut request: WithdrawRequest,
        cause: &str,
    ) -> Result<WithdrawRequest, PipelineError> {
        request.failure_reason = Some(CONFIRMATION_TIMEOUT.to_string());
        request.advance(WithdrawStatus::Failed)?;
        self.withdrawals.save_withdraw(&request).await?;
        error!(
            withdraw_id = %request.id,
            tx_hash = ?request.tx_hash,
            cause,
            "Confirmation timeout; reservation held for reconciliation"
        );
        Ok(request)
    }

    async fn load(&self, id: WithdrawId) -> Result<WithdrawRequest, PipelineError> {
        self.withdrawals
            .load_withdraw(id)
            .await?
            .ok_or(PipelineError::NotFound(id))
    }
}
