//! Verification code redemption
//!
//! Validates a submitted code against the durable row. Checks run in a fixed
//! order and fail closed: unknown code, consumed code, wrong principal, wrong
//! bot.

use super::{Activation, ActivationStatus, BotIdentity, Principal};
use crate::storage::{ActivationStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Reasons a code cannot be redeemed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RedeemError {
    /// No activation carries this code
    #[error("invalid code")]
    InvalidCode,
    /// The code was consumed or the row left `pending`
    #[error("code already used")]
    AlreadyUsed,
    /// The presenting user is not the authorized principal
    #[error("code belongs to {authorized}")]
    Unauthorized {
        /// Principal the code was issued to
        authorized: String,
    },
    /// The row was issued for another bot
    #[error("code is bound to {expected}")]
    BotMismatch {
        /// Bot named by the row
        expected: BotIdentity,
    },
    /// Store lookup failed
    #[error("store error: {0}")]
    Storage(String),
}

impl From<StorageError> for RedeemError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Pure validation of a looked-up row.
///
/// # Errors
///
/// Returns the first failed check.
pub fn validate(
    row: &Activation,
    presenter: &Principal,
    responder: &BotIdentity,
) -> Result<(), RedeemError> {
    if row.code_used_at.is_some() || row.status != ActivationStatus::Pending {
        return Err(RedeemError::AlreadyUsed);
    }
    if !presenter.matches(&row.authorized_principal) {
        return Err(RedeemError::Unauthorized {
            authorized: row.authorized_principal.clone(),
        });
    }
    match &row.selected_bot {
        Some(expected) if expected != responder => Err(RedeemError::BotMismatch {
            expected: expected.clone(),
        }),
        _ => Ok(()),
    }
}

/// Looks codes up in the durable store and validates them
#[derive(Clone)]
pub struct VerificationRedeemer {
    store: Arc<dyn ActivationStore>,
}

impl VerificationRedeemer {
    /// Create a redeemer backed by `store`
    #[must_use]
    pub fn new(store: Arc<dyn ActivationStore>) -> Self {
        Self { store }
    }

    /// Validate `raw_code` for `presenter` answering through `responder`.
    ///
    /// Success only proves the row may move to `active`; the transition
    /// itself is a separate guarded update.
    ///
    /// # Errors
    ///
    /// Returns a `RedeemError` describing the first failed check.
    pub async fn redeem(
        &self,
        raw_code: &str,
        presenter: &Principal,
        responder: &BotIdentity,
    ) -> Result<Activation, RedeemError> {
        let code = raw_code.trim();
        if code.is_empty() {
            return Err(RedeemError::InvalidCode);
        }

        let Some(row) = self.store.find_by_code(code).await? else {
            info!(presenter = %presenter.display(), "Unknown verification code");
            return Err(RedeemError::InvalidCode);
        };

        if let Err(e) = validate(&row, presenter, responder) {
            warn!(
                activation_id = %row.id,
                presenter = %presenter.display(),
                bot = %responder,
                error = %e,
                "Verification code rejected"
            );
            return Err(e);
        }

        Ok(row)
    }
}
