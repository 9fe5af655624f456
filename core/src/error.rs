use serde::Serialize;
use thiserror::Error;

use crate::types::Cents;

/// Evidence carried by a tripped loss-limit gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LossLimitBreach {
    pub loss_limit_cents: Cents,
    pub current_loss_cents: Cents,
    pub projected_loss_cents: Cents,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Loss limit reached for this session.")]
    LossLimitReached(LossLimitBreach),

    #[error("Loss limit cannot be increased once set ({current_cents} -> {requested_cents})")]
    LossLimitLocked {
        current_cents: Cents,
        requested_cents: Cents,
    },

    #[error("Voucher not found")]
    VoucherNotFound,

    #[error("Voucher expired")]
    VoucherExpired,

    #[error("Voucher is {status}, not redeemable")]
    VoucherNotRedeemable { status: String },

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Role '{role}' may not {action}")]
    Forbidden { role: &'static str, action: &'static str },

    #[error("Tenant '{tenant_id}' not found")]
    TenantNotFound { tenant_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for the routing layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) | Self::Serialization(_) | Self::Other(_) => "INTERNAL_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::LossLimitReached(_) => "LOSS_LIMIT_REACHED",
            Self::LossLimitLocked { .. } => "LOSS_LIMIT_LOCKED",
            Self::VoucherNotFound => "VOUCHER_NOT_FOUND",
            Self::VoucherExpired => "VOUCHER_EXPIRED",
            Self::VoucherNotRedeemable { .. } => "VOUCHER_NOT_REDEEMABLE",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::TenantNotFound { .. } => "TENANT_NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
        }
    }

    /// Suggested HTTP status for the routing layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::VoucherExpired => 400,
            Self::InsufficientFunds => 402,
            Self::LossLimitReached(_) | Self::Forbidden { .. } => 403,
            Self::VoucherNotFound | Self::TenantNotFound { .. } => 404,
            Self::LossLimitLocked { .. } | Self::VoucherNotRedeemable { .. } => 409,
            Self::Database(_) | Self::Serialization(_) | Self::Other(_) => 500,
        }
    }

    pub fn loss_limit_breach(&self) -> Option<&LossLimitBreach> {
        match self {
            Self::LossLimitReached(breach) => Some(breach),
            _ => None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_limit_maps_to_forbidden() {
        let err = CoreError::LossLimitReached(LossLimitBreach {
            loss_limit_cents: 10_000,
            current_loss_cents: 9_000,
            projected_loss_cents: 10_500,
        });
        assert_eq!(err.code(), "LOSS_LIMIT_REACHED");
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.loss_limit_breach().unwrap().projected_loss_cents, 10_500);
    }

    #[test]
    fn locked_limit_maps_to_conflict() {
        let err = CoreError::LossLimitLocked {
            current_cents: 500,
            requested_cents: 800,
        };
        assert_eq!(err.code(), "LOSS_LIMIT_LOCKED");
        assert_eq!(err.http_status(), 409);
    }
}
