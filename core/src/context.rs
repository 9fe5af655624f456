//! Request-scoped tenant context.
//!
//! Every store query takes the tenant id from here explicitly; nothing
//! relies on connection-level session state.

use serde::{Deserialize, Serialize};

use crate::types::{TenantId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Player,
    Cashier,
    Operator,
    Owner,
    System,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Cashier => "cashier",
            Self::Operator => "operator",
            Self::Owner => "owner",
            Self::System => "system",
        }
    }

    /// Roles allowed to issue and cancel vouchers.
    pub fn is_staff(&self) -> bool {
        !matches!(self, Self::Player)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub role: ActorRole,
    pub actor_id: Option<UserId>,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<TenantId>, role: ActorRole, actor_id: Option<UserId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            role,
            actor_id,
        }
    }

    pub fn player(tenant_id: impl Into<TenantId>, player_id: impl Into<UserId>) -> Self {
        Self::new(tenant_id, ActorRole::Player, Some(player_id.into()))
    }

    pub fn staff(tenant_id: impl Into<TenantId>, role: ActorRole, staff_id: impl Into<UserId>) -> Self {
        Self::new(tenant_id, role, Some(staff_id.into()))
    }

    pub fn system(tenant_id: impl Into<TenantId>) -> Self {
        Self::new(tenant_id, ActorRole::System, None)
    }
}
