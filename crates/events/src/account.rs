//! Account lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bankrelay_core::AccountId;

use crate::event::Event;

/// Every event an account can emit.
///
/// Serialized internally tagged (`"kind": "cpf_changed"`) with camelCase
/// fields, so consumers can branch on `kind` without knowing the Rust type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AccountEvent {
    Created {
        account_id: AccountId,
        name: String,
        cpf: String,
        is_active: bool,
        is_deleted: bool,
        created_at: DateTime<Utc>,
    },
    Activated {
        account_id: AccountId,
    },
    Deactivated {
        account_id: AccountId,
    },
    Deleted {
        account_id: AccountId,
    },
    Restored {
        account_id: AccountId,
    },
    CpfChanged {
        account_id: AccountId,
        old_cpf: String,
        new_cpf: String,
    },
    NameChanged {
        account_id: AccountId,
        old_name: String,
        new_name: String,
    },
    /// Full snapshot after an edit.
    Updated {
        account_id: AccountId,
        name: String,
        cpf: String,
        is_active: bool,
        is_deleted: bool,
        updated_at: DateTime<Utc>,
    },
}

impl AccountEvent {
    pub fn account_id(&self) -> AccountId {
        match self {
            Self::Created { account_id, .. }
            | Self::Activated { account_id }
            | Self::Deactivated { account_id }
            | Self::Deleted { account_id }
            | Self::Restored { account_id }
            | Self::CpfChanged { account_id, .. }
            | Self::NameChanged { account_id, .. }
            | Self::Updated { account_id, .. } => *account_id,
        }
    }
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "accounts.account.created",
            Self::Activated { .. } => "accounts.account.activated",
            Self::Deactivated { .. } => "accounts.account.deactivated",
            Self::Deleted { .. } => "accounts.account.deleted",
            Self::Restored { .. } => "accounts.account.restored",
            Self::CpfChanged { .. } => "accounts.account.cpf_changed",
            Self::NameChanged { .. } => "accounts.account.name_changed",
            Self::Updated { .. } => "accounts.account.updated",
        }
    }
}
