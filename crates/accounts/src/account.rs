use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bankrelay_core::{AccountId, DomainError, DomainResult, Entity, ValueObject};

/// Account holder name.
///
/// Only structural checks live here (non-blank, trimmed). Richer naming rules
/// belong to the request-validation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountName(String);

impl AccountName {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for AccountName {}

/// Brazilian taxpayer number, stored as given (trimmed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cpf(String);

impl Cpf {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("cpf cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for Cpf {}

/// Aggregate root: Account.
///
/// Lifecycle flags:
/// - a deleted account is always inactive
/// - restoring re-activates
/// - a deleted account must be restored before it can be activated
///
/// Every mutating method takes `now` explicitly so callers drive time through
/// their injected clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    id: AccountId,
    name: AccountName,
    cpf: Cpf,
    is_active: bool,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Open a new, active account.
    pub fn create(id: AccountId, name: AccountName, cpf: Cpf, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            cpf,
            is_active: true,
            is_deleted: false,
            created_at: now,
            updated_at: None,
        }
    }

    /// Rebuild an account from persisted state.
    pub fn restore_from_parts(
        id: AccountId,
        name: AccountName,
        cpf: Cpf,
        is_active: bool,
        is_deleted: bool,
        created_at: DateTime<Utc>,
        updated_at: Option<DateTime<Utc>>,
    ) -> DomainResult<Self> {
        if is_deleted && is_active {
            return Err(DomainError::invariant("a deleted account cannot be active"));
        }
        Ok(Self {
            id,
            name,
            cpf,
            is_active,
            is_deleted,
            created_at,
            updated_at,
        })
    }

    pub fn id_typed(&self) -> AccountId {
        self.id
    }

    pub fn name(&self) -> &AccountName {
        &self.name
    }

    pub fn cpf(&self) -> &Cpf {
        &self.cpf
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn change_name(&mut self, name: AccountName, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_not_deleted("rename")?;
        self.name = name;
        self.touch(now);
        Ok(())
    }

    pub fn change_cpf(&mut self, cpf: Cpf, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_not_deleted("change the cpf of")?;
        self.cpf = cpf;
        self.touch(now);
        Ok(())
    }

    /// Returns `false` when the account was already active (nothing changed).
    pub fn activate(&mut self, now: DateTime<Utc>) -> DomainResult<bool> {
        if self.is_deleted {
            return Err(DomainError::conflict(
                "cannot activate a deleted account; restore it first",
            ));
        }
        if self.is_active {
            return Ok(false);
        }
        self.is_active = true;
        self.touch(now);
        Ok(true)
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_active {
            return Err(DomainError::conflict("account is already deactivated"));
        }
        self.is_active = false;
        self.touch(now);
        Ok(())
    }

    /// Soft delete.
    pub fn mark_as_deleted(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_deleted {
            return Err(DomainError::conflict("account is already deleted"));
        }
        self.is_deleted = true;
        self.is_active = false;
        self.touch(now);
        Ok(())
    }

    pub fn restore(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_deleted {
            return Err(DomainError::conflict("cannot restore an account that is not deleted"));
        }
        self.is_deleted = false;
        self.is_active = true;
        self.touch(now);
        Ok(())
    }

    fn ensure_not_deleted(&self, action: &str) -> DomainResult<()> {
        if self.is_deleted {
            return Err(DomainError::conflict(format!("cannot {action} a deleted account")));
        }
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = Some(now);
    }
}

impl Entity for Account {
    type Id = AccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
