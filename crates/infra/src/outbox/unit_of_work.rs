//! Units of work that commit business writes and outbox rows together.
//!
//! Staging is synchronous buffering; nothing becomes visible until `commit`.
//! Dropping a unit of work without committing discards everything it staged.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use bankrelay_accounts::Account;
use bankrelay_core::{AccountId, Entity};

use crate::accounts::InMemoryAccountStore;

use super::in_memory::InMemoryOutboxStore;
use super::postgres::{insert_rows, map_sqlx_error};
use super::row::OutboxRow;
use super::store::OutboxStoreError;

/// Anything outbox rows can be staged into.
pub trait OutboxStaging {
    fn add_range(&mut self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError>;
}

impl OutboxStaging for Vec<OutboxRow> {
    fn add_range(&mut self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError> {
        self.extend(rows);
        Ok(())
    }
}

/// In-memory unit of work over an account store and an outbox store.
pub struct InMemoryUnitOfWork {
    accounts: Arc<InMemoryAccountStore>,
    outbox: Arc<InMemoryOutboxStore>,
    pending_accounts: HashMap<AccountId, Account>,
    staged: Vec<OutboxRow>,
}

impl InMemoryUnitOfWork {
    pub fn begin(accounts: Arc<InMemoryAccountStore>, outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            accounts,
            outbox,
            pending_accounts: HashMap::new(),
            staged: Vec::new(),
        }
    }

    /// Read an account, seeing this unit's own uncommitted writes.
    pub fn load_account(&self, id: AccountId) -> Result<Option<Account>, OutboxStoreError> {
        if let Some(account) = self.pending_accounts.get(&id) {
            return Ok(Some(account.clone()));
        }
        self.accounts.get(id)
    }

    pub fn save_account(&mut self, account: Account) {
        self.pending_accounts.insert(*account.id(), account);
    }

    pub fn staged_rows(&self) -> &[OutboxRow] {
        &self.staged
    }

    /// Apply account writes and outbox rows as one step.
    ///
    /// The account lock is held across the outbox insert so a rejected insert
    /// (e.g. duplicate id) leaves the account store untouched.
    pub fn commit(self) -> Result<(), OutboxStoreError> {
        let mut accounts = self.accounts.write()?;
        let row_count = self.staged.len();

        self.outbox.insert_all(self.staged)?;
        for (id, account) in self.pending_accounts {
            accounts.insert(id, account);
        }

        debug!(row_count, "in-memory unit of work committed");
        Ok(())
    }

    /// Discard everything. Equivalent to dropping.
    pub fn rollback(self) {}
}

impl OutboxStaging for InMemoryUnitOfWork {
    fn add_range(&mut self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError> {
        self.staged.extend(rows);
        Ok(())
    }
}

/// Postgres unit of work: an open transaction plus staged outbox rows.
///
/// Business writes go through [`PgUnitOfWork::transaction`]; staged rows are
/// inserted into the same transaction right before it commits.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    staged: Vec<OutboxRow>,
}

impl PgUnitOfWork {
    pub async fn begin(pool: &PgPool) -> Result<Self, OutboxStoreError> {
        let tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Self {
            tx,
            staged: Vec::new(),
        })
    }

    pub fn transaction(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }

    pub async fn commit(mut self) -> Result<(), OutboxStoreError> {
        insert_rows(&mut self.tx, &self.staged).await?;
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(row_count = self.staged.len(), "postgres unit of work committed");
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), OutboxStoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

impl OutboxStaging for PgUnitOfWork {
    fn add_range(&mut self, rows: Vec<OutboxRow>) -> Result<(), OutboxStoreError> {
        self.staged.extend(rows);
        Ok(())
    }
}
