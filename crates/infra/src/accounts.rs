//! Account use cases over the in-memory account store.
//!
//! Each mutating use case runs in one [`InMemoryUnitOfWork`]: load, apply the
//! aggregate transition, build the event records, stage them, commit. A
//! domain error aborts before anything is staged.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use bankrelay_accounts::{Account, AccountName, Cpf};
use bankrelay_core::{AccountId, Clock, DomainError, IdGenerator};
use bankrelay_events::{AccountEvent, AccountEventFactory, EventRecord, JsonEventSerializer};

use crate::outbox::{DispatchError, EventDispatcher, InMemoryOutboxStore, InMemoryUnitOfWork, OutboxStoreError};

/// In-memory account persistence (committed state only).
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<AccountId, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: AccountId) -> Result<Option<Account>, OutboxStoreError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| OutboxStoreError::Storage("account lock poisoned".into()))?;
        Ok(accounts.get(&id).cloned())
    }

    pub fn find_by_cpf(&self, cpf: &Cpf) -> Result<Option<Account>, OutboxStoreError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| OutboxStoreError::Storage("account lock poisoned".into()))?;
        Ok(accounts.values().find(|a| a.cpf() == cpf).cloned())
    }

    pub(crate) fn write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<AccountId, Account>>, OutboxStoreError> {
        self.accounts
            .write()
            .map_err(|_| OutboxStoreError::Storage("account lock poisoned".into()))
    }
}

#[derive(Debug, Error)]
pub enum AccountServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("account not found: {0}")]
    NotFound(AccountId),
    #[error("an account with cpf {0} already exists")]
    CpfTaken(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("commit failed: {0}")]
    Commit(#[from] OutboxStoreError),
}

type Records = Vec<EventRecord<AccountEvent>>;
type Factory = AccountEventFactory<Arc<dyn Clock>, Arc<dyn IdGenerator>>;

pub struct AccountService {
    accounts: Arc<InMemoryAccountStore>,
    outbox: Arc<InMemoryOutboxStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Factory,
    dispatcher: EventDispatcher<JsonEventSerializer, Arc<dyn Clock>>,
}

impl AccountService {
    pub fn new(
        accounts: Arc<InMemoryAccountStore>,
        outbox: Arc<InMemoryOutboxStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            accounts,
            outbox,
            events: AccountEventFactory::new(clock.clone(), ids.clone()),
            dispatcher: EventDispatcher::new(JsonEventSerializer, clock.clone()),
            clock,
            ids,
        }
    }

    pub fn get(&self, id: AccountId) -> Result<Option<Account>, AccountServiceError> {
        Ok(self.accounts.get(id)?)
    }

    /// Emits `created`.
    pub fn create(
        &self,
        name: &str,
        cpf: &str,
        correlation_id: Option<&str>,
    ) -> Result<Account, AccountServiceError> {
        let name = AccountName::new(name)?;
        let cpf = Cpf::new(cpf)?;
        self.ensure_cpf_free(&cpf, None)?;

        let account = Account::create(
            AccountId::from_uuid(self.ids.next_id()),
            name,
            cpf,
            self.clock.now(),
        );

        let mut uow = self.begin();
        let records = vec![self.events.created(&account)];
        self.dispatcher.enqueue(&mut uow, &records, correlation_id)?;
        uow.save_account(account.clone());
        uow.commit()?;

        info!(account_id = %account.id_typed(), event_count = records.len(), "account created");
        Ok(account)
    }

    /// Emits `name_changed` then `updated`.
    pub fn change_name(
        &self,
        id: AccountId,
        name: &str,
        correlation_id: Option<&str>,
    ) -> Result<Account, AccountServiceError> {
        let name = AccountName::new(name)?;
        self.apply(id, correlation_id, "account renamed", |account, events, now| {
            let old = account.name().clone();
            account.change_name(name, now)?;
            Ok(vec![events.name_changed(account, &old), events.updated(account)?])
        })
    }

    /// Emits `cpf_changed` then `updated`.
    pub fn change_cpf(
        &self,
        id: AccountId,
        cpf: &str,
        correlation_id: Option<&str>,
    ) -> Result<Account, AccountServiceError> {
        let cpf = Cpf::new(cpf)?;
        self.ensure_cpf_free(&cpf, Some(id))?;
        self.apply(id, correlation_id, "account cpf changed", |account, events, now| {
            let old = account.cpf().clone();
            account.change_cpf(cpf, now)?;
            Ok(vec![events.cpf_changed(account, &old), events.updated(account)?])
        })
    }

    /// Emits `activated`, or nothing if the account was already active.
    pub fn activate(
        &self,
        id: AccountId,
        correlation_id: Option<&str>,
    ) -> Result<Account, AccountServiceError> {
        self.apply(id, correlation_id, "account activated", |account, events, now| {
            if account.activate(now)? {
                Ok(vec![events.activated(account)])
            } else {
                Ok(Vec::new())
            }
        })
    }

    pub fn deactivate(
        &self,
        id: AccountId,
        correlation_id: Option<&str>,
    ) -> Result<Account, AccountServiceError> {
        self.apply(id, correlation_id, "account deactivated", |account, events, now| {
            account.deactivate(now)?;
            Ok(vec![events.deactivated(account)])
        })
    }

    /// Soft delete.
    pub fn delete(
        &self,
        id: AccountId,
        correlation_id: Option<&str>,
    ) -> Result<Account, AccountServiceError> {
        self.apply(id, correlation_id, "account deleted", |account, events, now| {
            account.mark_as_deleted(now)?;
            Ok(vec![events.deleted(account)])
        })
    }

    pub fn restore(
        &self,
        id: AccountId,
        correlation_id: Option<&str>,
    ) -> Result<Account, AccountServiceError> {
        self.apply(id, correlation_id, "account restored", |account, events, now| {
            account.restore(now)?;
            Ok(vec![events.restored(account)])
        })
    }

    fn begin(&self) -> InMemoryUnitOfWork {
        InMemoryUnitOfWork::begin(self.accounts.clone(), self.outbox.clone())
    }

    fn ensure_cpf_free(&self, cpf: &Cpf, owner: Option<AccountId>) -> Result<(), AccountServiceError> {
        match self.accounts.find_by_cpf(cpf)? {
            Some(existing) if Some(existing.id_typed()) != owner => {
                Err(AccountServiceError::CpfTaken(cpf.as_str().to_string()))
            }
            _ => Ok(()),
        }
    }

    fn apply<F>(
        &self,
        id: AccountId,
        correlation_id: Option<&str>,
        action: &'static str,
        change: F,
    ) -> Result<Account, AccountServiceError>
    where
        F: FnOnce(&mut Account, &Factory, DateTime<Utc>) -> Result<Records, AccountServiceError>,
    {
        let mut uow = self.begin();
        let mut account = uow
            .load_account(id)?
            .ok_or(AccountServiceError::NotFound(id))?;

        let records = change(&mut account, &self.events, self.clock.now())?;
        self.dispatcher.enqueue(&mut uow, &records, correlation_id)?;
        uow.save_account(account.clone());
        uow.commit()?;

        info!(account_id = %id, event_count = records.len(), "{action}");
        Ok(account)
    }
}
