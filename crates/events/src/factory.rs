//! Account event construction.
//!
//! Pure apart from the injected clock and id generator: no I/O, and the same
//! account state always yields the same body.

use bankrelay_accounts::{Account, AccountName, Cpf};
use bankrelay_core::{Clock, DomainError, DomainResult, EventId, IdGenerator};

use crate::account::AccountEvent;
use crate::record::{AggregateKey, EventRecord};

pub struct AccountEventFactory<C, G> {
    clock: C,
    ids: G,
}

impl<C, G> AccountEventFactory<C, G>
where
    C: Clock,
    G: IdGenerator,
{
    pub fn new(clock: C, ids: G) -> Self {
        Self { clock, ids }
    }

    pub fn created(&self, account: &Account) -> EventRecord<AccountEvent> {
        self.record(
            account,
            AccountEvent::Created {
                account_id: account.id_typed(),
                name: account.name().as_str().to_string(),
                cpf: account.cpf().as_str().to_string(),
                is_active: account.is_active(),
                is_deleted: account.is_deleted(),
                created_at: account.created_at(),
            },
        )
    }

    pub fn activated(&self, account: &Account) -> EventRecord<AccountEvent> {
        self.record(
            account,
            AccountEvent::Activated {
                account_id: account.id_typed(),
            },
        )
    }

    pub fn deactivated(&self, account: &Account) -> EventRecord<AccountEvent> {
        self.record(
            account,
            AccountEvent::Deactivated {
                account_id: account.id_typed(),
            },
        )
    }

    pub fn deleted(&self, account: &Account) -> EventRecord<AccountEvent> {
        self.record(
            account,
            AccountEvent::Deleted {
                account_id: account.id_typed(),
            },
        )
    }

    pub fn restored(&self, account: &Account) -> EventRecord<AccountEvent> {
        self.record(
            account,
            AccountEvent::Restored {
                account_id: account.id_typed(),
            },
        )
    }

    /// `account` already carries the new value.
    pub fn cpf_changed(&self, account: &Account, old_cpf: &Cpf) -> EventRecord<AccountEvent> {
        self.record(
            account,
            AccountEvent::CpfChanged {
                account_id: account.id_typed(),
                old_cpf: old_cpf.as_str().to_string(),
                new_cpf: account.cpf().as_str().to_string(),
            },
        )
    }

    /// `account` already carries the new value.
    pub fn name_changed(
        &self,
        account: &Account,
        old_name: &AccountName,
    ) -> EventRecord<AccountEvent> {
        self.record(
            account,
            AccountEvent::NameChanged {
                account_id: account.id_typed(),
                old_name: old_name.as_str().to_string(),
                new_name: account.name().as_str().to_string(),
            },
        )
    }

    /// Snapshot of an account that has been modified at least once.
    pub fn updated(&self, account: &Account) -> DomainResult<EventRecord<AccountEvent>> {
        let updated_at = account.updated_at().ok_or_else(|| {
            DomainError::invariant("cannot build an updated event for a never-modified account")
        })?;

        Ok(self.record(
            account,
            AccountEvent::Updated {
                account_id: account.id_typed(),
                name: account.name().as_str().to_string(),
                cpf: account.cpf().as_str().to_string(),
                is_active: account.is_active(),
                is_deleted: account.is_deleted(),
                updated_at,
            },
        ))
    }

    fn record(&self, account: &Account, body: AccountEvent) -> EventRecord<AccountEvent> {
        EventRecord::new(
            EventId::from_uuid(self.ids.next_id()),
            self.clock.now(),
            body,
            Some(AggregateKey::for_aggregate(account.id_typed().simple())),
        )
    }
}
