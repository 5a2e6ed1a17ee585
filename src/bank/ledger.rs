//! The bank: per-account balances mutated only under the current transaction handle.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    bank::{Account, AccountType, BankError, Money},
    coordinator::{TransactionHandle, TransactionVerifier},
    events::{EventBus, LedgerEvent},
    storage::{BlockAccessor, BlockStore, PersistenceLevel, StorageError},
};

const BLOCK_NAME: &str = "Bank";
const BALANCE: &str = "balance";

/// In-memory view of the persisted balances.
struct BankState {
    accounts: [Account; 3],
    disposed: bool,
}

/// Represents the credit ledger of the machine.
///
/// Every mutation must present the handle currently granted by the coordinator. The balance
/// update, its persistence and the `BalanceChanged` event happen under one lock, so readers
/// never observe a balance that has not been written.
pub struct Bank {
    state: Mutex<BankState>,
    block: BlockAccessor,
    verifier: Arc<dyn TransactionVerifier>,
    bus: Arc<EventBus>,
    limit: Money,
}

impl Bank {
    /// Loads the bank from `store`, creating a zeroed ledger on first use.
    pub fn new(
        store: &BlockStore,
        verifier: Arc<dyn TransactionVerifier>,
        bus: Arc<EventBus>,
        limit: Money,
    ) -> Result<Self, BankError> {
        let (block, created) = store.get_or_create_block(
            PersistenceLevel::Critical,
            BLOCK_NAME,
            AccountType::ALL.len(),
        )?;
        if created {
            let zero: Money = 0;
            let mut tx = block.start_transaction();
            for account in AccountType::ALL {
                tx.set(account.index(), BALANCE, &zero)?;
            }
            tx.commit_immediate()?;
            tracing::info!("bank created with zero balances");
        }
        let accounts = load_accounts(&block)?;
        tracing::info!(total = checked_total(&accounts), "bank loaded");

        Ok(Bank {
            state: Mutex::new(BankState {
                accounts,
                disposed: false,
            }),
            block,
            verifier,
            bus,
            limit,
        })
    }

    /// The configured credit ceiling. Callers enforce it; the bank does not.
    pub fn limit(&self) -> Money {
        self.limit
    }

    /// Deposits `amount` into `account` under `handle`.
    pub fn deposit(
        &self,
        account: AccountType,
        amount: Money,
        handle: TransactionHandle,
    ) -> Result<(), BankError> {
        self.apply(account, handle, |current| current.after_deposit(amount))
    }

    /// Withdraws `amount` from `account` under `handle`.
    /// Returns an error if there are insufficient funds.
    pub fn withdraw(
        &self,
        account: AccountType,
        amount: Money,
        handle: TransactionHandle,
    ) -> Result<(), BankError> {
        self.apply(account, handle, |current| current.after_withdraw(amount))
    }

    /// Whether `amount` could be deposited into `account` right now.
    pub fn check_deposit(
        &self,
        account: AccountType,
        amount: Money,
        handle: TransactionHandle,
    ) -> Result<bool, BankError> {
        self.verify(handle)?;
        let state = self.state.lock();
        Ok(state.accounts[account.index()]
            .after_deposit(amount)
            .is_ok_and(|balance| total_with(&state.accounts, account, balance).is_some()))
    }

    /// Whether `amount` could be withdrawn from `account` right now.
    /// Insufficient funds yields `Ok(false)`; an invalid handle is still an error.
    pub fn check_withdraw(
        &self,
        account: AccountType,
        amount: Money,
        handle: TransactionHandle,
    ) -> Result<bool, BankError> {
        self.verify(handle)?;
        let state = self.state.lock();
        Ok(state.accounts[account.index()].after_withdraw(amount).is_ok())
    }

    /// The sum of every account balance.
    pub fn query_balance(&self) -> Money {
        let state = self.state.lock();
        // Deposits and loading keep the total representable.
        checked_total(&state.accounts).unwrap_or(Money::MAX)
    }

    /// The balance of one account.
    pub fn query_balance_of(&self, account: AccountType) -> Money {
        self.state.lock().accounts[account.index()].balance()
    }

    /// A copy of every account.
    pub fn accounts(&self) -> Vec<Account> {
        self.state.lock().accounts.to_vec()
    }

    /// Re-reads every balance from the store, discarding in-memory changes that never
    /// reached it.
    pub fn reload(&self) -> Result<(), BankError> {
        let accounts = load_accounts(&self.block)?;
        let mut state = self.state.lock();
        if state.accounts != accounts {
            tracing::warn!("bank balances restored from storage");
        }
        state.accounts = accounts;
        Ok(())
    }

    /// Stops the bank from accepting further mutations. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if !state.disposed {
            state.disposed = true;
            tracing::debug!("bank disposed");
        }
    }

    fn verify(&self, handle: TransactionHandle) -> Result<(), BankError> {
        if self.verifier.verify_current_transaction(handle) {
            Ok(())
        } else {
            Err(BankError::InvalidHandle(handle))
        }
    }

    fn apply<F>(&self, account: AccountType, handle: TransactionHandle, op: F) -> Result<(), BankError>
    where
        F: FnOnce(&Account) -> Result<Money, BankError>,
    {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(BankError::Disposed);
        }
        self.verify(handle)?;

        let index = account.index();
        let old = state.accounts[index].balance();
        let new = op(&state.accounts[index])?;
        if total_with(&state.accounts, account, new).is_none() {
            return Err(BankError::Overflow(account));
        }
        self.save(account, new)?;
        state.accounts[index].set_balance(new);
        tracing::info!(%account, old, new, %handle, "balance changed");

        let bus = Arc::clone(&self.bus);
        self.block.after_commit(move || {
            bus.publish(LedgerEvent::BalanceChanged {
                account,
                old,
                new,
                handle,
            })
        });
        Ok(())
    }

    fn save(&self, account: AccountType, balance: Money) -> Result<(), StorageError> {
        let mut tx = self.block.start_transaction();
        tx.set(account.index(), BALANCE, &balance)?;
        tx.commit()
    }
}

fn load_accounts(block: &BlockAccessor) -> Result<[Account; 3], StorageError> {
    let mut accounts = AccountType::ALL.map(|account| Account::new(account, 0));
    for account in AccountType::ALL {
        let balance = block.get::<Money>(account.index(), BALANCE)?.ok_or_else(|| {
            StorageError::Corrupted(format!("{account} balance missing from bank block"))
        })?;
        if balance < 0 {
            return Err(StorageError::Corrupted(format!(
                "{account} balance is negative ({balance})"
            )));
        }
        accounts[account.index()].set_balance(balance);
    }
    if checked_total(&accounts).is_none() {
        return Err(StorageError::Corrupted(
            "bank balances overflow their total".to_string(),
        ));
    }
    Ok(accounts)
}

fn checked_total(accounts: &[Account]) -> Option<Money> {
    accounts
        .iter()
        .try_fold(0, |total: Money, account| total.checked_add(account.balance()))
}

/// The total with `account` holding `balance`, or `None` if it overflows.
fn total_with(accounts: &[Account], account: AccountType, balance: Money) -> Option<Money> {
    accounts.iter().try_fold(0, |total: Money, current| {
        let value = if current.account_type() == account {
            balance
        } else {
            current.balance()
        };
        total.checked_add(value)
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::coordinator::{RequestorId, TransactionCoordinator, TransactionKind};

    const REQUESTOR: RequestorId = RequestorId::from_u128(0xBA4C);

    /// Verifier that accepts exactly one handle.
    struct FixedVerifier(TransactionHandle);

    impl TransactionVerifier for FixedVerifier {
        fn verify_current_transaction(&self, handle: TransactionHandle) -> bool {
            !handle.is_empty() && handle == self.0
        }
    }

    fn fixed_bank(store: &BlockStore) -> (Bank, TransactionHandle, Arc<EventBus>) {
        let handle = TransactionHandle::mint();
        let bus = Arc::new(EventBus::new());
        let bank = Bank::new(
            store,
            Arc::new(FixedVerifier(handle)),
            Arc::clone(&bus),
            1_000_000,
        )
        .unwrap();
        (bank, handle, bus)
    }

    fn balance_changes(events: &mut tokio::sync::broadcast::Receiver<LedgerEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LedgerEvent::BalanceChanged { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_deposit_then_withdraw_with_coordinator_handle() {
        let store = BlockStore::in_memory();
        let bus = Arc::new(EventBus::new());
        let coordinator = TransactionCoordinator::start(&store, Arc::clone(&bus)).unwrap();
        let bank = Bank::new(&store, coordinator.clone(), Arc::clone(&bus), 1_000_000).unwrap();
        let mut events = bus.receiver();

        let handle = coordinator
            .request_transaction(REQUESTOR, Duration::from_secs(1), TransactionKind::Write)
            .await
            .unwrap()
            .unwrap();
        bank.deposit(AccountType::Cashable, 1000, handle).unwrap();
        bank.withdraw(AccountType::Cashable, 500, handle).unwrap();

        assert_eq!(bank.query_balance(), 500);
        assert_eq!(balance_changes(&mut events), 2);
    }

    #[test]
    fn test_new_bank_is_zeroed() {
        let store = BlockStore::in_memory();
        let (bank, _, _) = fixed_bank(&store);
        assert_eq!(bank.query_balance(), 0);
        for account in AccountType::ALL {
            assert_eq!(bank.query_balance_of(account), 0);
        }
        assert_eq!(bank.limit(), 1_000_000);
    }

    #[test]
    fn test_invalid_handle_rejected() {
        let store = BlockStore::in_memory();
        let (bank, _, bus) = fixed_bank(&store);
        let mut events = bus.receiver();
        let stranger = TransactionHandle::mint();

        assert!(matches!(
            bank.deposit(AccountType::Cashable, 100, stranger),
            Err(BankError::InvalidHandle(_))
        ));
        assert!(matches!(
            bank.withdraw(AccountType::Cashable, 0, TransactionHandle::EMPTY),
            Err(BankError::InvalidHandle(_))
        ));
        assert!(matches!(
            bank.check_withdraw(AccountType::Cashable, 1, stranger),
            Err(BankError::InvalidHandle(_))
        ));
        assert!(matches!(
            bank.check_deposit(AccountType::Cashable, 1, stranger),
            Err(BankError::InvalidHandle(_))
        ));
        assert_eq!(bank.query_balance(), 0);
        assert_eq!(balance_changes(&mut events), 0);
    }

    #[test]
    fn test_withdraw_insufficient_funds() {
        let store = BlockStore::in_memory();
        let (bank, handle, bus) = fixed_bank(&store);
        bank.deposit(AccountType::Promotional, 300, handle).unwrap();
        let mut events = bus.receiver();

        assert!(!bank.check_withdraw(AccountType::Promotional, 301, handle).unwrap());
        assert!(bank.check_withdraw(AccountType::Promotional, 300, handle).unwrap());
        assert!(matches!(
            bank.withdraw(AccountType::Promotional, 301, handle),
            Err(BankError::InsufficientFunds { .. })
        ));
        assert_eq!(bank.query_balance_of(AccountType::Promotional), 300);
        assert_eq!(balance_changes(&mut events), 0);
    }

    #[test]
    fn test_deposit_that_overflows_total_is_rejected() {
        let store = BlockStore::in_memory();
        let (bank, handle, bus) = fixed_bank(&store);
        bank.deposit(AccountType::Cashable, Money::MAX, handle).unwrap();
        let mut events = bus.receiver();

        assert!(!bank.check_deposit(AccountType::Promotional, 1, handle).unwrap());
        assert!(matches!(
            bank.deposit(AccountType::Promotional, 1, handle),
            Err(BankError::Overflow(AccountType::Promotional))
        ));
        assert_eq!(bank.query_balance_of(AccountType::Promotional), 0);
        assert_eq!(bank.query_balance(), Money::MAX);
        assert_eq!(balance_changes(&mut events), 0);
    }

    #[test]
    fn test_total_is_sum_of_accounts() {
        let store = BlockStore::in_memory();
        let (bank, handle, _) = fixed_bank(&store);
        bank.deposit(AccountType::Cashable, 700, handle).unwrap();
        bank.deposit(AccountType::Promotional, 200, handle).unwrap();
        bank.deposit(AccountType::NonCashable, 100, handle).unwrap();
        bank.withdraw(AccountType::Promotional, 150, handle).unwrap();

        let sum: Money = AccountType::ALL
            .iter()
            .map(|account| bank.query_balance_of(*account))
            .sum();
        assert_eq!(bank.query_balance(), sum);
        assert_eq!(sum, 850);
    }

    #[test]
    fn test_limit_is_not_enforced_by_bank() {
        let store = BlockStore::in_memory();
        let (bank, handle, _) = fixed_bank(&store);
        bank.deposit(AccountType::Cashable, bank.limit() + 1, handle)
            .unwrap();
        assert_eq!(bank.query_balance(), bank.limit() + 1);
    }

    #[test]
    fn test_balances_survive_reload() {
        let store = BlockStore::in_memory();
        let (bank, handle, _) = fixed_bank(&store);
        bank.deposit(AccountType::Cashable, 1234, handle).unwrap();
        drop(bank);

        let (reloaded, _, _) = fixed_bank(&store);
        assert_eq!(reloaded.query_balance_of(AccountType::Cashable), 1234);
    }

    #[test]
    fn test_balance_changed_waits_for_scope() {
        let store = BlockStore::in_memory();
        let (bank, handle, bus) = fixed_bank(&store);
        let mut events = bus.receiver();

        let scope = store.scoped_transaction();
        bank.deposit(AccountType::Cashable, 250, handle).unwrap();
        assert_eq!(balance_changes(&mut events), 0);
        scope.complete().unwrap();
        assert_eq!(balance_changes(&mut events), 1);
    }

    #[test]
    fn test_aborted_scope_rolls_back_on_reload() {
        let store = BlockStore::in_memory();
        let (bank, handle, bus) = fixed_bank(&store);
        bank.deposit(AccountType::Cashable, 1000, handle).unwrap();
        let mut events = bus.receiver();

        {
            let _scope = store.scoped_transaction();
            bank.deposit(AccountType::Cashable, 500, handle).unwrap();
            assert_eq!(bank.query_balance(), 1500);
            // Power lost before the scope completes.
        }

        assert_eq!(balance_changes(&mut events), 0);
        let (reloaded, _, _) = fixed_bank(&store);
        assert_eq!(reloaded.query_balance(), 1000);
        bank.reload().unwrap();
        assert_eq!(bank.query_balance(), 1000);
    }

    #[test]
    fn test_failed_commit_leaves_balance_and_emits_nothing() {
        let store = BlockStore::in_memory();
        let (bank, handle, bus) = fixed_bank(&store);
        let mut events = bus.receiver();
        store.fail_next_commit();

        assert!(matches!(
            bank.deposit(AccountType::Cashable, 1000, handle),
            Err(BankError::Storage(_))
        ));
        assert_eq!(bank.query_balance(), 0);
        assert_eq!(balance_changes(&mut events), 0);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let store = BlockStore::in_memory();
        let (bank, handle, _) = fixed_bank(&store);
        bank.dispose();
        bank.dispose();
        assert!(matches!(
            bank.deposit(AccountType::Cashable, 1, handle),
            Err(BankError::Disposed)
        ));
        assert_eq!(bank.query_balance(), 0);
    }

    #[test]
    fn test_corrupted_block_is_rejected() {
        let store = BlockStore::in_memory();
        let block = store
            .create_block(PersistenceLevel::Critical, BLOCK_NAME, AccountType::ALL.len())
            .unwrap();
        let mut tx = block.start_transaction();
        tx.set(0, BALANCE, &-5i64).unwrap();
        tx.commit().unwrap();

        let result = Bank::new(
            &store,
            Arc::new(FixedVerifier(TransactionHandle::mint())),
            Arc::new(EventBus::new()),
            0,
        );
        assert!(matches!(
            result,
            Err(BankError::Storage(StorageError::Corrupted(_)))
        ));
    }
}
