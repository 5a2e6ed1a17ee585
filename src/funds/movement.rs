//! The funds-movement protocol: acquire, validate, apply in one scope, release, publish.
use std::{sync::Arc, time::Duration};

use parking_lot::RwLock;

use crate::{
    bank::{AccountType, Bank, BankError, DeviceId, Money},
    config::CoreConfig,
    coordinator::{RequestorId, TransactionCoordinator, TransactionHandle, TransactionKind},
    events::{EventBus, LedgerEvent},
    funds::{
        AUDIT_MENU, DeclineReason, FundsError, FundsFeature, MovementKind, ProtocolAssignment,
        ProtocolId, TransferRequest, Validation, ValidatorRegistry, standard_meters,
    },
    history::{
        Amounts, HistoryError, KeyOffType, RecordDetail, TransactionHistory, TransactionRecord,
    },
    meters::{MeterManager, names},
    storage::BlockStore,
};

/// The result of a movement that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovementOutcome {
    Completed(TransactionRecord),
    Declined(DeclineReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Credit,
    Debit,
    /// Recorded and metered only; the credit meter is not touched.
    None,
}

/// Everything a single movement will apply.
struct Movement {
    kind: MovementKind,
    device_id: DeviceId,
    amounts: Amounts,
    direction: Direction,
    detail: RecordDetail,
    meters: Vec<(&'static str, MeterAmount)>,
    /// Take every credit on the meter instead of `amounts`.
    sweep: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MeterAmount {
    /// The total moved across every account.
    Total,
    Once,
}

impl Movement {
    fn reference(&self) -> Option<String> {
        match &self.detail {
            RecordDetail::VoucherIn { barcode } | RecordDetail::VoucherOut { barcode, .. } => {
                Some(barcode.clone()).filter(|barcode| !barcode.is_empty())
            }
            RecordDetail::WatOn { reference } | RecordDetail::WatOff { reference } => {
                Some(reference.clone()).filter(|reference| !reference.is_empty())
            }
            _ => None,
        }
    }

    fn set_reference(&mut self, value: String) {
        match &mut self.detail {
            RecordDetail::VoucherIn { barcode } | RecordDetail::VoucherOut { barcode, .. } => {
                *barcode = value
            }
            RecordDetail::WatOn { reference } | RecordDetail::WatOff { reference } => {
                *reference = value
            }
            _ => {}
        }
    }
}

/// Runs every money movement of the machine against one coordinator, bank, meter set and
/// history.
pub struct FundsMovement {
    coordinator: Arc<TransactionCoordinator>,
    bank: Arc<Bank>,
    meters: Arc<MeterManager>,
    history: Arc<TransactionHistory>,
    store: BlockStore,
    bus: Arc<EventBus>,
    validators: ValidatorRegistry,
    protocols: RwLock<ProtocolAssignment>,
    timeout: Duration,
}

impl FundsMovement {
    /// Assembles the protocol from already built parts. No validator is registered yet.
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        bank: Arc<Bank>,
        meters: Arc<MeterManager>,
        history: Arc<TransactionHistory>,
        store: BlockStore,
        bus: Arc<EventBus>,
        config: &CoreConfig,
    ) -> Self {
        FundsMovement {
            coordinator,
            bank,
            meters,
            history,
            store,
            bus,
            validators: ValidatorRegistry::new(),
            protocols: RwLock::new(config.protocols),
            timeout: config.request_timeout,
        }
    }

    /// Builds the whole ledger core on `store` and spawns the coordinator's dispatch worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        store: &BlockStore,
        config: &CoreConfig,
        bus: Arc<EventBus>,
    ) -> Result<Self, FundsError> {
        let coordinator = TransactionCoordinator::start(store, Arc::clone(&bus))?;
        let bank = Arc::new(Bank::new(
            store,
            coordinator.clone(),
            Arc::clone(&bus),
            config.bank_limit,
        )?);
        let meters = Arc::new(standard_meters(
            store,
            coordinator.clone(),
            Arc::clone(&bus),
            Arc::clone(&bank),
            config,
        )?);
        let history = Arc::new(TransactionHistory::new(
            store,
            Arc::clone(&bus),
            &config.history,
        )?);
        Ok(Self::new(
            coordinator,
            bank,
            meters,
            history,
            store.clone(),
            bus,
            config,
        ))
    }

    /// The coordinator every movement takes its handle from.
    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// The ledger the movements credit and debit.
    pub fn bank(&self) -> &Arc<Bank> {
        &self.bank
    }

    pub fn meters(&self) -> &Arc<MeterManager> {
        &self.meters
    }

    pub fn history(&self) -> &Arc<TransactionHistory> {
        &self.history
    }

    pub fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }

    /// Selects the protocol that validates `feature`, or disables it with `None`.
    pub fn assign_protocol(&self, feature: FundsFeature, protocol: Option<ProtocolId>) {
        tracing::info!(?feature, ?protocol, "protocol assignment changed");
        self.protocols.write().assign(feature, protocol);
    }

    pub fn protocol_for(&self, feature: FundsFeature) -> Option<ProtocolId> {
        self.protocols.read().protocol_for(feature)
    }

    /// A coin of `denomination` was accepted.
    pub async fn coin_in(
        &self,
        device_id: DeviceId,
        denomination: Money,
    ) -> Result<MovementOutcome, FundsError> {
        self.execute(Movement {
            kind: MovementKind::CoinIn,
            device_id,
            amounts: Amounts::cashable(denomination),
            direction: Direction::Credit,
            detail: RecordDetail::CoinIn { denomination },
            meters: vec![
                (names::COIN_IN_AMOUNT, MeterAmount::Total),
                (names::COIN_IN_COUNT, MeterAmount::Once),
            ],
            sweep: false,
        })
        .await
    }

    /// A bill of `denomination` was stacked.
    pub async fn currency_in(
        &self,
        device_id: DeviceId,
        denomination: Money,
    ) -> Result<MovementOutcome, FundsError> {
        self.execute(Movement {
            kind: MovementKind::CurrencyIn,
            device_id,
            amounts: Amounts::cashable(denomination),
            direction: Direction::Credit,
            detail: RecordDetail::BillIn { denomination },
            meters: vec![
                (names::CURRENCY_IN_AMOUNT, MeterAmount::Total),
                (names::CURRENCY_IN_COUNT, MeterAmount::Once),
            ],
            sweep: false,
        })
        .await
    }

    /// A voucher was inserted and is redeemed for `amounts` once the voucher host approves it.
    pub async fn voucher_in(
        &self,
        device_id: DeviceId,
        barcode: &str,
        amounts: Amounts,
    ) -> Result<MovementOutcome, FundsError> {
        self.execute(Movement {
            kind: MovementKind::VoucherIn,
            device_id,
            amounts,
            direction: Direction::Credit,
            detail: RecordDetail::VoucherIn {
                barcode: barcode.to_string(),
            },
            meters: vec![
                (names::VOUCHER_IN_AMOUNT, MeterAmount::Total),
                (names::VOUCHER_IN_COUNT, MeterAmount::Once),
            ],
            sweep: false,
        })
        .await
    }

    /// Cashes every credit out to a voucher. The voucher host may assign the barcode.
    ///
    /// The record is saved unprinted; see [`FundsMovement::confirm_voucher_printed`].
    pub async fn voucher_out(
        &self,
        device_id: DeviceId,
        barcode: Option<&str>,
    ) -> Result<MovementOutcome, FundsError> {
        self.execute(Movement {
            kind: MovementKind::VoucherOut,
            device_id,
            amounts: Amounts::default(),
            direction: Direction::Debit,
            detail: RecordDetail::VoucherOut {
                barcode: barcode.unwrap_or_default().to_string(),
                printed: false,
            },
            meters: vec![
                (names::VOUCHER_OUT_AMOUNT, MeterAmount::Total),
                (names::VOUCHER_OUT_COUNT, MeterAmount::Once),
                (names::TOTAL_CASH_OUT_AMOUNT, MeterAmount::Total),
            ],
            sweep: true,
        })
        .await
    }

    /// Marks the voucher-out record `transaction_id` as printed.
    pub async fn confirm_voucher_printed(&self, transaction_id: u64) -> Result<bool, FundsError> {
        let Some(handle) = self.acquire(MovementKind::VoucherOut.requestor()).await? else {
            return Ok(false);
        };
        let result = self.history_update(transaction_id);
        self.coordinator.release_transaction(handle)?;
        tracing::debug!(transaction_id, "voucher print confirmed");
        result.map(|()| true)
    }

    fn history_update(&self, transaction_id: u64) -> Result<(), FundsError> {
        let mut record = self
            .history
            .find(transaction_id)
            .ok_or(HistoryError::NotFound(transaction_id))?;
        let RecordDetail::VoucherOut { printed, .. } = &mut record.detail else {
            return Err(HistoryError::NotFound(transaction_id).into());
        };
        *printed = true;
        self.history.update_transaction(&record)?;
        Ok(())
    }

    /// Moves `amounts` from the host onto the credit meter.
    pub async fn wat_on(
        &self,
        device_id: DeviceId,
        reference: &str,
        amounts: Amounts,
    ) -> Result<MovementOutcome, FundsError> {
        self.execute(Movement {
            kind: MovementKind::WatOn,
            device_id,
            amounts,
            direction: Direction::Credit,
            detail: RecordDetail::WatOn {
                reference: reference.to_string(),
            },
            meters: vec![
                (names::WAT_ON_AMOUNT, MeterAmount::Total),
                (names::WAT_ON_COUNT, MeterAmount::Once),
            ],
            sweep: false,
        })
        .await
    }

    /// Moves `amounts` off the credit meter to the host.
    pub async fn wat_off(
        &self,
        device_id: DeviceId,
        reference: &str,
        amounts: Amounts,
    ) -> Result<MovementOutcome, FundsError> {
        self.execute(Movement {
            kind: MovementKind::WatOff,
            device_id,
            amounts,
            direction: Direction::Debit,
            detail: RecordDetail::WatOff {
                reference: reference.to_string(),
            },
            meters: vec![
                (names::WAT_OFF_AMOUNT, MeterAmount::Total),
                (names::WAT_OFF_COUNT, MeterAmount::Once),
                (names::TOTAL_CASH_OUT_AMOUNT, MeterAmount::Total),
            ],
            sweep: false,
        })
        .await
    }

    /// Keys off a hand pay of `amounts`.
    ///
    /// Keyed off to cash, an attendant pays the amount and the credit meter is untouched.
    /// Keyed off to credits, the amount is deposited.
    pub async fn hand_pay_key_off(
        &self,
        device_id: DeviceId,
        amounts: Amounts,
        key_off: KeyOffType,
    ) -> Result<MovementOutcome, FundsError> {
        let mut meters = vec![
            (names::HAND_PAID_AMOUNT, MeterAmount::Total),
            (names::HAND_PAID_COUNT, MeterAmount::Once),
        ];
        let direction = match key_off {
            KeyOffType::Cash => {
                meters.push((names::TOTAL_CASH_OUT_AMOUNT, MeterAmount::Total));
                Direction::None
            }
            KeyOffType::Credits => Direction::Credit,
        };
        self.execute(Movement {
            kind: MovementKind::HandPay,
            device_id,
            amounts,
            direction,
            detail: RecordDetail::HandPay { key_off },
            meters,
            sweep: false,
        })
        .await
    }

    /// Clears every non-exempt period meter under a transaction handle, so the clear is
    /// ordered with the movements. Returns false if no handle was granted in time.
    pub async fn clear_period_meters(&self) -> Result<bool, FundsError> {
        let Some(handle) = self.acquire(AUDIT_MENU).await? else {
            tracing::warn!("period meter clear declined, ledger busy");
            return Ok(false);
        };
        let cleared = self.meters.clear_all_period_meters(handle);
        self.coordinator.release_transaction(handle)?;
        cleared?;
        Ok(true)
    }

    /// Asks for a write transaction, abandoning the request if it is not granted in time.
    async fn acquire(
        &self,
        requestor: RequestorId,
    ) -> Result<Option<TransactionHandle>, FundsError> {
        let handle = self
            .coordinator
            .request_transaction(requestor, self.timeout, TransactionKind::Write)
            .await?;
        if handle.is_none() {
            self.coordinator.abandon_transactions(requestor)?;
        }
        Ok(handle)
    }

    async fn execute(&self, mut movement: Movement) -> Result<MovementOutcome, FundsError> {
        let kind = movement.kind;
        let Some(handle) = self.acquire(kind.requestor()).await? else {
            tracing::warn!(movement = %kind, "movement declined, ledger busy");
            return Ok(MovementOutcome::Declined(DeclineReason::Busy));
        };

        let outcome = self.apply(handle, &mut movement);
        let released = self.coordinator.release_transaction(handle);

        match outcome {
            Ok(MovementOutcome::Completed(record)) => {
                released?;
                let transaction_id = record.transaction_id.unwrap_or_default();
                let amount = record.amounts.total().unwrap_or_default();
                tracing::info!(movement = %kind, transaction_id, amount, "movement completed");
                self.bus.publish(LedgerEvent::MovementCompleted {
                    movement: kind,
                    transaction_id,
                    amount,
                });
                Ok(MovementOutcome::Completed(record))
            }
            Ok(declined) => {
                released?;
                Ok(declined)
            }
            Err(err) => {
                if let Err(release_err) = released {
                    tracing::error!(error = %release_err, "handle release failed after abort");
                }
                Err(err)
            }
        }
    }

    fn apply(
        &self,
        handle: TransactionHandle,
        movement: &mut Movement,
    ) -> Result<MovementOutcome, FundsError> {
        if let Some(reason) = self.validate(handle, movement)? {
            tracing::info!(movement = %movement.kind, %reason, "movement declined");
            return Ok(MovementOutcome::Declined(reason));
        }
        match self.commit(handle, movement) {
            Ok(record) => Ok(MovementOutcome::Completed(record)),
            Err(err) => {
                tracing::error!(movement = %movement.kind, error = %err, "movement aborted");
                self.restore();
                Err(err)
            }
        }
    }

    /// Domain checks made under the handle before anything is written.
    fn validate(
        &self,
        handle: TransactionHandle,
        movement: &mut Movement,
    ) -> Result<Option<DeclineReason>, FundsError> {
        if movement.sweep {
            movement.amounts = Amounts {
                cashable: self.bank.query_balance_of(AccountType::Cashable),
                promotional: self.bank.query_balance_of(AccountType::Promotional),
                non_cashable: self.bank.query_balance_of(AccountType::NonCashable),
            };
            if movement.amounts.total() == Some(0) {
                return Ok(Some(DeclineReason::InsufficientFunds));
            }
        }
        let amounts = movement.amounts;
        for amount in [amounts.cashable, amounts.promotional, amounts.non_cashable] {
            if amount < 0 {
                return Err(BankError::InvalidAmount(amount).into());
            }
        }
        let total = amounts.total().ok_or(BankError::TotalOverflow)?;
        if total <= 0 {
            return Err(BankError::InvalidAmount(total).into());
        }

        match movement.direction {
            Direction::Credit => {
                if self.bank.query_balance().saturating_add(total) > self.bank.limit() {
                    return Ok(Some(DeclineReason::CreditLimit));
                }
                for (account, amount) in amounts.iter() {
                    if !self.bank.check_deposit(account, amount, handle)? {
                        return Ok(Some(DeclineReason::CreditLimit));
                    }
                }
            }
            Direction::Debit => {
                for (account, amount) in amounts.iter() {
                    if !self.bank.check_withdraw(account, amount, handle)? {
                        return Ok(Some(DeclineReason::InsufficientFunds));
                    }
                }
            }
            Direction::None => {}
        }

        if let Some(feature) = movement.kind.feature() {
            let Some(protocol) = self.protocols.read().protocol_for(feature) else {
                return Ok(Some(DeclineReason::NoValidator));
            };
            let Some(validator) = self.validators.get(protocol) else {
                return Ok(Some(DeclineReason::NoValidator));
            };
            let request = TransferRequest {
                movement: movement.kind,
                device_id: movement.device_id,
                amounts,
                reference: movement.reference(),
            };
            match validator.validate(&request) {
                Validation::Approved { reference } => {
                    if let Some(reference) = reference {
                        movement.set_reference(reference);
                    }
                }
                Validation::Rejected { reason } => {
                    return Ok(Some(DeclineReason::ValidatorRejected(reason)));
                }
            }
        }
        Ok(None)
    }

    /// Bank, meters and history inside one storage scope.
    fn commit(
        &self,
        handle: TransactionHandle,
        movement: &Movement,
    ) -> Result<TransactionRecord, FundsError> {
        let scope = self.store.scoped_transaction();
        for (account, amount) in movement.amounts.iter() {
            match movement.direction {
                Direction::Credit => self.bank.deposit(account, amount, handle)?,
                Direction::Debit => self.bank.withdraw(account, amount, handle)?,
                Direction::None => {}
            }
        }
        let total = movement.amounts.total().ok_or(BankError::TotalOverflow)?;
        for (meter, amount) in &movement.meters {
            let value = match amount {
                MeterAmount::Total => total,
                MeterAmount::Once => 1,
            };
            self.meters.increment(meter, value)?;
        }
        let record = self.history.save_transaction(TransactionRecord::new(
            movement.device_id,
            movement.amounts,
            movement.detail.clone(),
        ))?;
        scope.complete()?;
        Ok(record)
    }

    /// Brings in-memory state back in line with the store after an aborted scope.
    fn restore(&self) {
        if let Err(err) = self.bank.reload() {
            tracing::error!(error = %err, "bank reload failed");
        }
        if let Err(err) = self.meters.reload() {
            tracing::error!(error = %err, "meter reload failed");
        }
        if let Err(err) = self.history.reload() {
            tracing::error!(error = %err, "history reload failed");
        }
    }
}
