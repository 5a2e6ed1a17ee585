//! The standard meter layout used by the funds movements.
use std::sync::Arc;

use crate::{
    bank::Bank,
    config::CoreConfig,
    coordinator::TransactionVerifier,
    events::EventBus,
    meters::{
        DerivedMeter, MeterClassification, MeterError, MeterManager, MeterProvider, names,
    },
    storage::BlockStore,
};

/// Builds the meters every funds movement increments, plus current credits mirrored from
/// `bank`. Period clears are checked against `verifier`.
pub fn standard_meters(
    store: &BlockStore,
    verifier: Arc<dyn TransactionVerifier>,
    bus: Arc<EventBus>,
    bank: Arc<Bank>,
    config: &CoreConfig,
) -> Result<MeterManager, MeterError> {
    let currency = MeterClassification::currency(config.currency_upper_bounds);
    let occurrence = MeterClassification::occurrence(config.occurrence_upper_bounds);

    let mut manager = MeterManager::new(store, verifier, bus)?;
    manager.add_provider(
        MeterProvider::builder("Currency")
            .atomic(names::COIN_IN_AMOUNT, currency.clone())
            .atomic(names::COIN_IN_COUNT, occurrence.clone())
            .atomic(names::CURRENCY_IN_AMOUNT, currency.clone())
            .atomic(names::CURRENCY_IN_COUNT, occurrence.clone())
            .build(store)?,
    )?;
    manager.add_provider(
        MeterProvider::builder("Vouchers")
            .atomic(names::VOUCHER_IN_AMOUNT, currency.clone())
            .atomic(names::VOUCHER_IN_COUNT, occurrence.clone())
            .atomic(names::VOUCHER_OUT_AMOUNT, currency.clone())
            .atomic(names::VOUCHER_OUT_COUNT, occurrence.clone())
            .build(store)?,
    )?;
    manager.add_provider(
        MeterProvider::builder("Wat")
            .atomic(names::WAT_ON_AMOUNT, currency.clone())
            .atomic(names::WAT_ON_COUNT, occurrence.clone())
            .atomic(names::WAT_OFF_AMOUNT, currency.clone())
            .atomic(names::WAT_OFF_COUNT, occurrence.clone())
            .build(store)?,
    )?;
    manager.add_provider(
        MeterProvider::builder("HandPay")
            .atomic(names::HAND_PAID_AMOUNT, currency.clone())
            .atomic(names::HAND_PAID_COUNT, occurrence)
            .build(store)?,
    )?;
    manager.add_provider(
        MeterProvider::builder("Credits")
            .atomic(names::TOTAL_CASH_OUT_AMOUNT, currency.clone())
            .derived(DerivedMeter::new(names::CURRENT_CREDITS, currency, move || {
                bank.query_balance()
            }))
            .build(store)?,
    )?;
    Ok(manager)
}
