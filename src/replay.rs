//! Replays a CSV file of device events through the funds-movement protocol.
use serde::{Deserialize, Serialize, de};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    bank::{AccountType, DECIMAL_PRECISION, DeviceId, Money},
    funds::{
        DeclineReason, FundsError, FundsFeature, FundsMovement, MovementOutcome, ProtocolId,
        TransferRequest, Validation,
    },
    history::{Amounts, KeyOffType},
};

/// The kind of event on one input row.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    CoinIn,
    CurrencyIn,
    VoucherIn,
    VoucherOut,
    WatOn,
    WatOff,
    HandPayCash,
    HandPayCredits,
    ClearPeriod,
}

/// Custom deserializer for monetary values to handle fixed-point representation.
fn deserialize_money<'de, D>(deserializer: D) -> Result<Option<Money>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    Ok(value.map(|v| (v * DECIMAL_PRECISION).round() as Money))
}

fn serialize_money<S>(money: &Money, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    (*money as f64 / DECIMAL_PRECISION).serialize(serializer)
}

/// One input row: `kind,device,amount,reference`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MovementRow {
    kind: RowKind,

    #[serde(rename = "device")]
    device_id: DeviceId,

    /// Cashable amount in major units; ignored by voucher-out and period clears.
    #[serde(deserialize_with = "deserialize_money", default)]
    amount: Option<Money>,

    /// Voucher barcode or WAT transfer id.
    #[serde(default)]
    reference: Option<String>,
}

impl MovementRow {
    pub fn new(
        kind: RowKind,
        device_id: DeviceId,
        amount: Option<Money>,
        reference: Option<&str>,
    ) -> Self {
        MovementRow {
            kind,
            device_id,
            amount,
            reference: reference.map(str::to_string),
        }
    }

    fn amount(&self) -> Result<Money, ReplayError> {
        self.amount.ok_or(ReplayError::MissingAmount(self.kind))
    }

    fn reference(&self) -> &str {
        self.reference.as_deref().unwrap_or_default()
    }
}

/// Balance of one account, as written to the output.
#[derive(Serialize, Debug)]
pub struct BalanceRow {
    pub account: AccountType,
    #[serde(serialize_with = "serialize_money")]
    pub balance: Money,
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("{0:?} row has no amount")]
    MissingAmount(RowKind),
    #[error(transparent)]
    Funds(#[from] FundsError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Replay task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What happened to the replayed rows.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub completed: usize,
    pub declined: usize,
    pub failed: usize,
}

/// Stands in for every host: approves each transfer and keeps the device reference.
pub fn approve_all(_: &TransferRequest) -> Validation {
    Validation::Approved { reference: None }
}

/// Consumes rows from a channel and runs each through the funds-movement protocol.
pub struct Replayer {
    funds: FundsMovement,
    receiver: mpsc::Receiver<MovementRow>,
    summary: ReplaySummary,
}

impl Replayer {
    /// Creates a replayer. Protocols without a validator get an approve-all one, and
    /// unassigned features are validated over SAS.
    pub fn new(funds: FundsMovement, receiver: mpsc::Receiver<MovementRow>) -> Self {
        for protocol in [ProtocolId::Sas, ProtocolId::G2s, ProtocolId::Mgam] {
            if funds.validators().get(protocol).is_none() {
                funds.validators().register(protocol, Box::new(approve_all));
            }
        }
        for feature in [FundsFeature::Wat, FundsFeature::Vouchers] {
            if funds.protocol_for(feature).is_none() {
                funds.assign_protocol(feature, Some(ProtocolId::Sas));
            }
        }
        Replayer {
            funds,
            receiver,
            summary: ReplaySummary::default(),
        }
    }

    pub fn funds(&self) -> &FundsMovement {
        &self.funds
    }

    pub fn summary(&self) -> &ReplaySummary {
        &self.summary
    }

    /// Runs until the sending side of the channel is closed.
    pub async fn run(&mut self) {
        while let Some(row) = self.receiver.recv().await {
            match self.apply(&row).await {
                Ok(Some(MovementOutcome::Declined(reason))) => {
                    tracing::info!(kind = ?row.kind, %reason, "row declined");
                    self.summary.declined += 1;
                }
                Ok(_) => self.summary.completed += 1,
                Err(err) => {
                    tracing::error!(kind = ?row.kind, error = %err, "row failed");
                    self.summary.failed += 1;
                }
            }
        }
    }

    /// The current balance of every account.
    pub fn balances(&self) -> Vec<BalanceRow> {
        self.funds
            .bank()
            .accounts()
            .into_iter()
            .map(|account| BalanceRow {
                account: account.account_type(),
                balance: account.balance(),
            })
            .collect()
    }

    async fn clear_period(&self) -> Result<Option<MovementOutcome>, ReplayError> {
        if self.funds.clear_period_meters().await? {
            Ok(None)
        } else {
            Ok(Some(MovementOutcome::Declined(DeclineReason::Busy)))
        }
    }

    async fn apply(&self, row: &MovementRow) -> Result<Option<MovementOutcome>, ReplayError> {
        let funds = &self.funds;
        let device = row.device_id;
        let outcome = match row.kind {
            RowKind::CoinIn => funds.coin_in(device, row.amount()?).await?,
            RowKind::CurrencyIn => funds.currency_in(device, row.amount()?).await?,
            RowKind::VoucherIn => {
                let amounts = Amounts::cashable(row.amount()?);
                funds.voucher_in(device, row.reference(), amounts).await?
            }
            RowKind::VoucherOut => funds.voucher_out(device, row.reference.as_deref()).await?,
            RowKind::WatOn => {
                let amounts = Amounts::cashable(row.amount()?);
                funds.wat_on(device, row.reference(), amounts).await?
            }
            RowKind::WatOff => {
                let amounts = Amounts::cashable(row.amount()?);
                funds.wat_off(device, row.reference(), amounts).await?
            }
            RowKind::HandPayCash | RowKind::HandPayCredits => {
                let key_off = if row.kind == RowKind::HandPayCash {
                    KeyOffType::Cash
                } else {
                    KeyOffType::Credits
                };
                let amounts = Amounts::cashable(row.amount()?);
                funds.hand_pay_key_off(device, amounts, key_off).await?
            }
            RowKind::ClearPeriod => return self.clear_period().await,
        };
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use csv::{ReaderBuilder, Trim};

    use super::*;
    use crate::{
        config::CoreConfig,
        events::EventBus,
        meters::{Meter, names},
        storage::BlockStore,
    };

    fn replayer(receiver: mpsc::Receiver<MovementRow>) -> Replayer {
        let funds = FundsMovement::start(
            &BlockStore::in_memory(),
            &CoreConfig::default(),
            Arc::new(EventBus::new()),
        )
        .unwrap();
        Replayer::new(funds, receiver)
    }

    fn balance(replayer: &Replayer, account: AccountType) -> Money {
        replayer
            .balances()
            .into_iter()
            .find(|row| row.account == account)
            .map(|row| row.balance)
            .unwrap()
    }

    #[test]
    fn test_parse_rows() {
        let data = "kind, device, amount, reference\n\
                    coin_in, 1, 1.0,\n\
                    voucher_in, 2, 12.34, 0042\n\
                    voucher_out, 2, ,\n";
        let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(data.as_bytes());
        let rows: Vec<MovementRow> = reader.deserialize().flatten().collect();
        assert_eq!(
            rows,
            vec![
                MovementRow::new(RowKind::CoinIn, 1, Some(100), None),
                MovementRow::new(RowKind::VoucherIn, 2, Some(1234), Some("0042")),
                MovementRow::new(RowKind::VoucherOut, 2, None, None),
            ]
        );
    }

    #[test]
    fn test_unknown_kind_is_skipped() {
        let data = "kind,device,amount,reference\nbogus,1,1.0,\ncoin_in,1,2.0,\n";
        let mut reader = ReaderBuilder::new().from_reader(data.as_bytes());
        let rows: Vec<MovementRow> = reader.deserialize().flatten().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, RowKind::CoinIn);
    }

    #[tokio::test]
    async fn test_replay_session() {
        let (sender, receiver) = mpsc::channel(10);
        let mut replayer = replayer(receiver);

        let rows = [
            MovementRow::new(RowKind::CoinIn, 1, Some(100), None),
            MovementRow::new(RowKind::CurrencyIn, 2, Some(2000), None),
            MovementRow::new(RowKind::WatOn, 3, Some(500), Some("T-1")),
            MovementRow::new(RowKind::WatOff, 3, Some(10_000), Some("T-2")),
            MovementRow::new(RowKind::CoinIn, 1, None, None),
            MovementRow::new(RowKind::HandPayCash, 4, Some(7_500), None),
        ];
        for row in rows {
            sender.send(row).await.unwrap();
        }
        drop(sender);

        replayer.run().await;

        assert_eq!(
            replayer.summary(),
            &ReplaySummary {
                completed: 4,
                declined: 1,
                failed: 1,
            }
        );
        assert_eq!(balance(&replayer, AccountType::Cashable), 2600);
        let meters = replayer.funds().meters();
        assert_eq!(meters.get_meter(names::WAT_ON_COUNT).unwrap().lifetime(), 1);
        assert_eq!(
            meters.get_meter(names::TOTAL_CASH_OUT_AMOUNT).unwrap().lifetime(),
            7_500
        );
    }

    #[tokio::test]
    async fn test_voucher_out_then_clear_period() {
        let (sender, receiver) = mpsc::channel(10);
        let mut replayer = replayer(receiver);

        sender
            .send(MovementRow::new(RowKind::VoucherIn, 1, Some(2_500), Some("0007")))
            .await
            .unwrap();
        sender
            .send(MovementRow::new(RowKind::VoucherOut, 1, None, None))
            .await
            .unwrap();
        sender
            .send(MovementRow::new(RowKind::VoucherOut, 1, None, None))
            .await
            .unwrap();
        sender
            .send(MovementRow::new(RowKind::ClearPeriod, 1, None, None))
            .await
            .unwrap();
        drop(sender);

        replayer.run().await;

        assert_eq!(
            replayer.summary(),
            &ReplaySummary {
                completed: 3,
                declined: 1,
                failed: 0,
            }
        );
        assert_eq!(balance(&replayer, AccountType::Cashable), 0);
        let voucher_out = replayer
            .funds()
            .meters()
            .get_meter(names::VOUCHER_OUT_AMOUNT)
            .unwrap();
        assert_eq!(voucher_out.lifetime(), 2_500);
        assert_eq!(voucher_out.period(), 0);
        assert!(replayer.funds().meters().last_period_clear().unwrap().is_some());
    }

    #[test]
    fn test_balance_row_serializes_major_units() {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer
            .serialize(BalanceRow {
                account: AccountType::Cashable,
                balance: 1234,
            })
            .unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert!(text.ends_with("12.34\n"));
    }
}
