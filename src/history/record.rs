//! Transaction records kept by the history logs.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bank::{AccountType, DeviceId, Money};

/// The kind of money movement a record describes. Each kind has its own log.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    BillIn,
    CoinIn,
    VoucherIn,
    VoucherOut,
    HandPay,
    WatOn,
    WatOff,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        RecordKind::BillIn,
        RecordKind::CoinIn,
        RecordKind::VoucherIn,
        RecordKind::VoucherOut,
        RecordKind::HandPay,
        RecordKind::WatOn,
        RecordKind::WatOff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::BillIn => "bill_in",
            RecordKind::CoinIn => "coin_in",
            RecordKind::VoucherIn => "voucher_in",
            RecordKind::VoucherOut => "voucher_out",
            RecordKind::HandPay => "hand_pay",
            RecordKind::WatOn => "wat_on",
            RecordKind::WatOff => "wat_off",
        }
    }

    /// How many records the log of this kind keeps unless configured otherwise.
    pub fn default_capacity(self) -> usize {
        match self {
            RecordKind::BillIn | RecordKind::CoinIn => 100,
            RecordKind::VoucherIn | RecordKind::VoucherOut => 50,
            RecordKind::HandPay => 25,
            RecordKind::WatOn | RecordKind::WatOff => 50,
        }
    }
}

/// Amounts moved per account type.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Amounts {
    pub cashable: Money,
    pub promotional: Money,
    pub non_cashable: Money,
}

impl Amounts {
    pub fn cashable(amount: Money) -> Self {
        Amounts {
            cashable: amount,
            ..Amounts::default()
        }
    }

    pub fn of(&self, account: AccountType) -> Money {
        match account {
            AccountType::Cashable => self.cashable,
            AccountType::Promotional => self.promotional,
            AccountType::NonCashable => self.non_cashable,
        }
    }

    /// The sum over every account, or `None` if it overflows.
    pub fn total(&self) -> Option<Money> {
        self.cashable
            .checked_add(self.promotional)?
            .checked_add(self.non_cashable)
    }

    /// Non-zero amounts in account order.
    pub fn iter(&self) -> impl Iterator<Item = (AccountType, Money)> + '_ {
        AccountType::ALL
            .into_iter()
            .map(move |account| (account, self.of(account)))
            .filter(|(_, amount)| *amount != 0)
    }
}

/// Where a hand pay was keyed off to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyOffType {
    /// Paid by an attendant; the credits leave the machine.
    Cash,
    /// Returned to the credit meter.
    Credits,
}

/// Fields specific to each kind of record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordDetail {
    BillIn { denomination: Money },
    CoinIn { denomination: Money },
    VoucherIn { barcode: String },
    VoucherOut { barcode: String, printed: bool },
    HandPay { key_off: KeyOffType },
    WatOn { reference: String },
    WatOff { reference: String },
}

impl RecordDetail {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordDetail::BillIn { .. } => RecordKind::BillIn,
            RecordDetail::CoinIn { .. } => RecordKind::CoinIn,
            RecordDetail::VoucherIn { .. } => RecordKind::VoucherIn,
            RecordDetail::VoucherOut { .. } => RecordKind::VoucherOut,
            RecordDetail::HandPay { .. } => RecordKind::HandPay,
            RecordDetail::WatOn { .. } => RecordKind::WatOn,
            RecordDetail::WatOff { .. } => RecordKind::WatOff,
        }
    }
}

/// One completed money movement.
///
/// `log_sequence` and `transaction_id` are assigned by the history when the record is
/// saved; a fresh record has sequence zero and no id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub amounts: Amounts,
    pub log_sequence: u64,
    pub transaction_id: Option<u64>,
    pub detail: RecordDetail,
}

impl TransactionRecord {
    pub fn new(device_id: DeviceId, amounts: Amounts, detail: RecordDetail) -> Self {
        TransactionRecord {
            device_id,
            timestamp: Utc::now(),
            amounts,
            log_sequence: 0,
            transaction_id: None,
            detail,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.detail.kind()
    }
}

/// Capacity and persistence of the log for one record kind. Fixed once the history is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLogConfig {
    pub kind: RecordKind,
    pub capacity: usize,
    pub persistable: bool,
}

impl HistoryLogConfig {
    pub fn new(kind: RecordKind, capacity: usize) -> Self {
        HistoryLogConfig {
            kind,
            capacity,
            persistable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detail_kind() {
        let record = TransactionRecord::new(
            1,
            Amounts::cashable(500),
            RecordDetail::VoucherIn {
                barcode: "0012".to_string(),
            },
        );
        assert_eq!(record.kind(), RecordKind::VoucherIn);
        assert_eq!(record.transaction_id, None);
        assert_eq!(record.log_sequence, 0);
    }

    #[test]
    fn test_amounts() {
        let amounts = Amounts {
            cashable: 100,
            promotional: 0,
            non_cashable: 25,
        };
        assert_eq!(amounts.total(), Some(125));
        let overflowing = Amounts {
            cashable: Money::MAX,
            promotional: 1,
            non_cashable: 0,
        };
        assert_eq!(overflowing.total(), None);
        assert_eq!(
            amounts.iter().collect::<Vec<_>>(),
            vec![(AccountType::Cashable, 100), (AccountType::NonCashable, 25)]
        );
    }

    #[test]
    fn test_record_json_shape() {
        let detail = RecordDetail::HandPay {
            key_off: KeyOffType::Credits,
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["kind"], "hand_pay");
        assert_eq!(json["key_off"], "credits");
    }
}
