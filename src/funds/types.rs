//! Movement kinds, requestor identities, protocol assignment and decline reasons.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{coordinator::RequestorId, history::RecordKind};

/// Every kind of money movement the machine performs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    CoinIn,
    CurrencyIn,
    VoucherIn,
    VoucherOut,
    WatOn,
    WatOff,
    HandPay,
}

impl MovementKind {
    pub const ALL: [MovementKind; 7] = [
        MovementKind::CoinIn,
        MovementKind::CurrencyIn,
        MovementKind::VoucherIn,
        MovementKind::VoucherOut,
        MovementKind::WatOn,
        MovementKind::WatOff,
        MovementKind::HandPay,
    ];

    /// The fixed identity the subsystem behind this movement presents to the coordinator.
    pub fn requestor(self) -> RequestorId {
        match self {
            MovementKind::CoinIn => COIN_ACCEPTOR,
            MovementKind::CurrencyIn => NOTE_ACCEPTOR,
            MovementKind::VoucherIn | MovementKind::VoucherOut => VOUCHER_SUBSYSTEM,
            MovementKind::WatOn | MovementKind::WatOff => WAT_SUBSYSTEM,
            MovementKind::HandPay => HAND_PAY_SUBSYSTEM,
        }
    }

    /// The host-validated feature this movement belongs to, if any.
    pub fn feature(self) -> Option<FundsFeature> {
        match self {
            MovementKind::VoucherIn | MovementKind::VoucherOut => Some(FundsFeature::Vouchers),
            MovementKind::WatOn | MovementKind::WatOff => Some(FundsFeature::Wat),
            _ => None,
        }
    }

    pub fn record_kind(self) -> RecordKind {
        match self {
            MovementKind::CoinIn => RecordKind::CoinIn,
            MovementKind::CurrencyIn => RecordKind::BillIn,
            MovementKind::VoucherIn => RecordKind::VoucherIn,
            MovementKind::VoucherOut => RecordKind::VoucherOut,
            MovementKind::WatOn => RecordKind::WatOn,
            MovementKind::WatOff => RecordKind::WatOff,
            MovementKind::HandPay => RecordKind::HandPay,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MovementKind::CoinIn => "coin_in",
            MovementKind::CurrencyIn => "currency_in",
            MovementKind::VoucherIn => "voucher_in",
            MovementKind::VoucherOut => "voucher_out",
            MovementKind::WatOn => "wat_on",
            MovementKind::WatOff => "wat_off",
            MovementKind::HandPay => "hand_pay",
        }
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown movement kind {s}"))
    }
}

pub const COIN_ACCEPTOR: RequestorId = RequestorId::from_u128(0x6c1e_0d1c_2b3a_4f5e_8a7b_c0111a000001);
pub const NOTE_ACCEPTOR: RequestorId = RequestorId::from_u128(0x6c1e_0d1c_2b3a_4f5e_8a7b_c0111a000002);
pub const VOUCHER_SUBSYSTEM: RequestorId =
    RequestorId::from_u128(0x6c1e_0d1c_2b3a_4f5e_8a7b_c0111a000003);
pub const WAT_SUBSYSTEM: RequestorId = RequestorId::from_u128(0x6c1e_0d1c_2b3a_4f5e_8a7b_c0111a000004);
pub const HAND_PAY_SUBSYSTEM: RequestorId =
    RequestorId::from_u128(0x6c1e_0d1c_2b3a_4f5e_8a7b_c0111a000005);
/// The operator menu that clears period meters.
pub const AUDIT_MENU: RequestorId = RequestorId::from_u128(0x6c1e_0d1c_2b3a_4f5e_8a7b_c0111a000006);

/// Features whose transfers are validated by a host protocol.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FundsFeature {
    Wat,
    Vouchers,
}

/// Host protocols that can validate transfers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolId {
    Sas,
    G2s,
    Mgam,
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolId::Sas => "SAS",
            ProtocolId::G2s => "G2S",
            ProtocolId::Mgam => "MGAM",
        };
        f.write_str(name)
    }
}

/// Which protocol handles each validated feature. `None` means the feature is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolAssignment {
    pub wat: Option<ProtocolId>,
    pub voucher: Option<ProtocolId>,
}

impl ProtocolAssignment {
    pub fn protocol_for(&self, feature: FundsFeature) -> Option<ProtocolId> {
        match feature {
            FundsFeature::Wat => self.wat,
            FundsFeature::Vouchers => self.voucher,
        }
    }

    pub fn assign(&mut self, feature: FundsFeature, protocol: Option<ProtocolId>) {
        match feature {
            FundsFeature::Wat => self.wat = protocol,
            FundsFeature::Vouchers => self.voucher = protocol,
        }
    }
}

/// Why a movement was turned down without error.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// No transaction handle could be obtained in time.
    Busy,
    /// The credits would exceed the bank limit.
    CreditLimit,
    InsufficientFunds,
    /// No protocol is assigned to the feature, or none is registered for it.
    NoValidator,
    ValidatorRejected(String),
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::Busy => f.write_str("busy"),
            DeclineReason::CreditLimit => f.write_str("credit limit"),
            DeclineReason::InsufficientFunds => f.write_str("insufficient funds"),
            DeclineReason::NoValidator => f.write_str("no validator"),
            DeclineReason::ValidatorRejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}
