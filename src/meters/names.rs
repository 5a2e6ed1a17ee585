//! Names of the meters touched by funds movements.

pub const CURRENT_CREDITS: &str = "CurrentCredits";

pub const COIN_IN_AMOUNT: &str = "CoinInAmount";
pub const COIN_IN_COUNT: &str = "CoinInCount";

pub const CURRENCY_IN_AMOUNT: &str = "CurrencyInAmount";
pub const CURRENCY_IN_COUNT: &str = "CurrencyInCount";

pub const VOUCHER_IN_AMOUNT: &str = "VoucherInAmount";
pub const VOUCHER_IN_COUNT: &str = "VoucherInCount";
pub const VOUCHER_OUT_AMOUNT: &str = "VoucherOutAmount";
pub const VOUCHER_OUT_COUNT: &str = "VoucherOutCount";

pub const WAT_ON_AMOUNT: &str = "WatOnAmount";
pub const WAT_ON_COUNT: &str = "WatOnCount";
pub const WAT_OFF_AMOUNT: &str = "WatOffAmount";
pub const WAT_OFF_COUNT: &str = "WatOffCount";

pub const HAND_PAID_AMOUNT: &str = "HandPaidAmount";
pub const HAND_PAID_COUNT: &str = "HandPaidCount";

/// Every amount that left the machine: vouchers out, WAT off and hand pays to cash.
pub const TOTAL_CASH_OUT_AMOUNT: &str = "TotalCashOutAmount";
