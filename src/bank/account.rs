//! Account kinds and the per-account balance arithmetic used by the bank.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::bank::{BankError, Money};

/// The closed set of ledger buckets.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Cashable,
    Promotional,
    NonCashable,
}

impl AccountType {
    /// Every account kind, in storage order.
    pub const ALL: [AccountType; 3] = [
        AccountType::Cashable,
        AccountType::Promotional,
        AccountType::NonCashable,
    ];

    /// Element index of this account inside the bank block.
    pub(crate) fn index(self) -> usize {
        match self {
            AccountType::Cashable => 0,
            AccountType::Promotional => 1,
            AccountType::NonCashable => 2,
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccountType::Cashable => "cashable",
            AccountType::Promotional => "promotional",
            AccountType::NonCashable => "noncashable",
        };
        f.write_str(name)
    }
}

impl FromStr for AccountType {
    type Err = BankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cashable" => Ok(AccountType::Cashable),
            "promotional" | "promo" => Ok(AccountType::Promotional),
            "noncashable" | "non-cashable" | "non_cashable" => Ok(AccountType::NonCashable),
            _ => Err(BankError::UnknownAccount(s.to_string())),
        }
    }
}

/// Represents one ledger bucket and its balance.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    /// The kind of account.
    #[serde(rename = "account")]
    account_type: AccountType,

    /// The balance in the smallest currency unit. Never negative.
    balance: Money,
}

impl Account {
    /// Creates an account with the given balance.
    pub fn new(account_type: AccountType, balance: Money) -> Self {
        Account {
            account_type,
            balance,
        }
    }

    /// Gets the account kind.
    pub fn account_type(&self) -> AccountType {
        self.account_type
    }

    /// Gets the balance.
    pub fn balance(&self) -> Money {
        self.balance
    }

    /// Computes the balance after depositing `amount`, without applying it.
    pub(crate) fn after_deposit(&self, amount: Money) -> Result<Money, BankError> {
        if amount < 0 {
            return Err(BankError::InvalidAmount(amount));
        }
        self.balance
            .checked_add(amount)
            .ok_or(BankError::Overflow(self.account_type))
    }

    /// Computes the balance after withdrawing `amount`, without applying it.
    /// Returns an error if there are insufficient funds.
    pub(crate) fn after_withdraw(&self, amount: Money) -> Result<Money, BankError> {
        if amount < 0 {
            return Err(BankError::InvalidAmount(amount));
        }
        if self.balance >= amount {
            Ok(self.balance - amount)
        } else {
            Err(BankError::InsufficientFunds {
                account: self.account_type,
                balance: self.balance,
                requested: amount,
            })
        }
    }

    pub(crate) fn set_balance(&mut self, balance: Money) {
        self.balance = balance;
    }
}

#[cfg(test)]
mod tests {
    use crate::bank::{Account, AccountType, BankError};

    #[test]
    fn test_deposit() {
        let account = Account::new(AccountType::Cashable, 500);
        assert_eq!(account.after_deposit(1000).unwrap(), 1500);
        assert_eq!(account.balance(), 500);
    }

    #[test]
    fn test_withdrawal() {
        let account = Account::new(AccountType::Cashable, 2000);
        assert_eq!(account.after_withdraw(1000).unwrap(), 1000);
        assert_eq!(account.after_withdraw(2000).unwrap(), 0);
    }

    #[test]
    fn test_withdrawal_insufficient_funds() {
        let account = Account::new(AccountType::Promotional, 999);
        assert!(matches!(
            account.after_withdraw(1000),
            Err(BankError::InsufficientFunds {
                account: AccountType::Promotional,
                balance: 999,
                requested: 1000
            })
        ));
    }

    #[test]
    fn test_negative_amount() {
        let account = Account::new(AccountType::Cashable, 10);
        assert!(matches!(
            account.after_deposit(-1),
            Err(BankError::InvalidAmount(-1))
        ));
        assert!(matches!(
            account.after_withdraw(-1),
            Err(BankError::InvalidAmount(-1))
        ));
    }

    #[test]
    fn test_parse_account_type() {
        assert_eq!("Cashable".parse::<AccountType>().unwrap(), AccountType::Cashable);
        assert_eq!("promo".parse::<AccountType>().unwrap(), AccountType::Promotional);
        assert_eq!(
            "non-cashable".parse::<AccountType>().unwrap(),
            AccountType::NonCashable
        );
        assert!(matches!(
            "jackpot".parse::<AccountType>(),
            Err(BankError::UnknownAccount(_))
        ));
    }

    #[test]
    fn test_overflow() {
        let account = Account::new(AccountType::NonCashable, i64::MAX);
        assert!(matches!(
            account.after_deposit(1),
            Err(BankError::Overflow(AccountType::NonCashable))
        ));
    }
}
