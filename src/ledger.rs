//! Currency balances kept in the `balances` dataset.

use crate::core::{LedgerError, Principal, Result};
use crate::protocol::UpdateProtocol;
use crate::storage::registry::BALANCES;
use std::sync::Arc;

pub struct CurrencyLedger {
    protocol: Arc<UpdateProtocol>,
}

impl CurrencyLedger {
    pub fn new(protocol: Arc<UpdateProtocol>) -> Self {
        Self { protocol }
    }

    pub fn balance(&self, who: &Principal) -> Result<i64> {
        self.protocol.get(who, BALANCES, 0i64)
    }

    /// Adds `amount` and returns the new balance.
    pub async fn credit(&self, who: &Principal, amount: i64) -> Result<i64> {
        check_amount(amount)?;
        let mut balance = 0;
        self.protocol
            .try_update(who, BALANCES, 0i64, |current| {
                balance = current
                    .checked_add(amount)
                    .ok_or_else(|| LedgerError::Rejected("balance overflow".to_string()))?;
                Ok(balance)
            })
            .await?;
        Ok(balance)
    }

    /// Removes `amount`, refusing to go below zero. Returns the new balance.
    pub async fn debit(&self, who: &Principal, amount: i64) -> Result<i64> {
        check_amount(amount)?;
        let mut balance = 0;
        self.protocol
            .try_update(who, BALANCES, 0i64, |current| {
                if current < amount {
                    return Err(LedgerError::Rejected(format!(
                        "insufficient funds: balance {}, needed {}",
                        current, amount
                    )));
                }
                balance = current - amount;
                Ok(balance)
            })
            .await?;
        Ok(balance)
    }

    /// Moves `amount` from `from` to `to`.
    ///
    /// The debit happens first; if the credit then fails the debit is
    /// refunded, so no currency is created or lost.
    pub async fn transfer(&self, from: &Principal, to: &Principal, amount: i64) -> Result<()> {
        if from.id == to.id {
            return Err(LedgerError::Rejected("cannot transfer to yourself".to_string()));
        }
        self.debit(from, amount).await?;
        if let Err(err) = self.credit(to, amount).await {
            self.credit(from, amount).await?;
            return Err(err);
        }
        Ok(())
    }
}

fn check_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::Rejected(format!("amount must be positive, got {}", amount)));
    }
    Ok(())
}
