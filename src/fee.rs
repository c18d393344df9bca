//! Gas fee calculation
//!
//! The fee a sender pays for a transaction is `gas_used * effective_gas_price`,
//! for both legacy and EIP-1559 transactions.

use crate::error::{Error, Result};
use crate::types::{Receipt, Transaction};
use alloy_primitives::U256;

/// Calculate the effective gas price of a transaction.
///
/// Priority order:
/// 1. `effective_gas_price` from the receipt (post-London nodes)
/// 2. `gas_price` for legacy transactions
/// 3. `min(max_fee, base_fee + max_priority_fee)` for EIP-1559
pub fn effective_gas_price(
    tx: &Transaction,
    receipt: &Receipt,
    base_fee: Option<U256>,
) -> Result<U256> {
    if let Some(price) = receipt.effective_gas_price {
        return Ok(price);
    }

    if tx.is_legacy() {
        return tx
            .gas_price
            .ok_or_else(|| Error::InvalidData(format!("legacy tx {} missing gasPrice", tx.hash)));
    }

    if tx.is_eip1559() {
        let base_fee = base_fee.ok_or_else(|| {
            Error::InvalidData(format!("EIP-1559 tx {} in block without base fee", tx.hash))
        })?;
        let max_fee = tx
            .max_fee_per_gas
            .ok_or_else(|| Error::InvalidData(format!("tx {} missing maxFeePerGas", tx.hash)))?;
        let priority = tx.max_priority_fee_per_gas.unwrap_or(U256::ZERO);

        return Ok(base_fee.saturating_add(priority).min(max_fee));
    }

    Err(Error::InvalidData(format!(
        "tx {} has neither gasPrice nor maxFeePerGas",
        tx.hash
    )))
}

/// Fee paid by the sender of `tx`.
pub fn transaction_fee(tx: &Transaction, receipt: &Receipt, base_fee: Option<U256>) -> Result<U256> {
    let price = effective_gas_price(tx, receipt, base_fee)?;
    Ok(receipt.gas_used.saturating_mul(price))
}
