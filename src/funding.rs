//! Prefund helpers. The pipeline never calls these; funding is the caller's job.

use crate::contracts::EntryPoint;
use crate::error::{AaError, Result};
use ethers::providers::Middleware;
use ethers::types::{Address, TransactionReceipt, TransactionRequest, U256};
use std::sync::Arc;

/// How much to add so `current` reaches `target`, or `None` if it already does.
pub fn top_up_amount(current: U256, target: U256) -> Option<U256> {
    (current < target).then(|| target - current)
}

/// Entry-point deposit for `target`.
///
/// With `min`, tops the deposit up to `min` instead of adding `amount`,
/// and does nothing when the deposit already meets it.
pub async fn deposit<M: Middleware + 'static>(
    entry_point: &EntryPoint<M>,
    target: Address,
    amount: U256,
    min: Option<U256>,
) -> Result<Option<TransactionReceipt>> {
    let value = match min {
        Some(min) => {
            let current = entry_point.balance_of(target).await?;
            match top_up_amount(current, min) {
                Some(missing) => missing,
                None => {
                    tracing::info!(?target, %current, %min, "deposit already sufficient");
                    return Ok(None);
                }
            }
        }
        None => amount,
    };

    if value.is_zero() {
        return Ok(None);
    }

    let receipt = entry_point.deposit_to(target, value).await?;
    tracing::info!(?target, %value, tx = ?receipt.transaction_hash, "deposited to entry point");
    Ok(Some(receipt))
}

/// Native transfer that brings `account`'s balance up to `target`.
pub async fn fund_native<M: Middleware + 'static>(
    client: Arc<M>,
    account: Address,
    target: U256,
) -> Result<Option<TransactionReceipt>> {
    let balance = client
        .get_balance(account, None)
        .await
        .map_err(|e| AaError::Network(format!("eth_getBalance failed: {e}")))?;

    let Some(value) = top_up_amount(balance, target) else {
        tracing::info!(?account, %balance, "account balance already sufficient");
        return Ok(None);
    };

    let tx = TransactionRequest::new().to(account).value(value);
    let pending = client
        .send_transaction(tx, None)
        .await
        .map_err(|e| AaError::Network(format!("failed to send funding tx: {e}")))?;

    let receipt = pending
        .await
        .map_err(|e| AaError::Network(format!("failed waiting for funding receipt: {e}")))?
        .ok_or_else(|| AaError::Network("funding tx dropped from mempool".into()))?;

    tracing::info!(?account, %value, "funded account");
    Ok(Some(receipt))
}
