//! Verifying-paymaster sponsorship.
//!
//! The paymaster's off-chain signer approves an operation for a time window by
//! signing `VerifyingPaymaster.getHash(op, validUntil, validAfter)`. The result
//! is packed into `paymasterAndData` before the owner signs.

use crate::contracts::VerifyingPaymaster;
use crate::error::{AaError, Result};
use crate::types::{PaymasterAndData, UnsignedUserOperation};
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockNumber, Bytes, H256};
use std::sync::Arc;

/// Seconds a sponsorship stays valid after it is issued.
pub const DEFAULT_VALIDITY_WINDOW: u64 = 20_000;

/// Key that authorizes sponsorship.
///
/// It can only sign paymaster hashes. There is no way to sign an arbitrary
/// message or transaction with it:
///
/// ```compile_fail
/// use aa_signer::paymaster::PaymasterSigner;
///
/// async fn misuse(signer: PaymasterSigner) {
///     let _ = signer.sign_message(b"any digest").await;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct PaymasterSigner {
    wallet: LocalWallet,
}

impl PaymasterSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub(crate) async fn sign_hash(&self, hash: H256) -> Result<Bytes> {
        let sig = self.wallet.sign_message(hash.as_bytes()).await.map_err(|e| {
            AaError::SignerUnavailable(format!("paymaster signer failed: {e}"))
        })?;
        Ok(Bytes::from(sig.to_vec()))
    }
}

/// Issues sponsorship for operations through one deployed VerifyingPaymaster.
#[derive(Debug, Clone)]
pub struct PaymasterAuthorizer<M> {
    client: Arc<M>,
    paymaster: VerifyingPaymaster<M>,
    signer: PaymasterSigner,
    window: u64,
}

impl<M: Middleware + 'static> PaymasterAuthorizer<M> {
    pub fn new(client: Arc<M>, paymaster: Address, signer: PaymasterSigner) -> Result<Self> {
        Ok(Self {
            paymaster: VerifyingPaymaster::new(paymaster, client.clone())?,
            client,
            signer,
            window: DEFAULT_VALIDITY_WINDOW,
        })
    }

    /// Sponsorship lifetime in seconds. Zero would leave no valid timestamp.
    pub fn with_window(mut self, seconds: u64) -> Result<Self> {
        if seconds == 0 {
            return Err(AaError::Config("paymaster validity window must be at least 1s".into()));
        }
        self.window = seconds;
        Ok(self)
    }

    pub fn address(&self) -> Address {
        self.paymaster.address()
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// Chain time of the latest block.
    pub async fn latest_timestamp(&self) -> Result<u64> {
        let block = self
            .client
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| AaError::Network(format!("failed to fetch latest block: {e}")))?
            .ok_or_else(|| AaError::Network("latest block not found".into()))?;
        Ok(block.timestamp.low_u64())
    }

    /// Sponsors `op` starting at the current chain time.
    pub async fn authorize(&self, op: &mut UnsignedUserOperation) -> Result<PaymasterAndData> {
        let now = self.latest_timestamp().await?;
        self.authorize_at(op, now).await
    }

    /// Sponsors `op` for `[now, now + window]` and writes the field into it.
    ///
    /// The hash is requested over the operation as it stands, so the
    /// paymaster field must be empty and the signature unset at this point.
    pub async fn authorize_at(
        &self,
        op: &mut UnsignedUserOperation,
        now: u64,
    ) -> Result<PaymasterAndData> {
        let valid_after = now;
        let valid_until = now.saturating_add(self.window);

        let hash = self.paymaster.get_hash(&**op, valid_until, valid_after).await?;
        let signature = self.signer.sign_hash(hash).await?;

        let data = PaymasterAndData {
            paymaster: self.paymaster.address(),
            valid_until,
            valid_after,
            signature,
        };
        op.set_paymaster_and_data(data.encode());

        tracing::info!(
            paymaster = ?data.paymaster,
            valid_after,
            valid_until,
            "paymaster authorized operation"
        );
        Ok(data)
    }
}
