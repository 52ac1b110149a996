use crate::error::{AaError, Result};
use crate::types::{SignedUserOperation, UnsignedUserOperation};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes};

/// Signs user operations with the smart account owner's key.
///
/// The signed digest is the canonical user operation hash (bound to entry
/// point and chain id), wrapped in an EIP-191 personal message, which is what
/// SimpleAccount's `_validateSignature` recovers against.
#[derive(Debug, Clone)]
pub struct OperationSigner {
    wallet: LocalWallet,
    entry_point: Address,
    chain_id: u64,
}

impl OperationSigner {
    pub fn new(wallet: LocalWallet, entry_point: Address, chain_id: u64) -> Self {
        Self {
            wallet: wallet.with_chain_id(chain_id),
            entry_point,
            chain_id,
        }
    }

    /// Owner address registered in the account.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Hashes every field but the signature, signs the hash, and seals the operation.
    pub async fn sign(&self, op: UnsignedUserOperation) -> Result<SignedUserOperation> {
        let mut op = op.into_inner();
        let hash = op.hash(self.entry_point, self.chain_id);

        let sig = self
            .wallet
            .sign_message(hash.as_bytes())
            .await
            .map_err(|e| AaError::SignerUnavailable(format!("failed to sign userOpHash: {e}")))?;

        op.signature = Bytes::from(sig.to_vec());
        tracing::debug!(user_op_hash = ?hash, "signed user operation");

        Ok(SignedUserOperation::new(op, hash))
    }
}
