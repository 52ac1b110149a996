use crate::error::{AaError, Result};
use ethers::{
    abi::{self, AbiEncode, ParamType, Token},
    contract::{EthAbiCodec, EthAbiType},
    types::{Address, Bytes, Signature, H256, U256},
    utils::keccak256,
};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// `paymaster_and_data` is either empty or `paymaster ‖ abi.encode(validUntil, validAfter) ‖ sig`.
/// `signature` is the last field written and covers every other field.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, EthAbiType, EthAbiCodec, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// Hash preimage: dynamic fields are replaced by their keccak256 and the signature is dropped.
#[derive(EthAbiCodec, EthAbiType)]
struct UserOperationHashFields {
    sender: Address,
    nonce: U256,
    init_code: H256,
    call_data: H256,
    call_gas_limit: U256,
    verification_gas_limit: U256,
    pre_verification_gas: U256,
    max_fee_per_gas: U256,
    max_priority_fee_per_gas: U256,
    paymaster_and_data: H256,
}

impl From<&UserOperation> for UserOperationHashFields {
    fn from(op: &UserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code: keccak256(op.init_code.deref()).into(),
            call_data: keccak256(op.call_data.deref()).into(),
            call_gas_limit: op.call_gas_limit,
            verification_gas_limit: op.verification_gas_limit,
            pre_verification_gas: op.pre_verification_gas,
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            paymaster_and_data: keccak256(op.paymaster_and_data.deref()).into(),
        }
    }
}

impl UserOperation {
    /// Canonical user operation hash, bound to the entry point and chain id.
    ///
    /// keccak256(abi.encode(keccak256(pack(op)), entryPoint, chainId))
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let packed = UserOperationHashFields::from(self).encode();
        H256::from(keccak256(
            [
                keccak256(packed).to_vec(),
                entry_point.encode(),
                U256::from(chain_id).encode(),
            ]
            .concat(),
        ))
    }
}

/// An operation that has been built but not yet signed by the owner.
///
/// Only the paymaster field may still change before signing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsignedUserOperation(UserOperation);

impl UnsignedUserOperation {
    pub(crate) fn new(op: UserOperation) -> Self {
        Self(op)
    }

    pub(crate) fn set_paymaster_and_data(&mut self, data: Bytes) {
        self.0.paymaster_and_data = data;
    }

    pub(crate) fn into_inner(self) -> UserOperation {
        self.0
    }
}

impl Deref for UnsignedUserOperation {
    type Target = UserOperation;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A final, owner-signed operation together with the hash the owner signed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedUserOperation {
    op: UserOperation,
    hash: H256,
}

impl SignedUserOperation {
    pub(crate) fn new(op: UserOperation, hash: H256) -> Self {
        Self { op, hash }
    }

    pub fn user_op_hash(&self) -> H256 {
        self.hash
    }
}

impl Deref for SignedUserOperation {
    type Target = UserOperation;

    fn deref(&self) -> &Self::Target {
        &self.op
    }
}

/// Observed on-chain view of the smart account. Re-read before every operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountState {
    pub address: Address,
    pub deployed: bool,
    pub nonce: U256,
}

/// The call the smart account should make on the caller's behalf.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    pub fn new(to: Address) -> Self {
        Self {
            to,
            ..Default::default()
        }
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GasLimits {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl GasLimits {
    pub fn any_zero(&self) -> bool {
        self.call_gas_limit.is_zero()
            || self.verification_gas_limit.is_zero()
            || self.pre_verification_gas.is_zero()
    }
}

/// Decoded verifying-paymaster field: `paymaster ‖ abi.encode(uint48 validUntil, uint48 validAfter) ‖ signature`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymasterAndData {
    pub paymaster: Address,
    pub valid_until: u64,
    pub valid_after: u64,
    pub signature: Bytes,
}

const VALIDITY_LEN: usize = 64;

impl PaymasterAndData {
    pub fn encode(&self) -> Bytes {
        let validity = abi::encode(&[
            Token::Uint(U256::from(self.valid_until)),
            Token::Uint(U256::from(self.valid_after)),
        ]);

        let mut v = Vec::with_capacity(20 + VALIDITY_LEN + self.signature.len());
        v.extend_from_slice(self.paymaster.as_bytes());
        v.extend_from_slice(&validity);
        v.extend_from_slice(self.signature.as_ref());
        Bytes::from(v)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 20 + VALIDITY_LEN {
            return Err(AaError::Abi(format!(
                "paymasterAndData too short: {} bytes",
                data.len()
            )));
        }

        let paymaster = Address::from_slice(&data[..20]);
        let tokens = abi::decode(
            &[ParamType::Uint(48), ParamType::Uint(48)],
            &data[20..20 + VALIDITY_LEN],
        )
        .map_err(AaError::abi)?;

        let (valid_until, valid_after) = match tokens.as_slice() {
            [Token::Uint(until), Token::Uint(after)] => (until.low_u64(), after.low_u64()),
            _ => return Err(AaError::Abi("unexpected validity tokens".into())),
        };

        Ok(Self {
            paymaster,
            valid_until,
            valid_after,
            signature: Bytes::from(data[20 + VALIDITY_LEN..].to_vec()),
        })
    }

    /// Paymaster address the field starts with, if any.
    pub fn paymaster_of(data: &[u8]) -> Option<Address> {
        (data.len() >= 20).then(|| Address::from_slice(&data[..20]))
    }
}

/// Result of a user operation landing on chain.
///
/// `raw` is whatever the transport returned (bundler receipt object or the
/// entry-point transaction receipt), passed through untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    pub transaction_hash: Option<H256>,
    pub success: bool,
    pub raw: serde_json::Value,
}

/// Recovers the signer of an EIP-191 personal message over `hash`.
pub fn recover_personal(hash: H256, signature: &[u8]) -> Result<Address> {
    let sig = Signature::try_from(signature).map_err(AaError::abi)?;
    sig.recover(hash.as_bytes()).map_err(AaError::abi)
}
