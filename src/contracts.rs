//! Call interfaces of the deployed ERC-4337 contracts (EntryPoint v0.6,
//! SimpleAccountFactory, SimpleAccount, VerifyingPaymaster).
//!
//! Only the functions this crate touches are declared. Encoding helpers are
//! pure; the wrappers issue calls through any `Middleware`.

use crate::error::{AaError, Result};
use crate::types::UserOperation;
use ethers::abi::{Abi, AbiParser};
use ethers::contract::{BaseContract, Contract, ContractCall};
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use serde_json::{json, Value};
use std::sync::Arc;

fn user_op_tuple(name: &str) -> Value {
    json!({
        "name": name,
        "type": "tuple",
        "internalType": "struct UserOperation",
        "components": [
            { "name": "sender", "type": "address" },
            { "name": "nonce", "type": "uint256" },
            { "name": "initCode", "type": "bytes" },
            { "name": "callData", "type": "bytes" },
            { "name": "callGasLimit", "type": "uint256" },
            { "name": "verificationGasLimit", "type": "uint256" },
            { "name": "preVerificationGas", "type": "uint256" },
            { "name": "maxFeePerGas", "type": "uint256" },
            { "name": "maxPriorityFeePerGas", "type": "uint256" },
            { "name": "paymasterAndData", "type": "bytes" },
            { "name": "signature", "type": "bytes" }
        ]
    })
}

pub fn entry_point_abi() -> Result<Abi> {
    let mut ops = user_op_tuple("ops");
    ops["type"] = json!("tuple[]");
    ops["internalType"] = json!("struct UserOperation[]");

    let abi = json!([
        {
            "type": "function",
            "name": "getNonce",
            "stateMutability": "view",
            "inputs": [
                { "name": "sender", "type": "address" },
                { "name": "key", "type": "uint192" }
            ],
            "outputs": [{ "name": "nonce", "type": "uint256" }]
        },
        {
            "type": "function",
            "name": "balanceOf",
            "stateMutability": "view",
            "inputs": [{ "name": "account", "type": "address" }],
            "outputs": [{ "name": "", "type": "uint256" }]
        },
        {
            "type": "function",
            "name": "depositTo",
            "stateMutability": "payable",
            "inputs": [{ "name": "account", "type": "address" }],
            "outputs": []
        },
        {
            "type": "function",
            "name": "getUserOpHash",
            "stateMutability": "view",
            "inputs": [user_op_tuple("userOp")],
            "outputs": [{ "name": "", "type": "bytes32" }]
        },
        {
            "type": "function",
            "name": "handleOps",
            "stateMutability": "nonpayable",
            "inputs": [ops, { "name": "beneficiary", "type": "address" }],
            "outputs": []
        }
    ]);
    serde_json::from_value(abi).map_err(AaError::abi)
}

pub fn verifying_paymaster_abi() -> Result<Abi> {
    let abi = json!([
        {
            "type": "function",
            "name": "getHash",
            "stateMutability": "view",
            "inputs": [
                user_op_tuple("userOp"),
                { "name": "validUntil", "type": "uint48" },
                { "name": "validAfter", "type": "uint48" }
            ],
            "outputs": [{ "name": "", "type": "bytes32" }]
        },
        {
            "type": "function",
            "name": "addStake",
            "stateMutability": "payable",
            "inputs": [{ "name": "unstakeDelaySec", "type": "uint32" }],
            "outputs": []
        },
        {
            "type": "function",
            "name": "deposit",
            "stateMutability": "payable",
            "inputs": [],
            "outputs": []
        }
    ]);
    serde_json::from_value(abi).map_err(AaError::abi)
}

pub fn account_factory_abi() -> Result<Abi> {
    AbiParser::default()
        .parse(&[
            "function createAccount(address owner, uint256 salt) returns (address)",
            "function getAddress(address owner, uint256 salt) view returns (address)",
        ])
        .map_err(AaError::abi)
}

pub fn simple_account_abi() -> Result<Abi> {
    AbiParser::default()
        .parse(&[
            "function execute(address dest, uint256 value, bytes func)",
        ])
        .map_err(AaError::abi)
}

/// `factory ‖ createAccount(owner, salt)`: the initCode of an undeployed account.
pub fn encode_init_code(factory: Address, owner: Address, salt: U256) -> Result<Bytes> {
    let create = BaseContract::from(account_factory_abi()?)
        .encode("createAccount", (owner, salt))
        .map_err(AaError::abi)?;

    let mut v = Vec::with_capacity(20 + create.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(create.as_ref());
    Ok(Bytes::from(v))
}

/// `SimpleAccount.execute(dest, value, func)` call data.
pub fn encode_execute(dest: Address, value: U256, func: Bytes) -> Result<Bytes> {
    BaseContract::from(simple_account_abi()?)
        .encode("execute", (dest, value, func))
        .map_err(AaError::abi)
}

#[derive(Debug, Clone)]
pub struct EntryPoint<M> {
    contract: Contract<M>,
}

impl<M: Middleware + 'static> EntryPoint<M> {
    pub fn new(address: Address, client: Arc<M>) -> Result<Self> {
        Ok(Self {
            contract: Contract::new(address, entry_point_abi()?, client),
        })
    }

    pub fn address(&self) -> Address {
        self.contract.address()
    }

    /// Next nonce of `sender` under key 0.
    pub async fn get_nonce(&self, sender: Address) -> Result<U256> {
        self.contract
            .method::<_, U256>("getNonce", (sender, U256::zero()))
            .map_err(AaError::abi)?
            .call()
            .await
            .map_err(|e| AaError::Network(format!("entryPoint.getNonce failed: {e}")))
    }

    pub async fn balance_of(&self, account: Address) -> Result<U256> {
        self.contract
            .method::<_, U256>("balanceOf", account)
            .map_err(AaError::abi)?
            .call()
            .await
            .map_err(|e| AaError::Network(format!("entryPoint.balanceOf failed: {e}")))
    }

    /// On-chain `getUserOpHash`, used to cross-check the locally computed hash.
    pub async fn get_user_op_hash(&self, op: &UserOperation) -> Result<H256> {
        self.contract
            .method::<_, H256>("getUserOpHash", (op.clone(),))
            .map_err(AaError::abi)?
            .call()
            .await
            .map_err(|e| AaError::Network(format!("entryPoint.getUserOpHash failed: {e}")))
    }

    pub async fn deposit_to(&self, account: Address, value: U256) -> Result<TransactionReceipt> {
        let call = self
            .contract
            .method::<_, ()>("depositTo", account)
            .map_err(AaError::abi)?
            .value(value);
        send_and_confirm(call, "entryPoint.depositTo").await
    }

    pub fn handle_ops(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
    ) -> Result<ContractCall<M, ()>> {
        self.contract
            .method::<_, ()>("handleOps", (ops, beneficiary))
            .map_err(AaError::abi)
    }
}

#[derive(Debug, Clone)]
pub struct AccountFactory<M> {
    contract: Contract<M>,
}

impl<M: Middleware + 'static> AccountFactory<M> {
    pub fn new(address: Address, client: Arc<M>) -> Result<Self> {
        Ok(Self {
            contract: Contract::new(address, account_factory_abi()?, client),
        })
    }

    /// The factory's own view of the counterfactual address.
    pub async fn get_address(&self, owner: Address, salt: U256) -> Result<Address> {
        self.contract
            .method::<_, Address>("getAddress", (owner, salt))
            .map_err(AaError::abi)?
            .call()
            .await
            .map_err(|e| AaError::Network(format!("factory.getAddress failed: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct VerifyingPaymaster<M> {
    contract: Contract<M>,
}

impl<M: Middleware + 'static> VerifyingPaymaster<M> {
    pub fn new(address: Address, client: Arc<M>) -> Result<Self> {
        Ok(Self {
            contract: Contract::new(address, verifying_paymaster_abi()?, client),
        })
    }

    pub fn address(&self) -> Address {
        self.contract.address()
    }

    /// The hash the paymaster contract expects its signer to sign.
    pub async fn get_hash(
        &self,
        op: &UserOperation,
        valid_until: u64,
        valid_after: u64,
    ) -> Result<H256> {
        self.contract
            .method::<_, H256>("getHash", (op.clone(), valid_until, valid_after))
            .map_err(AaError::abi)?
            .call()
            .await
            .map_err(|e| AaError::Network(format!("paymaster.getHash failed: {e}")))
    }

    pub async fn add_stake(&self, unstake_delay_sec: u32, value: U256) -> Result<TransactionReceipt> {
        let call = self
            .contract
            .method::<_, ()>("addStake", unstake_delay_sec)
            .map_err(AaError::abi)?
            .value(value);
        send_and_confirm(call, "paymaster.addStake").await
    }

    pub async fn deposit(&self, value: U256) -> Result<TransactionReceipt> {
        let call = self
            .contract
            .method::<_, ()>("deposit", ())
            .map_err(AaError::abi)?
            .value(value);
        send_and_confirm(call, "paymaster.deposit").await
    }
}

async fn send_and_confirm<M: Middleware + 'static>(
    call: ContractCall<M, ()>,
    what: &str,
) -> Result<TransactionReceipt> {
    let pending = call
        .send()
        .await
        .map_err(|e| AaError::Network(format!("{what} failed: {e}")))?;

    let receipt = pending
        .await
        .map_err(|e| AaError::Network(format!("{what} receipt failed: {e}")))?
        .ok_or_else(|| AaError::Network(format!("{what} tx dropped from mempool")))?;

    tracing::info!(tx = ?receipt.transaction_hash, "{what} confirmed");
    Ok(receipt)
}
