use crate::contracts;
use crate::error::{AaError, Result};
use crate::relay::RelayClient;
use crate::types::{
    AccountState, Call, GasLimits, PaymasterAndData, UnsignedUserOperation, UserOperation,
};
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;

/// Where gas limits come from.
#[derive(Debug, Clone)]
pub enum GasSource {
    /// Use these limits as-is (local/dev networks without a bundler).
    Fixed(GasLimits),
    /// Ask the relay via `eth_estimateUserOperationGas`.
    Relay(RelayClient),
}

#[derive(Debug, Clone)]
pub struct GasPolicy {
    pub source: GasSource,
    /// Applied to the node gas price for both fee fields (10_000 = 1x).
    pub fee_multiplier_bps: u64,
}

impl GasPolicy {
    pub fn fixed(limits: GasLimits) -> Self {
        Self {
            source: GasSource::Fixed(limits),
            fee_multiplier_bps: 10_000,
        }
    }

    pub fn relay(relay: RelayClient) -> Self {
        Self {
            source: GasSource::Relay(relay),
            fee_multiplier_bps: 10_000,
        }
    }

    pub fn with_fee_multiplier_bps(mut self, bps: u64) -> Self {
        self.fee_multiplier_bps = bps;
        self
    }
}

/// A signature that recovers to *some* address, so account validation runs
/// to completion during estimation instead of reverting on a malformed sig.
pub fn dummy_signature() -> Bytes {
    let mut sig = Vec::with_capacity(65);
    sig.extend_from_slice(&[0xff; 15]);
    sig.push(0xf0);
    sig.extend_from_slice(&[0x00; 16]);
    sig.push(0x7a);
    sig.extend_from_slice(&[0xaa; 31]);
    sig.push(0x1c);
    Bytes::from(sig)
}

/// Placeholder paymaster field with the final layout, used only while estimating.
pub fn sponsor_stub(paymaster: Address) -> Bytes {
    PaymasterAndData {
        paymaster,
        valid_until: 0,
        valid_after: 0,
        signature: dummy_signature(),
    }
    .encode()
}

/// Assembles unsigned operations for one (factory, owner, salt) account.
#[derive(Debug, Clone)]
pub struct UserOperationBuilder<M> {
    client: Arc<M>,
    entry_point: Address,
    factory: Address,
    owner: Address,
    salt: U256,
}

impl<M: Middleware + 'static> UserOperationBuilder<M> {
    pub fn new(
        client: Arc<M>,
        entry_point: Address,
        factory: Address,
        owner: Address,
        salt: U256,
    ) -> Self {
        Self {
            client,
            entry_point,
            factory,
            owner,
            salt,
        }
    }

    /// Builds the operation for `call` from the freshly observed `state`.
    ///
    /// `sponsor` is the paymaster that will authorize the operation, if any;
    /// estimation then runs with a stub paymaster field. The returned
    /// operation carries an empty paymaster field and an empty signature.
    pub async fn build(
        &self,
        state: &AccountState,
        call: &Call,
        gas: &GasPolicy,
        sponsor: Option<Address>,
    ) -> Result<UnsignedUserOperation> {
        let init_code = if state.deployed {
            Bytes::default()
        } else {
            contracts::encode_init_code(self.factory, self.owner, self.salt)?
        };
        let call_data = contracts::encode_execute(call.to, call.value, call.data.clone())?;

        let (max_fee_per_gas, max_priority_fee_per_gas) = self.fees(gas.fee_multiplier_bps).await?;

        let mut op = UserOperation {
            sender: state.address,
            nonce: state.nonce,
            init_code,
            call_data,
            call_gas_limit: U256::zero(),
            verification_gas_limit: U256::zero(),
            pre_verification_gas: U256::zero(),
            max_fee_per_gas,
            max_priority_fee_per_gas,
            paymaster_and_data: sponsor.map(sponsor_stub).unwrap_or_default(),
            signature: dummy_signature(),
        };

        let limits = match &gas.source {
            GasSource::Fixed(limits) => *limits,
            GasSource::Relay(relay) => {
                relay
                    .estimate_user_operation_gas(&op, self.entry_point)
                    .await?
            }
        };
        if limits.any_zero() {
            return Err(AaError::EstimationFailed(format!(
                "zero gas limit in {limits:?}"
            )));
        }

        op.call_gas_limit = limits.call_gas_limit;
        op.verification_gas_limit = limits.verification_gas_limit;
        op.pre_verification_gas = limits.pre_verification_gas;
        op.paymaster_and_data = Bytes::default();
        op.signature = Bytes::default();

        tracing::info!(
            sender = ?op.sender,
            nonce = %op.nonce,
            deploy = !state.deployed,
            call_gas = %op.call_gas_limit,
            verification_gas = %op.verification_gas_limit,
            pre_verification_gas = %op.pre_verification_gas,
            "built user operation"
        );

        Ok(UnsignedUserOperation::new(op))
    }

    async fn fees(&self, multiplier_bps: u64) -> Result<(U256, U256)> {
        if multiplier_bps == 0 {
            return Err(AaError::Config("gas multiplier must be at least 1 bps".into()));
        }
        // Fee data (gas price for providers without EIP-1559 helpers).
        let gas_price = self
            .client
            .get_gas_price()
            .await
            .map_err(|e| AaError::EstimationFailed(format!("failed to fetch gas price: {e}")))?;
        let fee = gas_price * U256::from(multiplier_bps) / U256::from(10_000u64);

        if multiplier_bps != 10_000 {
            tracing::debug!(bps = multiplier_bps, %gas_price, %fee, "gas multiplier applied");
        }
        Ok((fee, fee))
    }
}
