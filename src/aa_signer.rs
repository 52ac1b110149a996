//! The account-abstraction signer: one object that turns a call into a
//! confirmed user operation.

use crate::address::AddressResolver;
use crate::builder::{GasPolicy, UserOperationBuilder};
use crate::config::ClientConfig;
use crate::contracts::EntryPoint;
use crate::error::{AaError, Result};
use crate::paymaster::PaymasterAuthorizer;
use crate::sender::OperationSender;
use crate::signer::OperationSigner;
use crate::types::{AccountState, Call, SignedUserOperation, UserOperationReceipt};
use ethers::providers::Middleware;
use ethers::signers::LocalWallet;
use ethers::types::Address;
use std::fmt;
use std::sync::Arc;

/// Pipeline position of the signer, for logs and inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Uninitialized,
    Resolved,
    Undeployed,
    Deployed,
    Building,
    PaymasterAuthorizing,
    Signing,
    Submitting,
    Confirmed,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Uninitialized => "uninitialized",
            Stage::Resolved => "resolved",
            Stage::Undeployed => "undeployed",
            Stage::Deployed => "deployed",
            Stage::Building => "building",
            Stage::PaymasterAuthorizing => "paymaster_authorizing",
            Stage::Signing => "signing",
            Stage::Submitting => "submitting",
            Stage::Confirmed => "confirmed",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends calls through a counterfactual smart account owned by a local key.
///
/// Methods that touch the pipeline take `&mut self`, so a single instance
/// never has two operations in flight. Deployment status and nonce are read
/// from the chain before every operation; only the account address is
/// remembered once resolved.
///
/// Funding the account (or the paymaster deposit) is the caller's job; see
/// the `deposit` and `fund` helpers of the CLI.
#[derive(Debug)]
pub struct AaSigner<M> {
    client: Arc<M>,
    config: ClientConfig,
    resolver: AddressResolver<M>,
    entry_point: EntryPoint<M>,
    builder: UserOperationBuilder<M>,
    signer: OperationSigner,
    sender: OperationSender<M>,
    gas: GasPolicy,
    address: Option<Address>,
    stage: Stage,
    last_operation: Option<SignedUserOperation>,
}

impl<M: Middleware + 'static> AaSigner<M> {
    pub fn new(
        client: Arc<M>,
        config: ClientConfig,
        owner: LocalWallet,
        resolver: AddressResolver<M>,
        sender: OperationSender<M>,
        gas: GasPolicy,
    ) -> Result<Self> {
        if sender.entry_point() != config.entry_point {
            return Err(AaError::Config(format!(
                "{} sender targets entry point {:?}, configured {:?}",
                sender.kind(),
                sender.entry_point(),
                config.entry_point
            )));
        }

        let signer = OperationSigner::new(owner, config.entry_point, config.chain_id);
        let builder = UserOperationBuilder::new(
            client.clone(),
            config.entry_point,
            config.factory,
            signer.address(),
            config.salt,
        );

        Ok(Self {
            entry_point: EntryPoint::new(config.entry_point, client.clone())?,
            client,
            config,
            resolver,
            builder,
            signer,
            sender,
            gas,
            address: None,
            stage: Stage::Uninitialized,
            last_operation: None,
        })
    }

    pub fn owner(&self) -> Address {
        self.signer.address()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The most recent operation that made it through signing.
    pub fn last_operation(&self) -> Option<&SignedUserOperation> {
        self.last_operation.as_ref()
    }

    /// Counterfactual account address; resolved once, then remembered.
    pub async fn get_address(&mut self) -> Result<Address> {
        if let Some(address) = self.address {
            return Ok(address);
        }

        let address = self
            .resolver
            .resolve(self.config.factory, self.owner(), self.config.salt)
            .await?;
        if address.is_zero() {
            return Err(AaError::InvalidAddress {
                field: "account",
                value: format!("{address:?}"),
            });
        }

        tracing::info!(account = ?address, owner = ?self.owner(), salt = %self.config.salt, "resolved account");
        self.address = Some(address);
        self.advance(Stage::Resolved);
        Ok(address)
    }

    /// Reads deployment status and nonce from the chain.
    pub async fn account_state(&mut self) -> Result<AccountState> {
        let address = self.get_address().await?;

        let code = self
            .client
            .get_code(address, None)
            .await
            .map_err(|e| AaError::Network(format!("eth_getCode failed: {e}")))?;
        let deployed = !code.as_ref().is_empty();
        let nonce = self.entry_point.get_nonce(address).await?;

        self.advance(if deployed {
            Stage::Deployed
        } else {
            Stage::Undeployed
        });
        Ok(AccountState {
            address,
            deployed,
            nonce,
        })
    }

    /// Runs every stage up to and including signing. Nothing is submitted.
    pub async fn build_signed(
        &mut self,
        call: &Call,
        paymaster: Option<&PaymasterAuthorizer<M>>,
    ) -> Result<SignedUserOperation> {
        match self.prepare(call, paymaster).await {
            Ok(op) => Ok(op),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Builds, optionally sponsors, signs and submits `call`, then waits for its receipt.
    pub async fn send_transaction(
        &mut self,
        call: &Call,
        paymaster: Option<&PaymasterAuthorizer<M>>,
    ) -> Result<UserOperationReceipt> {
        let op = self.build_signed(call, paymaster).await?;

        self.advance(Stage::Submitting);
        match self.sender.send(&op).await {
            Ok(receipt) => {
                self.advance(Stage::Confirmed);
                tracing::info!(
                    user_op_hash = ?receipt.user_op_hash,
                    tx = ?receipt.transaction_hash,
                    success = receipt.success,
                    "user operation included"
                );
                Ok(receipt)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn prepare(
        &mut self,
        call: &Call,
        paymaster: Option<&PaymasterAuthorizer<M>>,
    ) -> Result<SignedUserOperation> {
        if let Some(pm) = paymaster {
            if pm.signer_address() == self.owner() {
                return Err(AaError::UnsupportedOperation(
                    "paymaster key cannot sign as the account owner",
                ));
            }
        }

        let state = self.account_state().await?;

        self.advance(Stage::Building);
        let mut op = self
            .builder
            .build(&state, call, &self.gas, paymaster.map(|pm| pm.address()))
            .await?;

        if let Some(pm) = paymaster {
            self.advance(Stage::PaymasterAuthorizing);
            pm.authorize(&mut op).await?;
        }

        self.advance(Stage::Signing);
        let signed = self.signer.sign(op).await?;
        self.last_operation = Some(signed.clone());
        Ok(signed)
    }

    fn advance(&mut self, stage: Stage) {
        tracing::debug!(from = %self.stage, to = %stage, "stage");
        self.stage = stage;
    }

    fn fail(&mut self, error: &AaError) {
        tracing::warn!(stage = %self.stage, error = %error, "user operation failed");
        self.stage = Stage::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ProxyTemplate;
    use crate::paymaster::{PaymasterSigner, DEFAULT_VALIDITY_WINDOW};
    use crate::relay::RelayClient;
    use crate::sender::tests::mount_direct_chain;
    use crate::sender::{DirectSender, RelaySender};
    use crate::testutil::{
        block_json, mock_rpc, provider, rpc_ok, wallet, word, OWNER_KEY, PAYMASTER_KEY,
    };
    use crate::types::{recover_personal, GasLimits, PaymasterAndData};
    use ethers::providers::{Http, Provider};
    use ethers::types::{Bytes, H256, U256};
    use ethers::utils::id;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer};

    const EP: Address = Address::repeat_byte(0x5f);
    const FACTORY: Address = Address::repeat_byte(0x9a);
    const PAYMASTER: Address = Address::repeat_byte(0x33);
    const BENEFICIARY: Address = Address::repeat_byte(0xbe);
    const DEST: Address = Address::repeat_byte(0xde);
    const CHAIN_ID: u64 = 31337;
    const NOW: u64 = 1_700_000_000;

    fn lower(a: Address) -> String {
        format!("{a:?}")
    }

    fn config() -> ClientConfig {
        ClientConfig {
            chain_id: CHAIN_ID,
            entry_point: EP,
            factory: FACTORY,
            salt: U256::zero(),
        }
    }

    fn template() -> ProxyTemplate {
        ProxyTemplate {
            creation_code: Bytes::from(vec![0x60, 0x80, 0x60, 0x40, 0x52]),
            implementation: Address::repeat_byte(0x42),
        }
    }

    fn limits() -> GasLimits {
        GasLimits {
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(500_000),
            pre_verification_gas: U256::from(50_000),
        }
    }

    fn client(server: &MockServer) -> Arc<Provider<Http>> {
        Arc::new(provider(server).interval(Duration::from_millis(10)))
    }

    /// gas price, nonce 0 and the latest block.
    async fn mount_node(server: &MockServer) {
        mock_rpc(server, json!({ "method": "eth_gasPrice" }), json!("0x3b9aca00")).await;
        mock_rpc(
            server,
            json!({ "method": "eth_call", "params": [{ "to": lower(EP) }] }),
            json!(word("0")),
        )
        .await;
        mock_rpc(
            server,
            json!({ "method": "eth_getBlockByNumber" }),
            block_json(42, NOW),
        )
        .await;
    }

    async fn mount_code(server: &MockServer, code: &str) {
        mock_rpc(server, json!({ "method": "eth_getCode" }), json!(code)).await;
    }

    async fn mount_relay(server: &MockServer, entry_points: Vec<Address>) {
        let eps: Vec<String> = entry_points.into_iter().map(lower).collect();
        mock_rpc(server, json!({ "method": "eth_supportedEntryPoints" }), json!(eps)).await;
        mock_rpc(
            server,
            json!({ "method": "eth_estimateUserOperationGas" }),
            json!({
                "callGasLimit": "0x186a0",
                "verificationGasLimit": "0x7a120",
                "preVerificationGas": "0xc350"
            }),
        )
        .await;
        mock_rpc(
            server,
            json!({ "method": "eth_sendUserOperation" }),
            json!(format!("{:?}", H256::repeat_byte(0x11))),
        )
        .await;
        mock_rpc(
            server,
            json!({ "method": "eth_getUserOperationReceipt" }),
            json!({ "success": true, "receipt": { "transactionHash": format!("{:?}", H256::repeat_byte(0x77)) } }),
        )
        .await;
    }

    async fn relay_signer(server: &MockServer) -> Result<AaSigner<Provider<Http>>> {
        let relay = RelayClient::new(server.uri()).with_poll_interval(Duration::from_millis(10));
        let sender = RelaySender::connect(relay.clone(), EP, Duration::from_secs(2)).await?;
        AaSigner::new(
            client(server),
            config(),
            wallet(OWNER_KEY),
            AddressResolver::Create2(template()),
            OperationSender::Relay(sender),
            GasPolicy::relay(relay),
        )
    }

    fn direct_signer(server: &MockServer) -> AaSigner<Provider<Http>> {
        let client = client(server);
        let sender = DirectSender::new(client.clone(), EP, BENEFICIARY)
            .unwrap()
            .with_legacy_transactions(true)
            .with_receipt_timeout(Duration::from_secs(5));
        AaSigner::new(
            client,
            config(),
            wallet(OWNER_KEY),
            AddressResolver::Create2(template()),
            OperationSender::Direct(sender),
            GasPolicy::fixed(limits()),
        )
        .unwrap()
    }

    fn authorizer(server: &MockServer) -> PaymasterAuthorizer<Provider<Http>> {
        PaymasterAuthorizer::new(
            client(server),
            PAYMASTER,
            PaymasterSigner::new(wallet(PAYMASTER_KEY)),
        )
        .unwrap()
    }

    async fn requests_for(server: &MockServer, rpc_method: &str) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .filter(|body| body["method"] == rpc_method)
            .collect()
    }

    #[tokio::test]
    async fn undeployed_then_deployed_via_relay() {
        let server = MockServer::start().await;
        mount_node(&server).await;
        mount_relay(&server, vec![EP]).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getCode" })))
            .respond_with(rpc_ok(json!("0x")))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        mount_code(&server, "0x6080").await;

        let mut aa = relay_signer(&server).await.unwrap();
        let call = Call::new(DEST).value(U256::from(1000));

        let first = aa.send_transaction(&call, None).await.unwrap();
        assert!(first.success);
        assert_eq!(aa.stage(), Stage::Confirmed);
        let op = aa.last_operation().unwrap();
        assert_eq!(&op.init_code[..20], FACTORY.as_bytes());
        assert!(op.paymaster_and_data.is_empty());
        assert_eq!(recover_personal(op.user_op_hash(), &op.signature).unwrap(), aa.owner());

        aa.send_transaction(&call, None).await.unwrap();
        assert!(aa.last_operation().unwrap().init_code.is_empty());

        let sent = requests_for(&server, "eth_sendUserOperation").await;
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0]["params"][0]["initCode"], json!("0x"));
        assert_eq!(sent[1]["params"][0]["initCode"], json!("0x"));
        assert_eq!(sent[0]["params"][1], json!(lower(EP)));
    }

    #[tokio::test]
    async fn undeployed_direct_send_calls_handle_ops() {
        let server = MockServer::start().await;
        mount_node(&server).await;
        mount_code(&server, "0x").await;
        mount_direct_chain(&server, json!([]), "0x1").await;

        let mut aa = direct_signer(&server);
        let receipt = aa
            .send_transaction(&Call::new(DEST).value(U256::from(1)), None)
            .await
            .unwrap();

        assert!(receipt.success);
        assert!(receipt.transaction_hash.is_some());
        assert!(!aa.last_operation().unwrap().init_code.is_empty());

        let txs = requests_for(&server, "eth_sendTransaction").await;
        assert_eq!(txs.len(), 1);
        let input = txs[0]["params"][0]["data"]
            .as_str()
            .or_else(|| txs[0]["params"][0]["input"].as_str())
            .unwrap()
            .to_string();
        assert!(input.starts_with(&format!("0x{}", hex::encode(id(
            "handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)[],address)"
        )))));
    }

    #[tokio::test]
    async fn sponsored_operation_carries_paymaster_window() {
        let server = MockServer::start().await;
        mount_node(&server).await;
        mount_code(&server, "0x6080").await;
        mount_direct_chain(&server, json!([]), "0x1").await;
        let pm_hash = "ab".repeat(32);
        mock_rpc(
            &server,
            json!({ "method": "eth_call", "params": [{ "to": lower(PAYMASTER) }] }),
            json!(word(&pm_hash)),
        )
        .await;

        let mut aa = direct_signer(&server);
        let pm = authorizer(&server);
        aa.send_transaction(&Call::new(DEST), Some(&pm)).await.unwrap();

        let op = aa.last_operation().unwrap();
        assert!(op.init_code.is_empty());

        let data = PaymasterAndData::decode(&op.paymaster_and_data).unwrap();
        assert_eq!(data.paymaster, PAYMASTER);
        assert_eq!(data.valid_until - data.valid_after, DEFAULT_VALIDITY_WINDOW);
        assert!(data.valid_after <= NOW && NOW < data.valid_until);

        let hash: H256 = format!("0x{pm_hash}").parse().unwrap();
        assert_eq!(recover_personal(hash, &data.signature).unwrap(), pm.signer_address());

        // owner signed over the final paymaster field
        assert_eq!(op.user_op_hash(), op.hash(EP, CHAIN_ID));
        assert_eq!(recover_personal(op.user_op_hash(), &op.signature).unwrap(), aa.owner());
    }

    #[tokio::test]
    async fn unsupported_entry_point_fails_before_building() {
        let server = MockServer::start().await;
        mount_node(&server).await;
        mount_code(&server, "0x").await;
        mount_relay(&server, vec![Address::repeat_byte(0x01)]).await;

        let err = relay_signer(&server).await.unwrap_err();
        assert!(matches!(err, AaError::EntryPointUnsupported { .. }), "{err:?}");

        let methods: Vec<Value> = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
            .map(|body| body["method"].clone())
            .collect();
        assert_eq!(methods, vec![json!("eth_supportedEntryPoints")]);
    }

    #[tokio::test]
    async fn owner_key_cannot_double_as_paymaster() {
        let server = MockServer::start().await;
        let mut aa = direct_signer(&server);
        let pm = PaymasterAuthorizer::new(
            client(&server),
            PAYMASTER,
            PaymasterSigner::new(wallet(OWNER_KEY)),
        )
        .unwrap();

        let err = aa.send_transaction(&Call::new(DEST), Some(&pm)).await.unwrap_err();
        assert!(matches!(err, AaError::UnsupportedOperation(_)), "{err:?}");
        assert_eq!(aa.stage(), Stage::Failed);
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn estimation_failure_submits_nothing() {
        let server = MockServer::start().await;
        mount_node(&server).await;
        mount_code(&server, "0x6080").await;
        mock_rpc(
            &server,
            json!({ "method": "eth_supportedEntryPoints" }),
            json!([lower(EP)]),
        )
        .await;
        mock_rpc(
            &server,
            json!({ "method": "eth_estimateUserOperationGas" }),
            json!({
                "callGasLimit": "0x0",
                "verificationGasLimit": "0x7a120",
                "preVerificationGas": "0xc350"
            }),
        )
        .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_sendUserOperation" })))
            .respond_with(rpc_ok(json!(format!("{:?}", H256::zero()))))
            .expect(0)
            .mount(&server)
            .await;

        let mut aa = relay_signer(&server).await.unwrap();
        let err = aa.send_transaction(&Call::new(DEST), None).await.unwrap_err();
        assert!(matches!(err, AaError::EstimationFailed(_)), "{err:?}");
        assert_eq!(aa.stage(), Stage::Failed);
        assert!(aa.last_operation().is_none());
    }

    #[tokio::test]
    async fn factory_address_is_resolved_once() {
        let server = MockServer::start().await;
        let account = Address::repeat_byte(0xac);
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "eth_call",
                "params": [{ "to": lower(FACTORY) }]
            })))
            .respond_with(rpc_ok(json!(word(&hex::encode(account)))))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let sender = DirectSender::new(client.clone(), EP, BENEFICIARY).unwrap();
        let mut aa = AaSigner::new(
            client.clone(),
            config(),
            wallet(OWNER_KEY),
            AddressResolver::Factory(client),
            OperationSender::Direct(sender),
            GasPolicy::fixed(limits()),
        )
        .unwrap();

        assert_eq!(aa.get_address().await.unwrap(), account);
        assert_eq!(aa.get_address().await.unwrap(), account);
        assert_eq!(aa.stage(), Stage::Resolved);
    }

    #[test]
    fn sender_must_target_configured_entry_point() {
        let client = Arc::new(Provider::<Http>::try_from("http://127.0.0.1:1").unwrap());
        let sender = DirectSender::new(client.clone(), Address::repeat_byte(0x01), BENEFICIARY).unwrap();
        let err = AaSigner::new(
            client,
            config(),
            wallet(OWNER_KEY),
            AddressResolver::Create2(template()),
            OperationSender::Direct(sender),
            GasPolicy::fixed(limits()),
        )
        .unwrap_err();
        assert!(matches!(err, AaError::Config(_)));
    }
}
