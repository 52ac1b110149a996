//! Delivery of signed operations: straight to the EntryPoint, or via a relay.

use crate::contracts::EntryPoint;
use crate::error::{AaError, Result};
use crate::relay::RelayClient;
use crate::types::{SignedUserOperation, UserOperationReceipt};
use ethers::abi::{ParamType, Token};
use ethers::contract::ContractError;
use ethers::providers::{Middleware, MiddlewareError};
use ethers::types::{Address, TransactionReceipt, H256};
use ethers::utils::{id, keccak256};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

const USER_OPERATION_EVENT: &str =
    "UserOperationEvent(bytes32,address,address,uint256,bool,uint256,uint256)";

const FAILED_OP: &str = "FailedOp(uint256,string)";

/// How a signed operation reaches the chain.
#[derive(Debug, Clone)]
pub enum OperationSender<M> {
    Direct(DirectSender<M>),
    Relay(RelaySender),
}

impl<M: Middleware + 'static> OperationSender<M> {
    pub async fn send(&self, op: &SignedUserOperation) -> Result<UserOperationReceipt> {
        match self {
            Self::Direct(direct) => direct.send(op).await,
            Self::Relay(relay) => relay.send(op).await,
        }
    }

    pub fn entry_point(&self) -> Address {
        match self {
            Self::Direct(direct) => direct.entry_point.address(),
            Self::Relay(relay) => relay.entry_point,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Relay(_) => "relay",
        }
    }
}

/// Submits `handleOps([op], beneficiary)` from the client's own key.
#[derive(Debug, Clone)]
pub struct DirectSender<M> {
    client: Arc<M>,
    entry_point: EntryPoint<M>,
    beneficiary: Address,
    receipt_timeout: Duration,
    legacy: bool,
}

impl<M: Middleware + 'static> DirectSender<M> {
    pub fn new(client: Arc<M>, entry_point: Address, beneficiary: Address) -> Result<Self> {
        Ok(Self {
            entry_point: EntryPoint::new(entry_point, client.clone())?,
            client,
            beneficiary,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            legacy: false,
        })
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    /// Send type-0 transactions (chains without EIP-1559).
    pub fn with_legacy_transactions(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    pub async fn send(&self, op: &SignedUserOperation) -> Result<UserOperationReceipt> {
        let mut call = self
            .entry_point
            .handle_ops(vec![(**op).clone()], self.beneficiary)?;
        if self.legacy {
            call = call.legacy();
        }

        // Estimate up front so a revert keeps the node's error message.
        let gas = self
            .client
            .estimate_gas(&call.tx, None)
            .await
            .map_err(|e| node_rejection("handleOps estimation rejected", &e))?;
        call.tx.set_gas(gas);

        let pending = call.send().await.map_err(contract_rejection)?;
        let tx_hash = *pending;
        tracing::info!(tx = ?tx_hash, user_op_hash = ?op.user_op_hash(), "handleOps submitted");

        let receipt = tokio::time::timeout(self.receipt_timeout, pending)
            .await
            .map_err(|_| AaError::Timeout(self.receipt_timeout))?
            .map_err(|e| AaError::Network(format!("handleOps receipt failed: {e}")))?
            .ok_or_else(|| AaError::Network(format!("handleOps tx {tx_hash:?} dropped")))?;

        if receipt.status.map(|s| s.as_u64()) == Some(0) {
            return Err(AaError::rejected(format!(
                "handleOps tx {tx_hash:?} reverted"
            )));
        }

        let success = match user_operation_success(
            &receipt,
            self.entry_point.address(),
            op.user_op_hash(),
        ) {
            Some(success) => success,
            None => {
                tracing::warn!(
                    tx = ?tx_hash,
                    user_op_hash = ?op.user_op_hash(),
                    "no UserOperationEvent for this userOpHash; check chain id and entry point"
                );
                false
            }
        };
        let raw = serde_json::to_value(&receipt)
            .map_err(|e| AaError::Abi(format!("failed to encode receipt: {e}")))?;

        Ok(UserOperationReceipt {
            user_op_hash: op.user_op_hash(),
            transaction_hash: Some(receipt.transaction_hash),
            success,
            raw,
        })
    }
}

/// Submits through an ERC-4337 relay and polls it for the receipt.
#[derive(Debug, Clone)]
pub struct RelaySender {
    relay: RelayClient,
    entry_point: Address,
    receipt_timeout: Duration,
}

impl RelaySender {
    /// Fails unless the relay advertises `entry_point`.
    pub async fn connect(
        relay: RelayClient,
        entry_point: Address,
        receipt_timeout: Duration,
    ) -> Result<Self> {
        relay.ensure_entry_point_supported(entry_point).await?;
        Ok(Self {
            relay,
            entry_point,
            receipt_timeout,
        })
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    pub async fn send(&self, op: &SignedUserOperation) -> Result<UserOperationReceipt> {
        let hash = self.relay.send_user_operation(op, self.entry_point).await?;
        if hash != op.user_op_hash() {
            tracing::warn!(
                relay_hash = ?hash,
                local_hash = ?op.user_op_hash(),
                "relay returned a different userOpHash"
            );
        }
        tracing::info!(user_op_hash = ?hash, relay = %self.relay.url(), "user operation accepted");

        self.relay
            .wait_user_operation_receipt(hash, self.receipt_timeout)
            .await
    }
}

/// `SubmissionRejected` carrying the node's JSON-RPC code and message.
fn node_rejection<E: MiddlewareError>(context: &str, e: &E) -> AaError {
    let Some(rpc) = e.as_error_response() else {
        return AaError::rejected(format!("{context}: {e}"));
    };
    let mut message = format!("{context}: {}", rpc.message);
    if let Some(reason) = rpc.as_revert_data().and_then(|data| failed_op_reason(&data)) {
        message = format!("{message} [{reason}]");
    }
    AaError::SubmissionRejected {
        code: Some(rpc.code),
        message,
    }
}

fn contract_rejection<M: Middleware>(e: ContractError<M>) -> AaError {
    if let Some(inner) = e.as_middleware_error() {
        return node_rejection("handleOps rejected", inner);
    }
    match e.as_revert().and_then(|data| failed_op_reason(data)) {
        Some(reason) => AaError::rejected(format!("handleOps reverted: {reason}")),
        None => AaError::rejected(format!("handleOps rejected: {e}")),
    }
}

/// Decodes the EntryPoint's `FailedOp(opIndex, reason)` revert.
fn failed_op_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 || data[..4] != id(FAILED_OP) {
        return None;
    }
    let tokens = ethers::abi::decode(&[ParamType::Uint(256), ParamType::String], &data[4..]).ok()?;
    match tokens.as_slice() {
        [Token::Uint(index), Token::String(reason)] => Some(format!("op {index}: {reason}")),
        _ => None,
    }
}

/// Execution outcome recorded in the EntryPoint's `UserOperationEvent` for `user_op_hash`.
fn user_operation_success(
    receipt: &TransactionReceipt,
    entry_point: Address,
    user_op_hash: H256,
) -> Option<bool> {
    let topic = H256::from(keccak256(USER_OPERATION_EVENT));
    receipt
        .logs
        .iter()
        .find(|log| {
            log.address == entry_point
                && log.topics.first() == Some(&topic)
                && log.topics.get(1) == Some(&user_op_hash)
        })
        .and_then(|log| log.data.get(32..64))
        .map(|word| word.iter().any(|b| *b != 0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testutil::{mock_rpc, provider, rpc_err};
    use crate::types::UserOperation;
    use ethers::providers::{Http, Provider};
    use ethers::types::{Bytes, Log, U256};
    use serde_json::{json, Value};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const EP: Address = Address::repeat_byte(0x5f);
    const BENEFICIARY: Address = Address::repeat_byte(0xbe);
    const FROM: Address = Address::repeat_byte(0xf0);
    const TX_HASH: &str = "0x7777777777777777777777777777777777777777777777777777777777777777";

    fn signed() -> SignedUserOperation {
        SignedUserOperation::new(
            UserOperation {
                sender: Address::repeat_byte(0xac),
                signature: Bytes::from(vec![1u8; 65]),
                ..Default::default()
            },
            H256::repeat_byte(0x11),
        )
    }

    fn event_log(user_op_hash: H256, success: bool) -> Log {
        let mut data = vec![0u8; 128];
        data[63] = success as u8;
        Log {
            address: EP,
            topics: vec![
                H256::from(keccak256(USER_OPERATION_EVENT)),
                user_op_hash,
                H256::repeat_byte(0xac),
                H256::zero(),
            ],
            data: Bytes::from(data),
            ..Default::default()
        }
    }

    /// JSON for a mined transaction and its receipt carrying `logs`.
    pub(crate) fn mined(logs: Value, status: &str) -> (Value, Value) {
        let tx = json!({
            "hash": TX_HASH,
            "nonce": "0x0",
            "blockHash": format!("0x{}", "ab".repeat(32)),
            "blockNumber": "0x2a",
            "transactionIndex": "0x0",
            "from": format!("{FROM:?}"),
            "to": format!("{EP:?}"),
            "value": "0x0",
            "gasPrice": "0x3b9aca00",
            "gas": "0x7a120",
            "input": "0x",
            "v": "0x1b",
            "r": "0x1",
            "s": "0x1"
        });
        let receipt = json!({
            "transactionHash": TX_HASH,
            "transactionIndex": "0x0",
            "blockHash": format!("0x{}", "ab".repeat(32)),
            "blockNumber": "0x2a",
            "from": format!("{FROM:?}"),
            "to": format!("{EP:?}"),
            "cumulativeGasUsed": "0x5208",
            "gasUsed": "0x5208",
            "contractAddress": null,
            "logs": logs,
            "status": status,
            "logsBloom": format!("0x{}", "00".repeat(256)),
            "effectiveGasPrice": "0x3b9aca00"
        });
        (tx, receipt)
    }

    pub(crate) async fn mount_direct_chain(server: &MockServer, logs: Value, status: &str) {
        let (tx, receipt) = mined(logs, status);
        mock_rpc(server, json!({ "method": "eth_gasPrice" }), json!("0x3b9aca00")).await;
        mock_rpc(server, json!({ "method": "eth_estimateGas" }), json!("0x7a120")).await;
        mock_rpc(server, json!({ "method": "eth_sendTransaction" }), json!(TX_HASH)).await;
        mock_rpc(server, json!({ "method": "eth_getTransactionByHash" }), tx).await;
        mock_rpc(server, json!({ "method": "eth_getTransactionReceipt" }), receipt).await;
        mock_rpc(server, json!({ "method": "eth_blockNumber" }), json!("0x2a")).await;
    }

    fn direct(server: &MockServer) -> DirectSender<Provider<Http>> {
        let client = provider(server).interval(Duration::from_millis(10));
        DirectSender::new(Arc::new(client), EP, BENEFICIARY)
            .unwrap()
            .with_legacy_transactions(true)
            .with_receipt_timeout(Duration::from_secs(5))
    }

    #[test]
    fn event_flag_is_read_for_matching_hash_only() {
        let hash = H256::repeat_byte(0x11);
        let receipt = TransactionReceipt {
            logs: vec![event_log(H256::repeat_byte(0x22), true), event_log(hash, false)],
            ..Default::default()
        };
        assert_eq!(user_operation_success(&receipt, EP, hash), Some(false));
        assert_eq!(user_operation_success(&receipt, EP, H256::repeat_byte(0x33)), None);
        assert_eq!(
            user_operation_success(&receipt, Address::repeat_byte(0x01), hash),
            None
        );
    }

    #[tokio::test]
    async fn direct_send_returns_receipt() {
        let server = MockServer::start().await;
        let log = serde_json::to_value(event_log(H256::repeat_byte(0x11), true)).unwrap();
        mount_direct_chain(&server, json!([log]), "0x1").await;

        let receipt = direct(&server).send(&signed()).await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.user_op_hash, H256::repeat_byte(0x11));
        assert_eq!(receipt.transaction_hash, Some(TX_HASH.parse().unwrap()));
        assert_eq!(receipt.raw["status"], json!("0x1"));
    }

    #[tokio::test]
    async fn inner_failure_is_reported_not_raised() {
        let server = MockServer::start().await;
        let log = serde_json::to_value(event_log(H256::repeat_byte(0x11), false)).unwrap();
        mount_direct_chain(&server, json!([log]), "0x1").await;

        let receipt = direct(&server).send(&signed()).await.unwrap();
        assert!(!receipt.success);
    }

    #[tokio::test]
    async fn reverted_handle_ops_is_rejected() {
        let server = MockServer::start().await;
        mount_direct_chain(&server, json!([]), "0x0").await;

        let err = direct(&server).send(&signed()).await.unwrap_err();
        assert!(matches!(err, AaError::SubmissionRejected { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn estimate_revert_is_rejected() {
        let server = MockServer::start().await;
        mock_rpc(&server, json!({ "method": "eth_gasPrice" }), json!("0x3b9aca00")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_estimateGas" })))
            .respond_with(rpc_err(-32000, "execution reverted: AA21 didn't pay prefund"))
            .mount(&server)
            .await;

        let err = direct(&server).send(&signed()).await.unwrap_err();
        match err {
            AaError::SubmissionRejected { code, message } => {
                assert_eq!(code, Some(-32000));
                assert!(message.contains("AA21"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_op_revert_reason_is_decoded() {
        let mut data = id(FAILED_OP).to_vec();
        data.extend(ethers::abi::encode(&[
            Token::Uint(U256::zero()),
            Token::String("AA23 reverted (or OOG)".into()),
        ]));

        let server = MockServer::start().await;
        mock_rpc(&server, json!({ "method": "eth_gasPrice" }), json!("0x3b9aca00")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_estimateGas" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {
                    "code": 3,
                    "message": "execution reverted",
                    "data": format!("0x{}", hex::encode(&data))
                }
            })))
            .mount(&server)
            .await;

        let err = direct(&server).send(&signed()).await.unwrap_err();
        match err {
            AaError::SubmissionRejected { code, message } => {
                assert_eq!(code, Some(3));
                assert!(message.contains("op 0: AA23 reverted (or OOG)"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn failed_op_needs_its_selector() {
        assert_eq!(failed_op_reason(&[]), None);
        assert_eq!(failed_op_reason(&[0x08, 0xc3, 0x79, 0xa0]), None);
    }

    #[tokio::test]
    async fn missing_event_is_not_reported_as_success() {
        let server = MockServer::start().await;
        let other = serde_json::to_value(event_log(H256::repeat_byte(0x22), true)).unwrap();
        mount_direct_chain(&server, json!([other]), "0x1").await;

        let receipt = direct(&server).send(&signed()).await.unwrap();
        assert!(!receipt.success);
        assert_eq!(receipt.transaction_hash, Some(TX_HASH.parse().unwrap()));
    }

    #[tokio::test]
    async fn relay_connect_checks_entry_point() {
        let server = MockServer::start().await;
        mock_rpc(
            &server,
            json!({ "method": "eth_supportedEntryPoints" }),
            json!([format!("{:?}", Address::repeat_byte(0x01))]),
        )
        .await;

        let err = RelaySender::connect(RelayClient::new(server.uri()), EP, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AaError::EntryPointUnsupported { .. }));
    }

    #[tokio::test]
    async fn relay_send_polls_for_receipt() {
        let server = MockServer::start().await;
        let hash = format!("{:?}", H256::repeat_byte(0x11));
        mock_rpc(
            &server,
            json!({ "method": "eth_supportedEntryPoints" }),
            json!([format!("{EP:?}")]),
        )
        .await;
        mock_rpc(&server, json!({ "method": "eth_sendUserOperation" }), json!(hash)).await;
        mock_rpc(
            &server,
            json!({ "method": "eth_getUserOperationReceipt" }),
            json!({
                "userOpHash": hash,
                "success": true,
                "receipt": { "transactionHash": TX_HASH }
            }),
        )
        .await;

        let relay = RelayClient::new(server.uri()).with_poll_interval(Duration::from_millis(10));
        let sender: OperationSender<Provider<Http>> = OperationSender::Relay(
            RelaySender::connect(relay, EP, Duration::from_secs(2)).await.unwrap(),
        );
        assert_eq!(sender.kind(), "relay");
        assert_eq!(sender.entry_point(), EP);

        let receipt = sender.send(&signed()).await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.transaction_hash, Some(TX_HASH.parse().unwrap()));
        assert_eq!(receipt.user_op_hash, H256::repeat_byte(0x11));
    }
}
