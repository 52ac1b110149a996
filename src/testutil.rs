//! Shared fixtures: well-known dev keys and a wiremock JSON-RPC node.

use ethers::providers::{Http, Provider};
use ethers::signers::LocalWallet;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub(crate) const OWNER_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub(crate) const PAYMASTER_KEY: &str =
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

pub(crate) fn wallet(key: &str) -> LocalWallet {
    key.parse().unwrap()
}

pub(crate) fn rpc_ok(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
}

pub(crate) fn rpc_err(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": { "code": code, "message": message }
    }))
}

/// Answers every request whose body includes `matcher` with `result`.
pub(crate) async fn mock_rpc(server: &MockServer, matcher: Value, result: Value) {
    Mock::given(method("POST"))
        .and(body_partial_json(matcher))
        .respond_with(rpc_ok(result))
        .mount(server)
        .await;
}

pub(crate) fn provider(server: &MockServer) -> Provider<Http> {
    Provider::<Http>::try_from(server.uri().as_str()).unwrap()
}

pub(crate) fn word(hex_body: &str) -> String {
    format!("0x{hex_body:0>64}")
}

pub(crate) fn block_json(number: u64, timestamp: u64) -> Value {
    json!({
        "number": format!("0x{number:x}"),
        "hash": format!("0x{}", "ab".repeat(32)),
        "parentHash": format!("0x{}", "cd".repeat(32)),
        "sha3Uncles": format!("0x{}", "00".repeat(32)),
        "miner": format!("0x{}", "00".repeat(20)),
        "stateRoot": format!("0x{}", "00".repeat(32)),
        "transactionsRoot": format!("0x{}", "00".repeat(32)),
        "receiptsRoot": format!("0x{}", "00".repeat(32)),
        "logsBloom": format!("0x{}", "00".repeat(256)),
        "difficulty": "0x0",
        "totalDifficulty": "0x0",
        "extraData": "0x",
        "size": "0x220",
        "gasLimit": "0x1c9c380",
        "gasUsed": "0x0",
        "timestamp": format!("0x{timestamp:x}"),
        "transactions": [],
        "uncles": [],
        "nonce": "0x0000000000000000",
        "mixHash": format!("0x{}", "00".repeat(32)),
        "baseFeePerGas": "0x3b9aca00"
    })
}
