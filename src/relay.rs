use crate::encoding::{self, parse_h256, parse_u256_quantity};
use crate::error::{AaError, Result};
use crate::types::{GasLimits, UserOperation, UserOperationReceipt};
use ethers::types::{Address, H256};
use serde_json::Value;
use std::time::Duration;

/// JSON-RPC client for an ERC-4337 relay (bundler) service.
#[derive(Debug, Clone)]
pub struct RelayClient {
    url: String,
    http: reqwest::Client,
    poll_interval: Duration,
}

/// A failed JSON-RPC exchange: either the service answered with an error
/// object, or the request never produced a usable answer.
#[derive(Debug)]
enum RpcFailure {
    Service { code: Option<i64>, message: String },
    Transport(String),
}

impl From<RpcFailure> for AaError {
    fn from(f: RpcFailure) -> Self {
        match f {
            RpcFailure::Service { code, message } => AaError::SubmissionRejected { code, message },
            RpcFailure::Transport(msg) => AaError::Network(msg),
        }
    }
}

impl RelayClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
            poll_interval: Duration::from_millis(1500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `eth_supportedEntryPoints`, normalized to addresses.
    pub async fn supported_entry_points(&self) -> Result<Vec<Address>> {
        let res = self
            .rpc("eth_supportedEntryPoints", serde_json::json!([]))
            .await
            .map_err(|e| match e {
                RpcFailure::Service { message, .. } | RpcFailure::Transport(message) => {
                    AaError::Network(format!("eth_supportedEntryPoints failed: {message}"))
                }
            })?;

        res.as_array()
            .ok_or_else(|| AaError::Network(format!("unexpected eth_supportedEntryPoints result: {res}")))?
            .iter()
            .map(|v| match v.as_str() {
                Some(s) => crate::error::parse_address("supportedEntryPoint", s),
                None => Err(AaError::Network(format!(
                    "malformed eth_supportedEntryPoints entry: {v}"
                ))),
            })
            .collect()
    }

    /// Fails with `EntryPointUnsupported` unless the relay lists `entry_point`.
    ///
    /// Comparison is on parsed addresses, so checksum casing does not matter.
    pub async fn ensure_entry_point_supported(&self, entry_point: Address) -> Result<()> {
        let supported = self.supported_entry_points().await?;
        if supported.contains(&entry_point) {
            tracing::debug!(relay = %self.url, ?entry_point, "entry point supported by relay");
            Ok(())
        } else {
            Err(AaError::EntryPointUnsupported {
                entry_point,
                supported,
            })
        }
    }

    pub async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasLimits> {
        let params =
            serde_json::json!([encoding::user_op_to_json(op), encoding::fmt_address(entry_point)]);
        let res = self
            .rpc("eth_estimateUserOperationGas", params)
            .await
            .map_err(|e| match e {
                RpcFailure::Service { message, .. } | RpcFailure::Transport(message) => {
                    AaError::EstimationFailed(message)
                }
            })?;

        let field = |key: &str| -> Result<_> {
            parse_u256_field(&res, key).map_err(|e| AaError::EstimationFailed(e.to_string()))
        };

        Ok(GasLimits {
            call_gas_limit: field("callGasLimit")?,
            verification_gas_limit: field("verificationGasLimit")?,
            pre_verification_gas: field("preVerificationGas")?,
        })
    }

    pub async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256> {
        let params =
            serde_json::json!([encoding::user_op_to_json(op), encoding::fmt_address(entry_point)]);
        let res = self.rpc("eth_sendUserOperation", params).await?;
        parse_userop_hash(&res)
    }

    /// Poll for a receipt until `timeout` elapses, including time spent in
    /// a request the relay is slow to answer.
    pub async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<UserOperationReceipt> {
        tokio::time::timeout(timeout, self.poll_receipt(user_op_hash))
            .await
            .map_err(|_| AaError::Timeout(timeout))?
    }

    async fn poll_receipt(&self, user_op_hash: H256) -> Result<UserOperationReceipt> {
        loop {
            let params = serde_json::json!([encoding::fmt_h256(user_op_hash)]);
            match self.rpc("eth_getUserOperationReceipt", params).await {
                Ok(v) if !v.is_null() => return parse_receipt(user_op_hash, v),
                Ok(_) => {}
                Err(e) => {
                    // transient errors are common on free-tier bundlers; keep polling
                    tracing::warn!(error = ?e, "relay receipt poll error");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> std::result::Result<Value, RpcFailure> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        tracing::debug!(relay = %self.url, method, "relay request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(format!("POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("failed to decode JSON: {e}")))?;

        if let Some(err) = body.get("error") {
            return Err(RpcFailure::Service {
                code: err.get("code").and_then(Value::as_i64),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
            });
        }

        if !status.is_success() {
            return Err(RpcFailure::Transport(format!("HTTP {}: {}", status, body)));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| RpcFailure::Transport("missing result field".into()))
    }
}

fn parse_u256_field(v: &Value, key: &str) -> Result<ethers::types::U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| AaError::Abi(format!("missing or invalid field {key}")))?;
    parse_u256_quantity(s)
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(AaError::Abi(format!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        )));
    };

    parse_h256(hash_str)
}

fn parse_receipt(user_op_hash: H256, raw: Value) -> Result<UserOperationReceipt> {
    let transaction_hash = raw
        .get("receipt")
        .and_then(|r| r.get("transactionHash"))
        .or_else(|| raw.get("transactionHash"))
        .and_then(Value::as_str)
        .map(parse_h256)
        .transpose()?;

    let success = match raw.get("success").and_then(Value::as_bool) {
        Some(success) => success,
        None => {
            tracing::warn!(?user_op_hash, "relay receipt has no success flag");
            false
        }
    };

    Ok(UserOperationReceipt {
        user_op_hash,
        transaction_hash,
        success,
        raw,
    })
}
