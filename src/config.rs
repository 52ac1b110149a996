use crate::address::ProxyTemplate;
use crate::encoding::parse_hex_bytes;
use crate::error::{parse_address, AaError, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub entry_point: String,
    pub account_factory: String,
    #[serde(default)]
    pub verifying_paymaster: Option<String>,
    #[serde(default)]
    pub relay: Option<String>,

    /// Enables local CREATE2 derivation when both are present.
    #[serde(default)]
    pub account_implementation: Option<String>,
    #[serde(default)]
    pub proxy_creation_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub chain_id: u64,
    pub rpc_url: String,
    pub entry_point: Address,
    pub account_factory: Address,
    pub verifying_paymaster: Option<Address>,
    pub relay_url: Option<String>,
    pub proxy: Option<ProxyTemplate>,
}

/// Values every component needs, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub chain_id: u64,
    pub entry_point: Address,
    pub factory: Address,
    pub salt: U256,
}

impl Deployment {
    pub fn client_config(&self, salt: U256) -> ClientConfig {
        ClientConfig {
            chain_id: self.chain_id,
            entry_point: self.entry_point,
            factory: self.account_factory,
            salt,
        }
    }

    /// Fails unless the node reports the chain this deployment was made on.
    pub fn ensure_chain_id(&self, reported: u64) -> Result<()> {
        if reported != self.chain_id {
            return Err(AaError::Config(format!(
                "chainId mismatch: rpc={reported} deployment={}",
                self.chain_id
            )));
        }
        Ok(())
    }
}

pub fn load_deployment(path: &Path, rpc_override: Option<String>) -> Result<Deployment> {
    let raw = fs::read_to_string(path).map_err(|e| {
        AaError::Config(format!(
            "failed to read deployment json at {}: {e}",
            path.display()
        ))
    })?;
    let raw: DeploymentRaw = serde_json::from_str(&raw).map_err(|e| {
        AaError::Config(format!(
            "failed to parse deployment json at {}: {e}",
            path.display()
        ))
    })?;

    let rpc_url = match rpc_override {
        Some(rpc) => rpc,
        None => raw
            .rpc_env_var
            .as_deref()
            .and_then(|var| env::var(var).ok())
            .unwrap_or_else(|| raw.rpc.clone()),
    };

    resolve(raw, rpc_url)
}

fn resolve(raw: DeploymentRaw, rpc_url: String) -> Result<Deployment> {
    let proxy = match (&raw.account_implementation, &raw.proxy_creation_code) {
        (Some(implementation), Some(code)) => Some(ProxyTemplate {
            implementation: parse_address("accountImplementation", implementation)?,
            creation_code: parse_hex_bytes(code)?,
        }),
        (None, None) => None,
        _ => {
            return Err(AaError::Config(
                "accountImplementation and proxyCreationCode must be set together".into(),
            ))
        }
    };

    Ok(Deployment {
        chain_id: raw.chain_id,
        rpc_url,
        entry_point: parse_address("entryPoint", &raw.entry_point)?,
        account_factory: parse_address("accountFactory", &raw.account_factory)?,
        verifying_paymaster: raw
            .verifying_paymaster
            .as_deref()
            .map(|s| parse_address("verifyingPaymaster", s))
            .transpose()?,
        relay_url: raw.relay,
        proxy,
    })
}
