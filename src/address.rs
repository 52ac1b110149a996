//! Counterfactual smart-account addresses.

use crate::contracts::AccountFactory;
use crate::error::{AaError, Result};
use ethers::abi::{self, AbiParser, Token};
use ethers::contract::BaseContract;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, U256};
use ethers::utils::{get_create2_address_from_hash, keccak256};
use std::sync::Arc;

/// What the SimpleAccountFactory deploys: an ERC1967 proxy pointing at the
/// account implementation, initialized with the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTemplate {
    /// `type(ERC1967Proxy).creationCode`
    pub creation_code: Bytes,
    /// The factory's `accountImplementation()`
    pub implementation: Address,
}

impl ProxyTemplate {
    fn init_code_hash(&self, owner: Address) -> Result<[u8; 32]> {
        let initialize = BaseContract::from(
            AbiParser::default()
                .parse(&["function initialize(address anOwner)"])
                .map_err(AaError::abi)?,
        )
        .encode("initialize", owner)
        .map_err(AaError::abi)?;

        let ctor_args = abi::encode(&[
            Token::Address(self.implementation),
            Token::Bytes(initialize.to_vec()),
        ]);

        let mut init_code = Vec::with_capacity(self.creation_code.len() + ctor_args.len());
        init_code.extend_from_slice(self.creation_code.as_ref());
        init_code.extend_from_slice(&ctor_args);
        Ok(keccak256(init_code))
    }
}

/// CREATE2 address of the account `factory` would deploy for `(owner, salt)`.
///
/// Pure: the result does not depend on whether the account exists yet.
pub fn counterfactual_address(
    factory: Address,
    owner: Address,
    salt: U256,
    template: &ProxyTemplate,
) -> Result<Address> {
    let mut salt_bytes = [0u8; 32];
    salt.to_big_endian(&mut salt_bytes);
    Ok(get_create2_address_from_hash(
        factory,
        salt_bytes,
        template.init_code_hash(owner)?,
    ))
}

/// How the account address is derived.
#[derive(Debug, Clone)]
pub enum AddressResolver<M> {
    /// Local CREATE2 derivation, no network access.
    Create2(ProxyTemplate),
    /// Ask the factory's `getAddress(owner, salt)` view.
    Factory(Arc<M>),
}

impl<M: Middleware + 'static> AddressResolver<M> {
    pub async fn resolve(&self, factory: Address, owner: Address, salt: U256) -> Result<Address> {
        match self {
            Self::Create2(template) => counterfactual_address(factory, owner, salt, template),
            Self::Factory(client) => {
                AccountFactory::new(factory, client.clone())?
                    .get_address(owner, salt)
                    .await
            }
        }
    }
}
