//! Send transactions through an ERC-4337 (EntryPoint v0.6) smart account.
//!
//! The account address is counterfactual and the account is deployed with its
//! first operation. Operations can be sponsored by a VerifyingPaymaster and
//! delivered either straight to the EntryPoint or through a relay service.

pub mod aa_signer;
pub mod address;
pub mod builder;
pub mod config;
pub mod contracts;
pub mod encoding;
pub mod error;
pub mod funding;
pub mod paymaster;
pub mod relay;
pub mod sender;
pub mod signer;
pub mod types;

#[cfg(test)]
mod testutil;

pub use aa_signer::{AaSigner, Stage};
pub use address::{counterfactual_address, AddressResolver, ProxyTemplate};
pub use builder::{GasPolicy, GasSource, UserOperationBuilder};
pub use config::{load_deployment, ClientConfig, Deployment};
pub use error::{AaError, Result};
pub use paymaster::{PaymasterAuthorizer, PaymasterSigner};
pub use relay::RelayClient;
pub use sender::{DirectSender, OperationSender, RelaySender};
pub use signer::OperationSigner;
pub use types::{
    AccountState, Call, GasLimits, PaymasterAndData, SignedUserOperation, UnsignedUserOperation,
    UserOperation, UserOperationReceipt,
};
