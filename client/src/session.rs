//! Abstractions over a state-channel session.
//!
//! The channel service itself (transport, co-signing protocol, on-chain
//! settlement) lives outside this crate. A [Connector] opens or resumes a
//! [Session] and hands back the [EventStream] that session reports on. Every
//! transaction the channel wants the local account to co-sign is routed
//! through the [Sign] implementation supplied at connect time.

use crate::{EventStream, Result};
use commonware_cryptography::ed25519::Signature;
use futures::future::BoxFuture;
use rochambeau_types::{Address, CallResult, ChannelConfig, ChannelStatus, ChannelTx, OnChainTx, SignRequest};
use std::{collections::HashMap, future::Future, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignError {
    #[error("deployed bytecode does not match the audited contract")]
    BytecodeMismatch,
    #[error("bytecode verification failed: {0}")]
    Verification(String),
    #[error("signing request declined: {0}")]
    Declined(String),
}

/// Callback invoked for every transaction the channel needs co-signed.
pub trait Sign: Send + Sync {
    fn sign<'a>(
        &'a self,
        request: &'a SignRequest,
    ) -> BoxFuture<'a, std::result::Result<Signature, SignError>>;
}

/// A call the local account asks the channel to apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractCall {
    pub contract: Address,
    pub call_data: Vec<u8>,
    pub amount: u64,
}

/// The co-signed transaction that carried a successful call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallReceipt {
    pub tx: ChannelTx,
}

impl CallReceipt {
    pub fn round(&self) -> u64 {
        self.tx.round
    }
}

/// An established (or establishing) channel session.
pub trait Session: Send + Sync + 'static {
    fn channel_id(&self) -> String;

    fn fsm_id(&self) -> String;

    /// Latest co-signed channel round, if the channel has opened.
    fn round(&self) -> Option<u64>;

    fn status(&self) -> ChannelStatus;

    /// Propose `call` from the local account and wait until it is co-signed.
    fn call_contract(&self, call: ContractCall) -> impl Future<Output = Result<CallReceipt>> + Send;

    fn balances(
        &self,
        accounts: &[Address],
    ) -> impl Future<Output = Result<HashMap<Address, u64>>> + Send;

    /// Fetch the result of the call `caller` made on `contract` at channel `round`.
    fn get_contract_call(
        &self,
        caller: &Address,
        contract: &Address,
        round: u64,
    ) -> impl Future<Output = Result<CallResult>> + Send;

    /// Cooperatively close the channel, settling balances on-chain.
    fn shutdown(&self) -> impl Future<Output = Result<OnChainTx>> + Send;

    /// Drop the connection without closing the channel.
    fn disconnect(&self);
}

/// Opens channel sessions.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    fn initialize(
        &self,
        config: &ChannelConfig,
        signer: Arc<dyn Sign>,
    ) -> impl Future<Output = Result<(Self::Session, EventStream)>> + Send;

    /// Resume the session named by `config.existing_channel_id` and `config.existing_fsm_id`.
    fn reconnect(
        &self,
        config: &ChannelConfig,
        signer: Arc<dyn Sign>,
    ) -> impl Future<Output = Result<(Self::Session, EventStream)>> + Send;
}
