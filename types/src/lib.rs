//! Common types shared by the rochambeau player, client and simulator.
//!
//! A game is played inside a two-party state channel: the bot opens the channel
//! (initiator) and deploys a hand contract, the user (responder) commits to a
//! move by hash, the bot answers in the clear, and the user reveals. Everything
//! here is plain data plus the codecs needed to move it over the channel.

pub mod account;
pub mod channel;
pub mod contract;
pub mod game;
pub mod hashing;
pub mod log;
pub mod snapshot;

pub use account::{Address, Keypair};
pub use channel::{
    BotLogRelay, ChannelConfig, ChannelEvent, ChannelMessage, ChannelStatus, ChannelTx, OnChainTx,
    SignRequest, SignTag, Timeouts, Update,
};
pub use contract::{AbiError, Call, CallResult, ContractBinding, ContractEvent, ContractState};
pub use game::{AutoplayConfig, Balances, Move, Round};
pub use hashing::{commitment_hash, hash_selection, Commitment, HashKey};
pub use log::{SignedState, TransactionLog, TransactionLogs, TxLogEntry};
pub use snapshot::{Snapshot, SnapshotError};

/// Namespace mixed into every signature produced by a rochambeau account.
pub const NAMESPACE: &[u8] = b"_ROCHAMBEAU";
