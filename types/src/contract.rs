//! Fixed ABI of the hand contract.
//!
//! Entrypoints and events are encoded with a one-byte tag followed by their
//! fields. player0 is the responder (commits by hash), player1 the initiator
//! (moves in the clear).
//!
//! Binary layouts:
//! - `init`: [0] [player0] [player1] [reactionTime:u64 BE]
//! - `provide_hash`: [1] [hash:32]
//! - `player1_move`: [2] [move:u8]
//! - `reveal`: [3] [key:32] [move:u8]
//! - `player1_dispute_no_reveal`: [4]
//! - `player0_dispute_no_move`: [5]
//! - `get_state`: [6]
//! - `set_timestamp`: [7] [timestamp:u64 BE]
//!
//! Addresses are written as [len:u32 BE] [utf8 bytes...].

use crate::{account::Address, game::Move, hashing::HashKey, hashing::HASH_KEY_LENGTH};
use bytes::{Buf, BufMut};
use commonware_codec::{DecodeExt, Encode, EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::sha256::Digest;
use thiserror::Error as ThisError;

/// Longest address accepted inside calldata.
pub const MAX_ADDRESS_LENGTH: usize = 128;

fn write_address(address: &Address, writer: &mut impl BufMut) {
    let bytes = address.as_str().as_bytes();
    (bytes.len() as u32).write(writer);
    writer.put_slice(bytes);
}

fn read_address(reader: &mut impl Buf) -> Result<Address, Error> {
    let len = u32::read(reader)? as usize;
    if len > MAX_ADDRESS_LENGTH {
        return Err(Error::Invalid("Address", "too long"));
    }
    if reader.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    let mut bytes = vec![0u8; len];
    reader.copy_to_slice(&mut bytes);
    String::from_utf8(bytes)
        .map(Address::new)
        .map_err(|_| Error::Invalid("Address", "invalid UTF-8"))
}

fn address_size(address: &Address) -> usize {
    4 + address.as_str().len()
}

fn read_key(reader: &mut impl Buf) -> Result<HashKey, Error> {
    if reader.remaining() < HASH_KEY_LENGTH {
        return Err(Error::EndOfBuffer);
    }
    let mut key = [0u8; HASH_KEY_LENGTH];
    reader.copy_to_slice(&mut key);
    Ok(HashKey::from_bytes(key))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Init {
        player0: Address,
        player1: Address,
        reaction_time: u64,
    },
    ProvideHash {
        hash: Digest,
    },
    Player1Move {
        selection: Move,
    },
    Reveal {
        key: HashKey,
        selection: Move,
    },
    Player1DisputeNoReveal,
    Player0DisputeNoMove,
    GetState,
    /// Debug only: pins the contract clock.
    SetTimestamp {
        timestamp: u64,
    },
}

impl Call {
    pub fn entrypoint(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::ProvideHash { .. } => "provide_hash",
            Self::Player1Move { .. } => "player1_move",
            Self::Reveal { .. } => "reveal",
            Self::Player1DisputeNoReveal => "player1_dispute_no_reveal",
            Self::Player0DisputeNoMove => "player0_dispute_no_move",
            Self::GetState => "get_state",
            Self::SetTimestamp { .. } => "set_timestamp",
        }
    }
}

impl Write for Call {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Init {
                player0,
                player1,
                reaction_time,
            } => {
                0u8.write(writer);
                write_address(player0, writer);
                write_address(player1, writer);
                reaction_time.write(writer);
            }
            Self::ProvideHash { hash } => {
                1u8.write(writer);
                hash.write(writer);
            }
            Self::Player1Move { selection } => {
                2u8.write(writer);
                selection.write(writer);
            }
            Self::Reveal { key, selection } => {
                3u8.write(writer);
                writer.put_slice(key.as_bytes());
                selection.write(writer);
            }
            Self::Player1DisputeNoReveal => 4u8.write(writer),
            Self::Player0DisputeNoMove => 5u8.write(writer),
            Self::GetState => 6u8.write(writer),
            Self::SetTimestamp { timestamp } => {
                7u8.write(writer);
                timestamp.write(writer);
            }
        }
    }
}

impl Read for Call {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let call = match u8::read(reader)? {
            0 => Self::Init {
                player0: read_address(reader)?,
                player1: read_address(reader)?,
                reaction_time: u64::read(reader)?,
            },
            1 => Self::ProvideHash {
                hash: Digest::read(reader)?,
            },
            2 => Self::Player1Move {
                selection: Move::read(reader)?,
            },
            3 => Self::Reveal {
                key: read_key(reader)?,
                selection: Move::read(reader)?,
            },
            4 => Self::Player1DisputeNoReveal,
            5 => Self::Player0DisputeNoMove,
            6 => Self::GetState,
            7 => Self::SetTimestamp {
                timestamp: u64::read(reader)?,
            },
            i => return Err(Error::InvalidEnum(i)),
        };
        Ok(call)
    }
}

impl EncodeSize for Call {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Init {
                player0,
                player1,
                reaction_time,
            } => address_size(player0) + address_size(player1) + reaction_time.encode_size(),
            Self::ProvideHash { hash } => hash.encode_size(),
            Self::Player1Move { selection } => selection.encode_size(),
            Self::Reveal { selection, .. } => HASH_KEY_LENGTH + selection.encode_size(),
            Self::Player1DisputeNoReveal | Self::Player0DisputeNoMove | Self::GetState => 0,
            Self::SetTimestamp { timestamp } => timestamp.encode_size(),
        }
    }
}

/// Events emitted by the hand contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractEvent {
    Player0ProvidedHash { hash: Digest },
    Player1Moved { selection: Move },
    Player0Revealed { selection: Move },
    Player0Won { amount: u64 },
    Player1Won { amount: u64 },
    /// Each side was refunded `amount`.
    Draw { amount: u64 },
    Player0WonDispute { amount: u64 },
    Player1WonDispute { amount: u64 },
}

impl ContractEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Player0ProvidedHash { .. } => "Player0ProvidedHash",
            Self::Player1Moved { .. } => "Player1Moved",
            Self::Player0Revealed { .. } => "Player0Revealed",
            Self::Player0Won { .. } => "Player0Won",
            Self::Player1Won { .. } => "Player1Won",
            Self::Draw { .. } => "Draw",
            Self::Player0WonDispute { .. } => "Player0WonDispute",
            Self::Player1WonDispute { .. } => "Player1WonDispute",
        }
    }

    /// The event closes the round (a result or a dispute payout).
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            Self::Player0Won { .. }
                | Self::Player1Won { .. }
                | Self::Draw { .. }
                | Self::Player0WonDispute { .. }
                | Self::Player1WonDispute { .. }
        )
    }
}

impl Write for ContractEvent {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Player0ProvidedHash { hash } => {
                0u8.write(writer);
                hash.write(writer);
            }
            Self::Player1Moved { selection } => {
                1u8.write(writer);
                selection.write(writer);
            }
            Self::Player0Revealed { selection } => {
                2u8.write(writer);
                selection.write(writer);
            }
            Self::Player0Won { amount } => {
                3u8.write(writer);
                amount.write(writer);
            }
            Self::Player1Won { amount } => {
                4u8.write(writer);
                amount.write(writer);
            }
            Self::Draw { amount } => {
                5u8.write(writer);
                amount.write(writer);
            }
            Self::Player0WonDispute { amount } => {
                6u8.write(writer);
                amount.write(writer);
            }
            Self::Player1WonDispute { amount } => {
                7u8.write(writer);
                amount.write(writer);
            }
        }
    }
}

impl Read for ContractEvent {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let event = match u8::read(reader)? {
            0 => Self::Player0ProvidedHash {
                hash: Digest::read(reader)?,
            },
            1 => Self::Player1Moved {
                selection: Move::read(reader)?,
            },
            2 => Self::Player0Revealed {
                selection: Move::read(reader)?,
            },
            3 => Self::Player0Won {
                amount: u64::read(reader)?,
            },
            4 => Self::Player1Won {
                amount: u64::read(reader)?,
            },
            5 => Self::Draw {
                amount: u64::read(reader)?,
            },
            6 => Self::Player0WonDispute {
                amount: u64::read(reader)?,
            },
            7 => Self::Player1WonDispute {
                amount: u64::read(reader)?,
            },
            i => return Err(Error::InvalidEnum(i)),
        };
        Ok(event)
    }
}

impl EncodeSize for ContractEvent {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Player0ProvidedHash { hash } => hash.encode_size(),
            Self::Player1Moved { selection } | Self::Player0Revealed { selection } => {
                selection.encode_size()
            }
            Self::Player0Won { amount }
            | Self::Player1Won { amount }
            | Self::Draw { amount }
            | Self::Player0WonDispute { amount }
            | Self::Player1WonDispute { amount } => amount.encode_size(),
        }
    }
}

/// Snapshot of the contract returned by `get_state`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractState {
    pub player0: Address,
    pub player1: Address,
    pub stake: u64,
    pub hash: Option<Digest>,
    pub player1_move: Move,
    pub last_action_at: u64,
    pub reaction_time: u64,
}

impl Write for ContractState {
    fn write(&self, writer: &mut impl BufMut) {
        write_address(&self.player0, writer);
        write_address(&self.player1, writer);
        self.stake.write(writer);
        self.hash.write(writer);
        self.player1_move.write(writer);
        self.last_action_at.write(writer);
        self.reaction_time.write(writer);
    }
}

impl Read for ContractState {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            player0: read_address(reader)?,
            player1: read_address(reader)?,
            stake: u64::read(reader)?,
            hash: Option::<Digest>::read(reader)?,
            player1_move: Move::read(reader)?,
            last_action_at: u64::read(reader)?,
            reaction_time: u64::read(reader)?,
        })
    }
}

impl EncodeSize for ContractState {
    fn encode_size(&self) -> usize {
        address_size(&self.player0)
            + address_size(&self.player1)
            + self.stake.encode_size()
            + self.hash.encode_size()
            + self.player1_move.encode_size()
            + self.last_action_at.encode_size()
            + self.reaction_time.encode_size()
    }
}

/// Outcome of executing a call, as fetched back from the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResult {
    pub caller: Address,
    pub contract: Address,
    pub round: u64,
    pub call_data: Vec<u8>,
    /// Encoded return value; empty for calls that return unit.
    pub return_value: Vec<u8>,
    /// Encoded [ContractEvent]s in emission order.
    pub log: Vec<Vec<u8>>,
    /// `Some(reason)` when the call aborted.
    pub revert: Option<String>,
}

#[derive(Debug, ThisError)]
pub enum AbiError {
    #[error("codec error: {0}")]
    Codec(#[from] Error),
    #[error("call reverted: {0}")]
    Reverted(String),
    #[error("call targets {got}, binding is for {expected}")]
    WrongContract { expected: Address, got: Address },
}

pub fn encode_winner(winner: Option<&Address>) -> Vec<u8> {
    let mut value = Vec::new();
    match winner {
        None => 0u8.write(&mut value),
        Some(address) => {
            1u8.write(&mut value);
            write_address(address, &mut value);
        }
    }
    value
}

fn decode_winner(mut value: &[u8]) -> Result<Option<Address>, Error> {
    let winner = match u8::read(&mut value)? {
        0 => None,
        1 => Some(read_address(&mut value)?),
        i => return Err(Error::InvalidEnum(i)),
    };
    if value.has_remaining() {
        return Err(Error::ExtraData(value.remaining()));
    }
    Ok(winner)
}

/// Encoder/decoder for one deployed instance of the hand contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractBinding {
    pub address: Address,
    pub owner: Address,
    pub creation_round: u64,
}

impl ContractBinding {
    pub fn new(owner: Address, creation_round: u64) -> Self {
        Self {
            address: Address::contract(&owner, creation_round),
            owner,
            creation_round,
        }
    }

    pub fn encode_call(&self, call: &Call) -> Vec<u8> {
        call.encode().to_vec()
    }

    pub fn decode_call(&self, call_data: &[u8]) -> Result<Call, AbiError> {
        Ok(Call::decode(call_data)?)
    }

    fn check(&self, result: &CallResult) -> Result<(), AbiError> {
        if result.contract != self.address {
            return Err(AbiError::WrongContract {
                expected: self.address.clone(),
                got: result.contract.clone(),
            });
        }
        if let Some(reason) = &result.revert {
            return Err(AbiError::Reverted(reason.clone()));
        }
        Ok(())
    }

    pub fn decode_events(&self, result: &CallResult) -> Result<Vec<ContractEvent>, AbiError> {
        self.check(result)?;
        result
            .log
            .iter()
            .map(|raw| ContractEvent::decode(raw.as_slice()).map_err(AbiError::from))
            .collect()
    }

    /// Decode the return value of `reveal` (or a dispute): the winner, `None` for a draw.
    pub fn decode_winner(&self, result: &CallResult) -> Result<Option<Address>, AbiError> {
        self.check(result)?;
        Ok(decode_winner(&result.return_value)?)
    }

    pub fn decode_state(&self, result: &CallResult) -> Result<ContractState, AbiError> {
        self.check(result)?;
        Ok(ContractState::decode(result.return_value.as_slice())?)
    }
}
