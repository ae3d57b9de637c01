//! Reference execution of the hand contract.
//!
//! player0 (the responder) commits a hash and escrows its stake, player1 (the
//! initiator) answers in the clear with a matching stake, and player0 reveals.
//! Either side may claim the escrow once the other has been idle for longer
//! than `reaction_time` seconds.

use commonware_codec::Encode;
use commonware_cryptography::sha256::Digest;
use rochambeau_types::{
    contract::encode_winner, Address, Call, Commitment, ContractEvent, ContractState, HashKey,
    Move,
};

/// Placeholder bytecode the local bot deploys.
pub const HAND_CONTRACT_CODE: &[u8] = b"\xfb\xffrochambeau/hand:v1";

pub mod revert {
    pub const NOT_PLAYER0: &str = "not_player0";
    pub const NOT_PLAYER1: &str = "not_player1";
    pub const ALREADY_COMMITTED: &str = "already_committed";
    pub const NO_COMMIT: &str = "no_commit";
    pub const ALREADY_MOVED: &str = "already_moved";
    pub const NO_MOVE: &str = "no_move";
    pub const INVALID_MOVE: &str = "invalid_move";
    pub const ZERO_STAKE: &str = "zero_stake";
    pub const STAKE_MISMATCH: &str = "stake_mismatch";
    pub const NOT_PAYABLE: &str = "not_payable";
    pub const BAD_REVEAL: &str = "bad_reveal";
    pub const TOO_EARLY: &str = "too_early";
    pub const ALREADY_INITIALIZED: &str = "already_initialized";
}

/// Effects of a successful call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Execution {
    pub return_value: Vec<u8>,
    pub events: Vec<ContractEvent>,
    /// Funds released from escrow.
    pub payouts: Vec<(Address, u64)>,
}

#[derive(Clone, Debug)]
pub struct HandContract {
    player0: Address,
    player1: Address,
    reaction_time: u64,
    stake: u64,
    hash: Option<Digest>,
    player1_move: Move,
    last_action_at: u64,
    pinned_time: Option<u64>,
}

impl HandContract {
    pub fn init(player0: Address, player1: Address, reaction_time: u64, now: u64) -> Self {
        Self {
            player0,
            player1,
            reaction_time,
            stake: 0,
            hash: None,
            player1_move: Move::None,
            last_action_at: now,
            pinned_time: None,
        }
    }

    /// Funds currently held by the contract.
    pub fn escrow(&self) -> u64 {
        match (self.hash.is_some(), self.player1_move.is_none()) {
            (false, _) => 0,
            (true, true) => self.stake,
            (true, false) => self.stake * 2,
        }
    }

    pub fn state(&self) -> ContractState {
        ContractState {
            player0: self.player0.clone(),
            player1: self.player1.clone(),
            stake: self.stake,
            hash: self.hash,
            player1_move: self.player1_move,
            last_action_at: self.last_action_at,
            reaction_time: self.reaction_time,
        }
    }

    fn reset(&mut self, now: u64) {
        self.stake = 0;
        self.hash = None;
        self.player1_move = Move::None;
        self.last_action_at = now;
    }

    fn payout(&mut self, winner: &Address, now: u64) -> (u64, Execution) {
        let amount = self.escrow();
        self.reset(now);
        (
            amount,
            Execution {
                return_value: encode_winner(Some(winner)),
                payouts: vec![(winner.clone(), amount)],
                ..Default::default()
            },
        )
    }

    /// Apply `call` made by `caller` with `amount` attached.
    ///
    /// On revert nothing changes and the reason is returned.
    pub fn execute(
        &mut self,
        caller: &Address,
        call: &Call,
        amount: u64,
        now: u64,
    ) -> Result<Execution, &'static str> {
        let now = self.pinned_time.unwrap_or(now);
        if amount > 0 && !matches!(call, Call::ProvideHash { .. } | Call::Player1Move { .. }) {
            return Err(revert::NOT_PAYABLE);
        }
        match call {
            Call::Init { .. } => Err(revert::ALREADY_INITIALIZED),
            Call::ProvideHash { hash } => {
                if caller != &self.player0 {
                    return Err(revert::NOT_PLAYER0);
                }
                if self.hash.is_some() {
                    return Err(revert::ALREADY_COMMITTED);
                }
                if amount == 0 {
                    return Err(revert::ZERO_STAKE);
                }
                self.hash = Some(*hash);
                self.stake = amount;
                self.last_action_at = now;
                Ok(Execution {
                    events: vec![ContractEvent::Player0ProvidedHash { hash: *hash }],
                    ..Default::default()
                })
            }
            Call::Player1Move { selection } => {
                if caller != &self.player1 {
                    return Err(revert::NOT_PLAYER1);
                }
                if self.hash.is_none() {
                    return Err(revert::NO_COMMIT);
                }
                if !self.player1_move.is_none() {
                    return Err(revert::ALREADY_MOVED);
                }
                if selection.is_none() {
                    return Err(revert::INVALID_MOVE);
                }
                if amount != self.stake {
                    return Err(revert::STAKE_MISMATCH);
                }
                self.player1_move = *selection;
                self.last_action_at = now;
                Ok(Execution {
                    events: vec![ContractEvent::Player1Moved {
                        selection: *selection,
                    }],
                    ..Default::default()
                })
            }
            Call::Reveal { key, selection } => self.reveal(caller, key, *selection, now),
            Call::Player1DisputeNoReveal => {
                if caller != &self.player1 {
                    return Err(revert::NOT_PLAYER1);
                }
                if self.player1_move.is_none() {
                    return Err(revert::NO_MOVE);
                }
                self.ensure_expired(now)?;
                let winner = self.player1.clone();
                let (amount, mut execution) = self.payout(&winner, now);
                execution
                    .events
                    .push(ContractEvent::Player1WonDispute { amount });
                Ok(execution)
            }
            Call::Player0DisputeNoMove => {
                if caller != &self.player0 {
                    return Err(revert::NOT_PLAYER0);
                }
                if self.hash.is_none() {
                    return Err(revert::NO_COMMIT);
                }
                if !self.player1_move.is_none() {
                    return Err(revert::ALREADY_MOVED);
                }
                self.ensure_expired(now)?;
                let winner = self.player0.clone();
                let (amount, mut execution) = self.payout(&winner, now);
                execution
                    .events
                    .push(ContractEvent::Player0WonDispute { amount });
                Ok(execution)
            }
            Call::GetState => Ok(Execution {
                return_value: self.state().encode().to_vec(),
                ..Default::default()
            }),
            Call::SetTimestamp { timestamp } => {
                self.pinned_time = Some(*timestamp);
                Ok(Execution::default())
            }
        }
    }

    fn ensure_expired(&self, now: u64) -> Result<(), &'static str> {
        if now < self.last_action_at.saturating_add(self.reaction_time) {
            return Err(revert::TOO_EARLY);
        }
        Ok(())
    }

    fn reveal(
        &mut self,
        caller: &Address,
        key: &HashKey,
        selection: Move,
        now: u64,
    ) -> Result<Execution, &'static str> {
        if caller != &self.player0 {
            return Err(revert::NOT_PLAYER0);
        }
        let Some(hash) = self.hash else {
            return Err(revert::NO_COMMIT);
        };
        let opponent = self.player1_move;
        if opponent.is_none() {
            return Err(revert::NO_MOVE);
        }
        if !Commitment::verify(&hash, key, selection) {
            return Err(revert::BAD_REVEAL);
        }

        let stake = self.stake;
        let revealed = ContractEvent::Player0Revealed { selection };
        if selection == opponent {
            self.reset(now);
            return Ok(Execution {
                return_value: encode_winner(None),
                events: vec![revealed, ContractEvent::Draw { amount: stake }],
                payouts: vec![(self.player0.clone(), stake), (self.player1.clone(), stake)],
            });
        }

        let winner = if selection.beats(opponent) {
            self.player0.clone()
        } else {
            self.player1.clone()
        };
        let (amount, mut execution) = self.payout(&winner, now);
        let outcome = if winner == self.player0 {
            ContractEvent::Player0Won { amount }
        } else {
            ContractEvent::Player1Won { amount }
        };
        execution.events = vec![revealed, outcome];
        Ok(execution)
    }
}
