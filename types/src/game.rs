use crate::{account::Address, hashing::HashKey};
use bytes::{Buf, BufMut};
use commonware_codec::{Error, FixedSize, Read, ReadExt, Write};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// A hand in rock-paper-scissors. `None` is the "not chosen yet" marker and is
/// never a valid move to commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Move {
    #[default]
    None = 0,
    Rock = 1,
    Paper = 2,
    Scissors = 3,
}

impl Move {
    pub const PLAYABLE: [Move; 3] = [Move::Rock, Move::Paper, Move::Scissors];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Rock => "rock",
            Self::Paper => "paper",
            Self::Scissors => "scissors",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Pick one of the three playable moves uniformly.
    pub fn random(rng: &mut impl Rng) -> Self {
        Self::PLAYABLE[rng.gen_range(0..Self::PLAYABLE.len())]
    }

    pub fn beats(self, other: Move) -> bool {
        matches!(
            (self, other),
            (Self::Rock, Self::Scissors) | (Self::Paper, Self::Rock) | (Self::Scissors, Self::Paper)
        )
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Move {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "rock" => Ok(Self::Rock),
            "paper" => Ok(Self::Paper),
            "scissors" => Ok(Self::Scissors),
            other => Err(format!("unknown move: {other}")),
        }
    }
}

impl Write for Move {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for Move {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = u8::read(reader)?;
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Rock),
            2 => Ok(Self::Paper),
            3 => Ok(Self::Scissors),
            i => Err(Error::InvalidEnum(i)),
        }
    }
}

impl FixedSize for Move {
    const SIZE: usize = 1;
}

/// The unit of game progress: commit, opponent move, reveal, result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    /// 1-based, increases by exactly one per round.
    pub index: u64,
    pub stake: u64,
    pub user_selection: Move,
    pub bot_selection: Move,
    /// Present only between commit and the start of the next round.
    #[serde(default)]
    pub hash_key: Option<HashKey>,
    pub is_completed: bool,
    /// `None` on a completed round encodes a draw.
    #[serde(default)]
    pub winner: Option<Address>,
    pub user_in_action: bool,
    #[serde(default)]
    pub should_handle_bot_action: bool,
}

impl Round {
    pub fn new(stake: u64) -> Self {
        Self {
            index: 1,
            stake,
            user_selection: Move::None,
            bot_selection: Move::None,
            hash_key: None,
            is_completed: false,
            winner: None,
            user_in_action: false,
            should_handle_bot_action: false,
        }
    }

    /// Move to the next round, resetting every per-round field.
    pub fn advance(&mut self) {
        let index = self.index + 1;
        *self = Self {
            index,
            ..Self::new(self.stake)
        };
    }

    /// A commit was made this round (the move and its key are held together).
    pub fn has_commit(&self) -> bool {
        !self.user_selection.is_none() && self.hash_key.is_some()
    }

    /// A key exists iff a move has been committed.
    pub fn is_consistent(&self) -> bool {
        self.user_selection.is_none() != self.hash_key.is_some()
    }

    pub fn is_draw(&self) -> bool {
        self.is_completed && self.winner.is_none()
    }

    /// Both hands are known, so a reveal can be attempted.
    pub fn can_reveal(&self) -> bool {
        self.has_commit() && !self.bot_selection.is_none() && !self.is_completed
    }
}

/// Drives rounds automatically for a bounded number of rounds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoplayConfig {
    pub enabled: bool,
    /// How many rounds to play after engaging.
    pub rounds: u64,
    /// Round index at which autoplay was engaged.
    pub start_round: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    /// Accumulated time spent in autoplay across engagements.
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl AutoplayConfig {
    pub fn engage(&mut self, rounds: u64, current_index: u64, now_ms: u64) {
        self.enabled = true;
        self.rounds = rounds;
        self.start_round = current_index;
        self.started_at_ms = Some(now_ms);
    }

    pub fn disengage(&mut self, now_ms: u64) {
        if let Some(started) = self.started_at_ms.take() {
            self.elapsed_ms = self
                .elapsed_ms
                .saturating_add(now_ms.saturating_sub(started));
        }
        self.enabled = false;
    }

    /// The budget is spent once `index` reaches `start_round + rounds`.
    pub fn is_exhausted(&self, index: u64) -> bool {
        index >= self.start_round.saturating_add(self.rounds)
    }

    pub fn remaining(&self, index: u64) -> u64 {
        self.start_round
            .saturating_add(self.rounds)
            .saturating_sub(index)
    }
}

/// Off-chain balances of both participants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub user: u64,
    pub bot: u64,
}

impl Balances {
    /// Both sides can fund a round of `stake`.
    pub fn covers(&self, stake: u64) -> bool {
        self.user >= stake && self.bot >= stake
    }
}
