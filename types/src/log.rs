use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Round that holds channel-open records; never pruned.
pub const OPEN_ROUND: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignedState {
    Proposed,
    Confirmed,
    Declined,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxLogEntry {
    /// Transaction id, known only once the transaction is on-chain.
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub signed_state: SignedState,
    pub on_chain: bool,
    pub timestamp: u64,
}

impl TxLogEntry {
    pub fn new(description: impl Into<String>, signed_state: SignedState, timestamp: u64) -> Self {
        Self {
            id: None,
            description: description.into(),
            signed_state,
            on_chain: false,
            timestamp,
        }
    }

    pub fn on_chain(mut self) -> Self {
        self.on_chain = true;
        self
    }
}

/// Append-only log of entries grouped by game round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionLog {
    rounds: BTreeMap<u64, Vec<TxLogEntry>>,
}

impl TransactionLog {
    pub fn append(&mut self, round: u64, entry: TxLogEntry) {
        self.rounds.entry(round).or_default().push(entry);
    }

    pub fn entries(&self, round: u64) -> &[TxLogEntry] {
        self.rounds.get(&round).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rounds(&self) -> impl Iterator<Item = (&u64, &Vec<TxLogEntry>)> {
        self.rounds.iter()
    }

    pub fn last(&self) -> Option<&TxLogEntry> {
        self.rounds.values().rev().find_map(|entries| entries.last())
    }

    pub fn len(&self) -> usize {
        self.rounds.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach `id` to the newest on-chain entry of `round` that has none yet.
    pub fn patch_tx_id(&mut self, round: u64, id: &str) -> bool {
        let Some(entry) = self
            .rounds
            .get_mut(&round)
            .and_then(|entries| {
                entries
                    .iter_mut()
                    .rev()
                    .find(|entry| entry.on_chain && entry.id.is_none())
            })
        else {
            return false;
        };
        entry.id = Some(id.to_string());
        true
    }

    /// Keep at most `max_rounds` game rounds, evicting the oldest. Round 0 is kept.
    pub fn prune(&mut self, max_rounds: usize) -> usize {
        let game_rounds: Vec<u64> = self
            .rounds
            .keys()
            .copied()
            .filter(|round| *round != OPEN_ROUND)
            .collect();
        let excess = game_rounds.len().saturating_sub(max_rounds);
        for round in &game_rounds[..excess] {
            self.rounds.remove(round);
        }
        excess
    }
}

/// The user-originated and bot-originated logs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogs {
    pub user: TransactionLog,
    pub bot: TransactionLog,
}

impl TransactionLogs {
    pub fn prune(&mut self, max_rounds: usize) -> usize {
        self.user.prune(max_rounds) + self.bot.prune(max_rounds)
    }
}
