use rand::{rngs::StdRng, SeedableRng};
use rochambeau_types::{
    Address, BotLogRelay, Call, ContractEvent, Keypair, Move, SignedState, TxLogEntry,
};
use std::collections::VecDeque;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// No contract deployed yet.
    Undeployed,
    /// Waiting for player0 to commit.
    AwaitingHash,
    /// Answered the commit of the current round.
    Moved { selection: Move },
}

/// The initiator side of a game: mirrors the player's round state machine
/// from the other seat.
pub struct Bot {
    keypair: Keypair,
    status: Status,
    round: u64,
    rng: StdRng,
    scripted: VecDeque<Move>,
    silent: bool,
    outbox: Vec<BotLogRelay>,
}

impl Bot {
    pub fn new(keypair: Keypair, seed: u64) -> Self {
        Self {
            keypair,
            status: Status::Undeployed,
            round: 1,
            rng: StdRng::seed_from_u64(seed),
            scripted: VecDeque::new(),
            silent: false,
            outbox: Vec::new(),
        }
    }

    pub fn address(&self) -> &Address {
        self.keypair.address()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Game round the bot believes it is in.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Play `moves` (in order) before falling back to random moves.
    pub fn script(&mut self, moves: impl IntoIterator<Item = Move>) {
        self.scripted.extend(moves);
    }

    /// Stop answering commits, so the other side can dispute.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    fn record(&mut self, round: u64, description: String, signed_state: SignedState, now: u64) {
        self.outbox.push(BotLogRelay {
            round,
            entry: TxLogEntry::new(description, signed_state, now),
        });
    }

    /// Log entries not yet relayed to the peer.
    pub fn drain_log(&mut self) -> Vec<BotLogRelay> {
        std::mem::take(&mut self.outbox)
    }

    pub fn deployed(&mut self, now: u64) {
        info!(bot = %self.address(), "contract deployed");
        self.status = Status::AwaitingHash;
        self.record(0, "deploy hand contract".into(), SignedState::Confirmed, now);
    }

    /// React to contract events, returning the call to make next (with its stake).
    pub fn apply_events(
        &mut self,
        events: &[ContractEvent],
        stake: u64,
        now: u64,
    ) -> Option<(Call, u64)> {
        let mut reaction = None;
        for event in events {
            match event {
                ContractEvent::Player0ProvidedHash { .. } => {
                    if self.status != Status::AwaitingHash {
                        debug!(status = ?self.status, "ignoring commit");
                        continue;
                    }
                    if self.silent {
                        debug!(round = self.round, "staying silent");
                        continue;
                    }
                    let selection = self
                        .scripted
                        .pop_front()
                        .unwrap_or_else(|| Move::random(&mut self.rng));
                    self.status = Status::Moved { selection };
                    self.record(
                        self.round,
                        format!("player1_move({selection})"),
                        SignedState::Proposed,
                        now,
                    );
                    reaction = Some((Call::Player1Move { selection }, stake));
                }
                event if event.is_outcome() => {
                    self.record(self.round, event.name().to_string(), SignedState::Confirmed, now);
                    self.round += 1;
                    self.status = Status::AwaitingHash;
                }
                _ => {}
            }
        }
        reaction
    }

    /// The bot's move was co-signed (or declined) by the peer.
    pub fn settled(&mut self, call: &Call, accepted: bool, now: u64) {
        let state = if accepted {
            SignedState::Confirmed
        } else {
            SignedState::Declined
        };
        self.record(self.round, call.entrypoint().to_string(), state, now);
        if !accepted {
            self.status = Status::AwaitingHash;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::sha256::Digest;

    fn committed() -> ContractEvent {
        ContractEvent::Player0ProvidedHash {
            hash: Digest::from([0u8; 32]),
        }
    }

    #[test]
    fn test_answers_commit_once() {
        let mut bot = Bot::new(Keypair::from_seed(2), 0);
        bot.deployed(0);
        bot.script([Move::Scissors]);
        let (call, stake) = bot.apply_events(&[committed()], 10, 1).unwrap();
        assert_eq!(
            call,
            Call::Player1Move {
                selection: Move::Scissors
            }
        );
        assert_eq!(stake, 10);
        assert!(bot.apply_events(&[committed()], 10, 1).is_none());

        bot.apply_events(&[ContractEvent::Player0Won { amount: 20 }], 10, 2);
        assert_eq!(bot.round(), 2);
        assert_eq!(bot.status(), &Status::AwaitingHash);
        assert_eq!(bot.drain_log().len(), 3);
        assert!(bot.drain_log().is_empty());
    }

    #[test]
    fn test_silent_bot_does_not_move() {
        let mut bot = Bot::new(Keypair::from_seed(2), 0);
        bot.deployed(0);
        bot.set_silent(true);
        assert!(bot.apply_events(&[committed()], 10, 1).is_none());
    }

    #[test]
    fn test_undeployed_bot_ignores_commit() {
        let mut bot = Bot::new(Keypair::from_seed(2), 0);
        assert!(bot.apply_events(&[committed()], 10, 1).is_none());
    }
}
