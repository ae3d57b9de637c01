//! Round state machine for one channel session.
//!
//! All work funnels through a single queue of [Step]s: public operations and
//! channel events only enqueue follow-up steps, and [GameChannel::drive] runs
//! them one at a time. Autoplay and recovery therefore loop instead of
//! recursing, and nothing mutates the round concurrently.
//!
//! Channel events that arrive while a step is awaiting the session are
//! handled before the next step runs, so the order between "we committed" and
//! "the bot moved" follows channel rounds, never wall-clock time.

use crate::{
    backoff::RetryPolicy,
    defaults,
    interceptor::SigningInterceptor,
    notify::{Notification, Notifier, StateView},
    persistence::SnapshotStore,
    Error, Result,
};
use commonware_cryptography::sha256::Digest;
use rand::{rngs::StdRng, SeedableRng};
use rochambeau_client::{BytecodeVerifier, Connector, ContractCall, EventStream, Session, Sign};
use rochambeau_types::{
    commitment_hash, hash_selection, log::OPEN_ROUND, AbiError, Address, AutoplayConfig, Balances, Call,
    CallResult, ChannelConfig, ChannelEvent, ChannelStatus, ChannelTx, ContractBinding,
    ContractEvent, Keypair, Move, OnChainTx, Round, SignedState, Snapshot, TransactionLogs,
    TxLogEntry,
};
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    sync::broadcast,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, trace, warn};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Progress within an open channel's current round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundPhase {
    AwaitingSelection,
    Committing,
    AwaitingBotMove,
    Revealing,
    Resolving,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Opening,
    Reconnecting,
    Open(RoundPhase),
    Disconnected,
    Closing,
    Closed,
}

/// Tunables of a [GameChannel].
#[derive(Clone, Debug)]
pub struct Options {
    pub stake: u64,
    /// Bound on each historical call lookup.
    pub fetch_timeout: Duration,
    pub verify_timeout: Duration,
    pub retry: RetryPolicy,
    pub log_retention_rounds: usize,
    pub notification_buffer: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stake: defaults::DEFAULT_STAKE,
            fetch_timeout: Duration::from_millis(defaults::DEFAULT_FETCH_TIMEOUT_MS),
            verify_timeout: Duration::from_millis(defaults::DEFAULT_VERIFY_TIMEOUT_MS),
            retry: RetryPolicy {
                max_attempts: defaults::DEFAULT_MAX_CALL_ATTEMPTS,
                base: Duration::from_millis(defaults::DEFAULT_RETRY_BACKOFF_MS),
                max: Duration::from_millis(defaults::DEFAULT_MAX_RETRY_BACKOFF_MS),
            },
            log_retention_rounds: defaults::DEFAULT_LOG_RETENTION_ROUNDS,
            notification_buffer: defaults::DEFAULT_NOTIFICATION_BUFFER,
        }
    }
}

#[derive(Debug)]
enum Step {
    Commit(Move),
    Reveal,
    /// Read back the result of our reveal (or dispute) at channel `round`.
    Resolve { round: u64 },
    Finish(Option<Address>),
    NewRound,
}

/// Coordinates one player's games inside a state channel with a bot.
pub struct GameChannel<C: Connector, S: SnapshotStore> {
    connector: C,
    store: S,
    options: Options,
    keypair: Keypair,
    verifier: Arc<dyn BytecodeVerifier>,
    interceptor: Arc<SigningInterceptor>,

    session: Option<C::Session>,
    events: Option<EventStream>,
    inbox: VecDeque<ChannelEvent>,
    channel_config: Option<ChannelConfig>,
    channel_id: Option<String>,
    fsm_id: Option<String>,
    channel_round: Option<u64>,
    /// Highest channel round whose contract call has already been applied locally.
    synced_round: u64,

    phase: Phase,
    round: Round,
    autoplay: AutoplayConfig,
    balances: Balances,
    logs: TransactionLogs,

    pending: VecDeque<Step>,
    rng: StdRng,
    notifier: Notifier,
}

impl<C: Connector, S: SnapshotStore> GameChannel<C, S> {
    pub fn new(
        connector: C,
        store: S,
        keypair: Keypair,
        verifier: Arc<dyn BytecodeVerifier>,
        options: Options,
    ) -> Self {
        let interceptor = Arc::new(SigningInterceptor::new(
            keypair.clone(),
            verifier.clone(),
            options.verify_timeout,
        ));
        let notifier = Notifier::new(options.notification_buffer);
        let round = Round::new(options.stake);
        Self {
            connector,
            store,
            options,
            keypair,
            verifier,
            interceptor,
            session: None,
            events: None,
            inbox: VecDeque::new(),
            channel_config: None,
            channel_id: None,
            fsm_id: None,
            channel_round: None,
            synced_round: 0,
            phase: Phase::Idle,
            round,
            autoplay: AutoplayConfig::default(),
            balances: Balances::default(),
            logs: TransactionLogs::default(),
            pending: VecDeque::new(),
            rng: StdRng::from_entropy(),
            notifier,
        }
    }

    /// Make commitment keys and autoplay moves reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn address(&self) -> &Address {
        self.keypair.address()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn balances(&self) -> Balances {
        self.balances
    }

    pub fn autoplay(&self) -> &AutoplayConfig {
        &self.autoplay
    }

    pub fn logs(&self) -> &TransactionLogs {
        &self.logs
    }

    pub fn contract(&self) -> Option<ContractBinding> {
        self.interceptor.contract()
    }

    pub fn channel_round(&self) -> Option<u64> {
        self.channel_round
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn view(&self) -> StateView {
        StateView {
            phase: self.phase,
            round: self.round.clone(),
            balances: self.balances,
            autoplay: self.autoplay.clone(),
        }
    }

    /// Publish the outcome of a public operation.
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.notifier.send(Notification::Error(err.to_string()));
        }
        self.notifier.send(Notification::Updated(self.view()));
        result
    }

    fn session(&self) -> Result<&C::Session> {
        self.session.as_ref().ok_or(Error::NotConnected)
    }

    fn binding(&self) -> Result<ContractBinding> {
        self.interceptor.contract().ok_or(Error::NoContract)
    }

    fn bot_address(&self) -> Result<Address> {
        self.channel_config
            .as_ref()
            .map(|config| config.initiator_id.clone())
            .ok_or(Error::NotConnected)
    }

    /// Latest channel round, falling back to the last one we observed (the
    /// session may not know it right after a reconnect).
    fn current_channel_round(&self) -> Option<u64> {
        self.session
            .as_ref()
            .and_then(|session| session.round())
            .or(self.channel_round)
    }

    fn synced(&mut self, round: u64) {
        self.synced_round = self.synced_round.max(round);
        self.channel_round = Some(self.channel_round.map_or(round, |known| known.max(round)));
    }

    fn round_phase(&self) -> RoundPhase {
        if self.round.is_completed || !self.round.has_commit() {
            RoundPhase::AwaitingSelection
        } else if self.round.bot_selection.is_none() {
            RoundPhase::AwaitingBotMove
        } else {
            RoundPhase::Revealing
        }
    }

    fn enter(&mut self, phase: RoundPhase) {
        if matches!(self.phase, Phase::Open(_)) {
            self.phase = Phase::Open(phase);
        }
    }

    fn log_user(&mut self, description: impl Into<String>, signed_state: SignedState) {
        self.logs.user.append(
            self.round.index,
            TxLogEntry::new(description, signed_state, now_ms()),
        );
    }

    fn snapshot(&self) -> Option<Snapshot> {
        let contract = self.interceptor.contract()?;
        Some(Snapshot {
            keypair: self.keypair.clone(),
            channel_id: self.channel_id.clone(),
            fsm_id: self.fsm_id.clone(),
            channel_config: self.channel_config.clone()?,
            channel_round: self.channel_round,
            round: self.round.clone(),
            transaction_logs: self.logs.clone(),
            contract_creation_round: contract.creation_round,
        })
    }

    fn persist(&self) {
        if self.phase == Phase::Closed {
            return;
        }
        match self.snapshot() {
            Some(snapshot) => self.store.save(&snapshot),
            None => trace!("no verified contract yet, skipping snapshot"),
        }
    }

    fn attach(&mut self, session: C::Session, events: EventStream) {
        self.channel_id = Some(session.channel_id());
        self.fsm_id = Some(session.fsm_id());
        if let Some(round) = session.round() {
            self.channel_round = Some(round);
        }
        self.session = Some(session);
        self.events = Some(events);
    }

    /// Disconnect the live session, if any. Only one session is ever held.
    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.disconnect();
        }
        self.events = None;
        self.inbox.clear();
        self.pending.clear();
    }

    /// Open a new channel described by `config`.
    pub async fn open(&mut self, config: ChannelConfig) -> Result<()> {
        let result = self.open_channel(config).await;
        self.settle(result)
    }

    async fn open_channel(&mut self, config: ChannelConfig) -> Result<()> {
        self.teardown();
        self.interceptor.reset();
        self.round = Round::new(self.options.stake);
        self.logs = TransactionLogs::default();
        self.channel_id = None;
        self.fsm_id = None;
        self.channel_round = None;
        self.synced_round = 0;
        self.phase = Phase::Opening;
        self.channel_config = Some(config.clone());
        info!(
            initiator = %config.initiator_id,
            responder = %config.responder_id,
            "opening channel"
        );

        let signer: Arc<dyn Sign> = self.interceptor.clone();
        let (session, events) = match self.connector.initialize(&config, signer).await {
            Ok(opened) => opened,
            Err(err) => {
                self.phase = Phase::Idle;
                return Err(err.into());
            }
        };
        self.attach(session, events);
        self.drive().await?;
        if self.interceptor.contract().is_none() {
            error!("bot did not deploy a verified contract");
            return Err(Error::NoContract);
        }
        self.refresh().await?;
        self.persist();
        Ok(())
    }

    /// Resume the saved game, if any. Returns whether a channel was resumed.
    ///
    /// A corrupted snapshot is discarded and reported; nothing is reconnected.
    pub async fn resume(&mut self) -> Result<bool> {
        let result = self.resume_channel().await;
        self.settle(result)
    }

    async fn resume_channel(&mut self) -> Result<bool> {
        let snapshot = match self.store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!("no saved game");
                return Ok(false);
            }
            Err(err) => {
                error!(%err, "saved game is corrupted");
                return Err(err.into());
            }
        };
        let Some(config) = snapshot.reconnect_config() else {
            warn!("saved game has no channel to resume");
            self.store.clear();
            return Ok(false);
        };

        self.teardown();
        let binding = ContractBinding::new(
            config.initiator_id.clone(),
            snapshot.contract_creation_round,
        );
        self.keypair = snapshot.keypair;
        self.interceptor = Arc::new(
            SigningInterceptor::new(
                self.keypair.clone(),
                self.verifier.clone(),
                self.options.verify_timeout,
            )
            .with_contract(binding),
        );
        self.channel_config = Some(snapshot.channel_config);
        self.channel_id = snapshot.channel_id;
        self.fsm_id = snapshot.fsm_id;
        self.channel_round = snapshot.channel_round;
        self.synced_round = 0;
        self.round = snapshot.round;
        self.logs = snapshot.transaction_logs;
        self.phase = Phase::Reconnecting;
        info!(
            channel_id = ?self.channel_id,
            index = self.round.index,
            channel_round = ?self.channel_round,
            "resuming channel"
        );

        let signer: Arc<dyn Sign> = self.interceptor.clone();
        let (session, events) = match self.connector.reconnect(&config, signer).await {
            Ok(resumed) => resumed,
            Err(err) => {
                warn!(%err, "reconnect failed");
                self.phase = Phase::Idle;
                return Err(err.into());
            }
        };
        self.attach(session, events);
        self.drive().await?;
        self.refresh().await?;
        self.reconcile_last_call().await?;
        self.drive().await?;
        Ok(true)
    }

    /// Handle every event already delivered by the session.
    pub async fn process_events(&mut self) -> Result<()> {
        let result = self.drive().await;
        self.settle(result)
    }

    /// Wait for the next channel event and handle it. Returns false once the
    /// session has stopped delivering events.
    pub async fn next_event(&mut self) -> Result<bool> {
        let Some(events) = self.events.as_mut() else {
            return Ok(false);
        };
        let Some(event) = events.next().await else {
            self.events = None;
            return Ok(false);
        };
        self.handle_event(event).await?;
        Ok(true)
    }

    /// Pump channel events until the channel closes or the stream ends.
    pub async fn run(&mut self) -> Result<()> {
        while self.phase != Phase::Closed && self.next_event().await? {}
        Ok(())
    }

    pub async fn handle_event(&mut self, event: ChannelEvent) -> Result<()> {
        self.inbox.push_back(event);
        let result = self.drive().await;
        self.settle(result)
    }

    fn next_ready_event(&mut self) -> Option<ChannelEvent> {
        self.inbox
            .pop_front()
            .or_else(|| self.events.as_mut().and_then(EventStream::try_next))
    }

    /// Run queued steps, handling delivered events between them.
    async fn drive(&mut self) -> Result<()> {
        let result = self.run_steps().await;
        if let Err(err) = &result {
            error!(%err, index = self.round.index, "operation failed");
            self.pending.clear();
            if self.autoplay.enabled {
                self.autoplay.disengage(now_ms());
            }
            if self.round.user_in_action {
                self.round.user_in_action = false;
                self.persist();
            }
        }
        result
    }

    async fn run_steps(&mut self) -> Result<()> {
        loop {
            if let Some(event) = self.next_ready_event() {
                self.apply_event(event).await?;
                continue;
            }
            if self.binding().is_ok() {
                let dropped = self.events.as_ref().map_or(0, EventStream::take_dropped);
                if dropped > 0 {
                    warn!(dropped, "channel events were lost, reconciling from the last call");
                    self.reconcile_last_call().await?;
                    continue;
                }
            }
            let Some(step) = self.pending.pop_front() else {
                return Ok(());
            };
            trace!(?step, "executing");
            match step {
                Step::Commit(selection) => self.commit(selection).await?,
                Step::Reveal => self.reveal().await?,
                Step::Resolve { round } => self.resolve(round).await?,
                Step::Finish(winner) => self.finish(winner).await,
                Step::NewRound => self.new_round(),
            }
        }
    }

    async fn apply_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::StatusChanged(status) => self.on_status(status),
            ChannelEvent::StateChanged(tx) => self.on_state(tx).await?,
            ChannelEvent::Message(message) => match message.as_bot_log() {
                Some(relay) => self.logs.bot.append(relay.round, relay.entry),
                None => debug!(kind = %message.kind, "ignoring channel message"),
            },
            ChannelEvent::OnChainTx(tx) => self.on_chain_tx(tx),
        }
        Ok(())
    }

    fn on_status(&mut self, status: ChannelStatus) {
        debug!(%status, "channel status");
        match status {
            ChannelStatus::Open => {
                if self.phase == Phase::Opening {
                    self.logs.user.append(
                        OPEN_ROUND,
                        TxLogEntry::new("channel open", SignedState::Confirmed, now_ms())
                            .on_chain(),
                    );
                }
                if matches!(
                    self.phase,
                    Phase::Opening | Phase::Reconnecting | Phase::Disconnected
                ) {
                    self.phase = Phase::Open(self.round_phase());
                    info!(index = self.round.index, phase = ?self.phase, "channel open");
                }
            }
            ChannelStatus::Disconnected => {
                warn!("channel disconnected");
                self.phase = Phase::Disconnected;
                self.notifier
                    .send(Notification::Error("channel disconnected".to_string()));
            }
            ChannelStatus::Closing => self.phase = Phase::Closing,
            ChannelStatus::Closed => {
                info!("channel closed");
                self.store.clear();
                self.phase = Phase::Closed;
            }
            ChannelStatus::Died => {
                error!(channel_id = ?self.channel_id, "channel died");
                self.session = None;
                self.events = None;
                self.pending.clear();
                self.round.user_in_action = false;
                self.autoplay.disengage(now_ms());
                self.store.clear();
                self.phase = Phase::Closed;
                self.notifier
                    .send(Notification::Error(Error::ChannelDied.to_string()));
            }
            ChannelStatus::Connecting
            | ChannelStatus::Accepted
            | ChannelStatus::HalfSigned
            | ChannelStatus::Signed => {}
        }
    }

    async fn on_state(&mut self, tx: ChannelTx) -> Result<()> {
        trace!(round = tx.round, "state changed");
        self.channel_round = Some(
            self.channel_round
                .map_or(tx.round, |known| known.max(tx.round)),
        );
        if tx.deploys_contract() {
            if let Some(binding) = self.interceptor.contract() {
                self.logs.user.append(
                    OPEN_ROUND,
                    TxLogEntry::new(
                        format!("deploy {}", binding.address),
                        SignedState::Confirmed,
                        now_ms(),
                    ),
                );
            }
        }
        if self.interceptor.bot_action().consume(tx.round) {
            self.round.should_handle_bot_action = true;
            let handled = self.reconcile_opponent(&tx).await;
            self.round.should_handle_bot_action = false;
            handled?;
        }
        self.persist();
        Ok(())
    }

    fn on_chain_tx(&mut self, tx: OnChainTx) {
        info!(hash = %tx.hash, info = %tx.info, "on-chain transaction");
        let index = self.round.index;
        if self.logs.user.patch_tx_id(index, &tx.hash)
            || self.logs.user.patch_tx_id(OPEN_ROUND, &tx.hash)
        {
            return;
        }
        let mut entry = TxLogEntry::new(tx.info, SignedState::Confirmed, now_ms()).on_chain();
        entry.id = Some(tx.hash);
        self.logs.user.append(index, entry);
    }

    /// Commit to `selection` for the current round.
    ///
    /// Calling this again while a commit is in flight (or already made this
    /// round) is a no-op.
    pub async fn set_user_selection(&mut self, selection: Move) -> Result<()> {
        if selection.is_none() {
            return Err(Error::InvalidSelection(selection));
        }
        self.pending.push_back(Step::Commit(selection));
        let result = self.drive().await;
        self.settle(result)
    }

    async fn commit(&mut self, selection: Move) -> Result<()> {
        if self.round.is_completed {
            return Err(Error::RoundCompleted {
                index: self.round.index,
            });
        }
        if self.round.user_in_action || self.round.has_commit() {
            debug!(index = self.round.index, "commit already made this round");
            return Ok(());
        }
        let binding = self.binding()?;
        if self.session.is_none() {
            return Err(Error::NotConnected);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let commitment = hash_selection(selection, &mut self.rng);
            self.round.user_selection = selection;
            self.round.hash_key = Some(commitment.key);
            self.round.user_in_action = true;
            self.enter(RoundPhase::Committing);
            self.log_user(format!("provide_hash({selection})"), SignedState::Proposed);
            self.persist();

            let call = ContractCall {
                contract: binding.address.clone(),
                call_data: binding.encode_call(&Call::ProvideHash {
                    hash: commitment.hash,
                }),
                amount: self.round.stake,
            };
            let result = self.session()?.call_contract(call).await;
            let err = match result {
                Ok(receipt) => {
                    info!(index = self.round.index, round = receipt.round(), "commit accepted");
                    self.synced(receipt.round());
                    self.log_user("provide_hash", SignedState::Confirmed);
                    self.enter(RoundPhase::AwaitingBotMove);
                    self.persist();
                    return Ok(());
                }
                Err(err) => err,
            };
            let reason = match err.reject_reason() {
                Some(reason) if reason.is_retryable() => reason.clone(),
                Some(reason) => {
                    let reason = reason.clone();
                    warn!(index = self.round.index, %reason, "commit rejected");
                    self.reset_commit();
                    return Err(Error::SelectionRejected(reason));
                }
                None => {
                    self.reset_commit();
                    return Err(err.into());
                }
            };

            warn!(attempt, %reason, index = self.round.index, "commit not acknowledged");
            let delay = self.options.retry.delay(attempt, &mut self.rng);
            sleep(delay).await;
            if self.commit_landed(&binding, &commitment.hash).await? {
                return Ok(());
            }
            self.reset_commit();
            if !self.options.retry.allows(attempt) {
                return Err(Error::SelectionRejected(reason));
            }
        }
    }

    fn reset_commit(&mut self) {
        self.round.user_selection = Move::None;
        self.round.hash_key = None;
        self.round.user_in_action = false;
        self.enter(RoundPhase::AwaitingSelection);
        self.log_user("provide_hash", SignedState::Declined);
        self.persist();
    }

    /// Check whether a commit whose acknowledgement was lost made it into the channel.
    async fn commit_landed(&mut self, binding: &ContractBinding, hash: &Digest) -> Result<bool> {
        let Some(round) = self.current_channel_round() else {
            return Ok(false);
        };
        let Some(result) = self.fetch_last_call(binding, round).await else {
            return Ok(false);
        };
        let events = match binding.decode_events(&result) {
            Ok(events) => events,
            Err(err) => {
                debug!(round, %err, "last call is not our commit");
                return Ok(false);
            }
        };
        let landed = events.iter().any(|event| match event {
            ContractEvent::Player0ProvidedHash { hash: committed } => committed == hash,
            ContractEvent::Player1Moved { .. } => true,
            _ => false,
        });
        if landed {
            info!(round = result.round, "commit landed without acknowledgement");
            self.log_user("provide_hash", SignedState::Confirmed);
            self.reconcile(binding, &result)?;
        }
        Ok(landed)
    }

    /// Record the bot's move, as decoded from its contract call.
    pub fn set_bot_selection(&mut self, selection: Move) {
        self.record_bot_selection(selection);
        self.persist();
        self.notifier.send(Notification::Updated(self.view()));
    }

    fn record_bot_selection(&mut self, selection: Move) {
        info!(index = self.round.index, %selection, "bot moved");
        self.round.bot_selection = selection;
        self.enter(self.round_phase());
    }

    /// Reveal the committed move once the bot has answered.
    pub async fn reveal_round_result(&mut self) -> Result<()> {
        self.pending.push_back(Step::Reveal);
        let result = self.drive().await;
        self.settle(result)
    }

    async fn reveal(&mut self) -> Result<()> {
        if self.round.is_completed {
            debug!(index = self.round.index, "round already resolved");
            return Ok(());
        }
        let Some(key) = self.round.hash_key.filter(|_| self.round.can_reveal()) else {
            return Err(Error::Precondition {
                operation: "reveal",
                reason: "both moves must be known",
            });
        };
        let selection = self.round.user_selection;
        let binding = self.binding()?;
        self.enter(RoundPhase::Revealing);
        let call = ContractCall {
            contract: binding.address.clone(),
            call_data: binding.encode_call(&Call::Reveal { key, selection }),
            amount: 0,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.log_user(format!("reveal({selection})"), SignedState::Proposed);
            let result = self.session()?.call_contract(call.clone()).await;
            let err = match result {
                Ok(receipt) => {
                    info!(index = self.round.index, round = receipt.round(), "reveal accepted");
                    self.synced(receipt.round());
                    self.log_user("reveal", SignedState::Confirmed);
                    self.pending.push_front(Step::Resolve {
                        round: receipt.round(),
                    });
                    return Ok(());
                }
                Err(err) => err,
            };
            warn!(attempt, %err, index = self.round.index, "reveal failed");
            self.log_user("reveal", SignedState::Declined);
            if !self.options.retry.allows(attempt) {
                self.round.user_in_action = false;
                self.persist();
                return Err(Error::RevealFailed {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }
            let delay = self.options.retry.delay(attempt, &mut self.rng);
            sleep(delay).await;
            if let Some(round) = self.reveal_landed(&binding).await {
                self.pending.push_front(Step::Resolve { round });
                return Ok(());
            }
        }
    }

    async fn reveal_landed(&mut self, binding: &ContractBinding) -> Option<u64> {
        let round = self.current_channel_round()?;
        let result = self.fetch_last_call(binding, round).await?;
        let revealed = &result.caller == self.keypair.address()
            && result.revert.is_none()
            && matches!(
                binding.decode_call(&result.call_data),
                Ok(Call::Reveal { .. })
            );
        if !revealed {
            return None;
        }
        info!(round = result.round, "reveal landed without acknowledgement");
        self.synced(result.round);
        Some(result.round)
    }

    async fn resolve(&mut self, round: u64) -> Result<()> {
        self.enter(RoundPhase::Resolving);
        let binding = self.binding()?;
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            if let Some(result) = self.fetch_last_call(&binding, round).await {
                break result;
            }
            if !self.options.retry.allows(attempt) {
                return Err(Error::FetchTimedOut { round });
            }
            let delay = self.options.retry.delay(attempt, &mut self.rng);
            sleep(delay).await;
        };
        let winner = binding.decode_winner(&result)?;
        self.pending.push_front(Step::Finish(winner));
        Ok(())
    }

    /// Close the round with `winner` (`None` for a draw) and move on.
    pub async fn finish_game_round(&mut self, winner: Option<Address>) -> Result<()> {
        self.pending.push_back(Step::Finish(winner));
        let result = self.drive().await;
        self.settle(result)
    }

    async fn finish(&mut self, winner: Option<Address>) {
        self.round.winner = winner;
        self.round.is_completed = true;
        self.round.user_in_action = false;
        self.enter(RoundPhase::AwaitingSelection);
        let outcome = match &self.round.winner {
            None => "draw",
            Some(winner) if winner == self.keypair.address() => "won",
            Some(_) => "lost",
        };
        info!(
            index = self.round.index,
            user = %self.round.user_selection,
            bot = %self.round.bot_selection,
            outcome,
            "round finished"
        );
        self.log_user(format!("round {outcome}"), SignedState::Confirmed);
        self.persist();
        self.notifier
            .send(Notification::RoundFinished(self.round.clone()));

        if let Err(err) = self.refresh().await {
            warn!(%err, "failed to refresh balances");
        }
        if !self.balances.covers(self.round.stake) {
            warn!(
                user = self.balances.user,
                bot = self.balances.bot,
                stake = self.round.stake,
                "balances cannot cover another round"
            );
            if self.autoplay.enabled {
                self.autoplay.disengage(now_ms());
            }
            self.notifier.send(Notification::Error(format!(
                "insufficient balance for a stake of {}",
                self.round.stake
            )));
            return;
        }
        if !self
            .pending
            .iter()
            .any(|step| matches!(step, Step::NewRound))
        {
            self.pending.push_back(Step::NewRound);
        }
    }

    pub async fn start_new_round(&mut self) -> Result<()> {
        self.pending.push_back(Step::NewRound);
        let result = self.drive().await;
        self.settle(result)
    }

    fn new_round(&mut self) {
        self.round.advance();
        self.enter(RoundPhase::AwaitingSelection);
        let pruned = self.logs.prune(self.options.log_retention_rounds);
        if pruned > 0 {
            debug!(pruned, "pruned transaction logs");
        }
        info!(index = self.round.index, "new round");
        if self.autoplay.enabled {
            if self.autoplay.is_exhausted(self.round.index) {
                self.autoplay.disengage(now_ms());
                info!(
                    index = self.round.index,
                    elapsed_ms = self.autoplay.elapsed_ms,
                    "autoplay finished"
                );
            } else {
                let selection = Move::random(&mut self.rng);
                debug!(
                    %selection,
                    remaining = self.autoplay.remaining(self.round.index),
                    "autoplay move"
                );
                self.pending.push_back(Step::Commit(selection));
            }
        }
        self.persist();
    }

    /// Re-derive local state from the latest contract call in the channel.
    ///
    /// Used after reconnecting and whenever it is unclear whether a call went
    /// through.
    pub async fn handle_last_contract_call(&mut self) -> Result<()> {
        let result = match self.reconcile_last_call().await {
            Ok(()) => self.drive().await,
            Err(err) => Err(err),
        };
        self.settle(result)
    }

    async fn reconcile_last_call(&mut self) -> Result<()> {
        let binding = self.binding()?;
        let Some(round) = self.current_channel_round() else {
            warn!("channel round unknown, nothing to reconcile");
            return Ok(());
        };
        let last = match self.lookup_last_call(&binding, round).await {
            Ok(last) => last,
            Err(err) => {
                error!(round, %err, "could not fetch the last contract call");
                if self.round.is_completed {
                    self.pending.push_back(Step::NewRound);
                }
                return Ok(());
            }
        };
        let Some(selection) = self.unsent_commit(&binding, last.as_ref()) else {
            return match last {
                Some(result) => self.reconcile(&binding, &result),
                None => {
                    if self.round.is_completed {
                        self.pending.push_back(Step::NewRound);
                    }
                    Ok(())
                }
            };
        };

        // A saved round can lag the channel by the commit itself
        let session_round = self.session.as_ref().and_then(|session| session.round());
        if session_round.is_none() {
            match self
                .fetch_call(self.keypair.address(), &binding, round + 1)
                .await
            {
                Ok(later) => return self.reconcile(&binding, &later),
                Err(Error::Client(rochambeau_client::Error::CallNotFound { .. })) => {}
                Err(err) => {
                    error!(round = round + 1, %err, "could not check for a later commit");
                    return Ok(());
                }
            }
        }
        warn!(
            index = self.round.index,
            round,
            %selection,
            "saved commit never reached the channel, resubmitting"
        );
        self.reset_commit();
        self.pending.push_back(Step::Commit(selection));
        Ok(())
    }

    /// The selection of a local commit that `last`, the latest call in the
    /// channel, shows was never applied.
    fn unsent_commit(&self, binding: &ContractBinding, last: Option<&CallResult>) -> Option<Move> {
        let round = &self.round;
        if round.is_completed || !round.has_commit() || !round.bot_selection.is_none() {
            return None;
        }
        let hash = commitment_hash(round.hash_key.as_ref()?, round.user_selection);
        let Some(result) = last else {
            return Some(round.user_selection);
        };
        let landed = match binding.decode_events(result) {
            Ok(events) => events.iter().any(|event| match event {
                ContractEvent::Player0ProvidedHash { hash: committed } => committed == &hash,
                ContractEvent::Player1Moved { .. }
                | ContractEvent::Player0WonDispute { .. }
                | ContractEvent::Player1WonDispute { .. } => true,
                _ => false,
            }),
            Err(AbiError::Reverted(_)) => {
                &result.caller != self.keypair.address()
                    || !matches!(
                        binding.decode_call(&result.call_data),
                        Ok(Call::ProvideHash { .. })
                    )
            }
            Err(_) => true,
        };
        (!landed).then_some(round.user_selection)
    }

    /// React to a contract call made by the bot in `tx`.
    pub async fn handle_opponent_call(&mut self, tx: &ChannelTx) -> Result<()> {
        let result = match self.reconcile_opponent(tx).await {
            Ok(()) => self.drive().await,
            Err(err) => Err(err),
        };
        self.settle(result)
    }

    async fn reconcile_opponent(&mut self, tx: &ChannelTx) -> Result<()> {
        if tx.round <= self.synced_round {
            debug!(round = tx.round, synced = self.synced_round, "call already reconciled");
            return Ok(());
        }
        let binding = self.binding()?;
        match self.fetch_last_call(&binding, tx.round).await {
            Some(result) => self.reconcile(&binding, &result),
            None => Ok(()),
        }
    }

    /// Queue whatever local action `result` implies for the current round.
    fn reconcile(&mut self, binding: &ContractBinding, result: &CallResult) -> Result<()> {
        self.synced(result.round);
        let events = match binding.decode_events(result) {
            Ok(events) => events,
            Err(AbiError::Reverted(reason)) => {
                warn!(round = result.round, %reason, "last call reverted");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let own = &result.caller == self.keypair.address();
        debug!(round = result.round, own, events = events.len(), "reconciling");

        if events.iter().any(ContractEvent::is_outcome) {
            if self.round.is_completed {
                self.pending.push_back(Step::NewRound);
            } else if !self.round.has_commit() {
                debug!(round = result.round, "outcome belongs to an earlier round");
            } else if own {
                let winner = binding.decode_winner(result)?;
                self.pending.push_back(Step::Finish(winner));
            } else {
                self.pending
                    .push_back(Step::Finish(Some(result.caller.clone())));
            }
            return Ok(());
        }

        for event in &events {
            match event {
                ContractEvent::Player1Moved { selection } => {
                    if !self.round.has_commit() || self.round.is_completed {
                        warn!(%selection, index = self.round.index, "bot moved without a pending commit");
                        continue;
                    }
                    self.record_bot_selection(*selection);
                    self.pending.push_back(Step::Reveal);
                }
                ContractEvent::Player0ProvidedHash { .. }
                    if self.round.has_commit() && !self.round.is_completed =>
                {
                    self.round.user_in_action = true;
                    self.enter(RoundPhase::AwaitingBotMove);
                }
                _ => {}
            }
        }
        if events.is_empty() && self.round.is_completed {
            self.pending.push_back(Step::NewRound);
        }
        Ok(())
    }

    async fn fetch_call(
        &self,
        caller: &Address,
        binding: &ContractBinding,
        round: u64,
    ) -> Result<CallResult> {
        let session = self.session()?;
        match timeout(
            self.options.fetch_timeout,
            session.get_contract_call(caller, &binding.address, round),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::FetchTimedOut { round }),
        }
    }

    /// The contract call applied at channel `round`, looked up as ours first
    /// and as the bot's second. `Ok(None)` when neither side made one.
    async fn lookup_last_call(
        &self,
        binding: &ContractBinding,
        round: u64,
    ) -> Result<Option<CallResult>> {
        let callers = std::iter::once(self.keypair.address().clone()).chain(self.bot_address().ok());
        let mut failure = None;
        for caller in callers {
            match self.fetch_call(&caller, binding, round).await {
                Ok(result) => return Ok(Some(result)),
                Err(Error::Client(rochambeau_client::Error::CallNotFound { .. })) => {
                    debug!(%caller, round, "no call at round")
                }
                Err(err) => {
                    warn!(%caller, round, %err, "call lookup failed");
                    failure = Some(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    async fn fetch_last_call(&self, binding: &ContractBinding, round: u64) -> Option<CallResult> {
        match self.lookup_last_call(binding, round).await {
            Ok(last) => last,
            Err(err) => {
                error!(round, %err, "could not fetch the last contract call");
                None
            }
        }
    }

    pub async fn engage_autoplay(&mut self, rounds: u64) -> Result<()> {
        let result = self.engage(rounds).await;
        self.settle(result)
    }

    async fn engage(&mut self, rounds: u64) -> Result<()> {
        if self.session.is_none() {
            let config = self.channel_config.clone().ok_or(Error::NotConnected)?;
            self.open_channel(config).await?;
        }
        if self.round.is_completed && !self.balances.covers(self.round.stake) {
            return Err(Error::Precondition {
                operation: "autoplay",
                reason: "balances cannot cover the stake",
            });
        }
        let start = if self.round.is_completed {
            self.round.index + 1
        } else {
            self.round.index
        };
        self.autoplay.engage(rounds, start, now_ms());
        info!(rounds, start, "autoplay engaged");
        if self.autoplay.is_exhausted(start) {
            self.autoplay.disengage(now_ms());
            return Ok(());
        }
        if self.round.is_completed {
            self.pending.push_back(Step::NewRound);
        } else if !self.round.user_in_action && !self.round.has_commit() {
            let selection = Move::random(&mut self.rng);
            self.pending.push_back(Step::Commit(selection));
        }
        self.drive().await
    }

    pub fn disengage_autoplay(&mut self) {
        if !self.autoplay.enabled {
            return;
        }
        self.autoplay.disengage(now_ms());
        info!(index = self.round.index, "autoplay disengaged");
        self.notifier.send(Notification::Updated(self.view()));
    }

    /// Claim the escrow when the bot has not answered our commit in time.
    pub async fn dispute_no_move(&mut self) -> Result<()> {
        let result = self.dispute().await;
        self.settle(result)
    }

    async fn dispute(&mut self) -> Result<()> {
        if !self.round.has_commit() || self.round.is_completed {
            return Err(Error::Precondition {
                operation: "dispute",
                reason: "no commit is waiting for the bot",
            });
        }
        if !self.round.bot_selection.is_none() {
            return Err(Error::Precondition {
                operation: "dispute",
                reason: "the bot has already moved",
            });
        }
        let binding = self.binding()?;
        self.log_user("player0_dispute_no_move", SignedState::Proposed);
        let call = ContractCall {
            contract: binding.address.clone(),
            call_data: binding.encode_call(&Call::Player0DisputeNoMove),
            amount: 0,
        };
        let receipt = self.session()?.call_contract(call).await?;
        self.synced(receipt.round());
        let result = self
            .fetch_call(self.keypair.address(), &binding, receipt.round())
            .await?;
        let winner = match binding.decode_winner(&result) {
            Ok(winner) => winner,
            Err(AbiError::Reverted(reason)) => {
                warn!(%reason, index = self.round.index, "dispute rejected");
                self.log_user("player0_dispute_no_move", SignedState::Declined);
                self.persist();
                return Err(Error::DisputeRejected(reason));
            }
            Err(err) => return Err(err.into()),
        };
        self.log_user("player0_dispute_no_move", SignedState::Confirmed);
        self.pending.push_back(Step::Finish(winner));
        self.drive().await
    }

    pub async fn refresh_balances(&mut self) -> Result<Balances> {
        let result = match self.refresh().await {
            Ok(()) => Ok(self.balances),
            Err(err) => Err(err),
        };
        self.settle(result)
    }

    async fn refresh(&mut self) -> Result<()> {
        let user = self.keypair.address().clone();
        let bot = self.bot_address()?;
        let balances = self
            .session()?
            .balances(&[user.clone(), bot.clone()])
            .await?;
        self.balances = Balances {
            user: balances.get(&user).copied().unwrap_or_default(),
            bot: balances.get(&bot).copied().unwrap_or_default(),
        };
        debug!(user = self.balances.user, bot = self.balances.bot, "balances");
        Ok(())
    }

    /// Cooperatively close the channel and forget the saved game.
    pub async fn close(&mut self) -> Result<OnChainTx> {
        let result = self.shutdown().await;
        self.settle(result)
    }

    async fn shutdown(&mut self) -> Result<OnChainTx> {
        if self.session.is_none() {
            return Err(Error::NotConnected);
        }
        if self.autoplay.enabled {
            self.autoplay.disengage(now_ms());
        }
        let previous = self.phase;
        self.phase = Phase::Closing;
        let tx = match self.session()?.shutdown().await {
            Ok(tx) => tx,
            Err(err) => {
                self.phase = previous;
                return Err(err.into());
            }
        };
        self.drive().await?;
        self.session = None;
        self.events = None;
        self.pending.clear();
        self.store.clear();
        self.phase = Phase::Closed;
        info!(hash = %tx.hash, "channel closed");
        Ok(tx)
    }
}
