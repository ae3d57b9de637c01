use crate::{
    bot::Bot,
    contract::{HandContract, HAND_CONTRACT_CODE},
};
use commonware_codec::{DecodeExt, Encode};
use rochambeau_client::{
    events, CallReceipt, Connector, ContractCall, Error, EventSender, EventStream, RejectReason,
    Result, Session, Sign,
};
use rochambeau_types::{
    account::verify_signature, Address, Call, CallResult, ChannelConfig, ChannelEvent,
    ChannelMessage, ChannelStatus, ChannelTx, Keypair, Move, OnChainTx, SignRequest, SignTag,
    Timeouts, Update,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info, warn};

/// Tunables of the local channel service.
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    pub bot_seed: u64,
    /// Seconds either side may stay idle before the other can dispute.
    pub reaction_time: u64,
    /// Funds each side brings into the channel.
    pub deposit: u64,
    pub channel_reserve: u64,
    pub lock_period: u64,
    pub event_buffer: usize,
    pub contract_code: Vec<u8>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bot_seed: 0,
            reaction_time: 30,
            deposit: 1_000,
            channel_reserve: 1,
            lock_period: 10,
            event_buffer: events::DEFAULT_CHANNEL_CAPACITY,
            contract_code: HAND_CONTRACT_CODE.to_vec(),
        }
    }
}

#[derive(Default)]
struct Faults {
    rejections: HashMap<&'static str, VecDeque<RejectReason>>,
    lost_acks: HashMap<&'static str, usize>,
    stalled_fetches: HashMap<Address, usize>,
    dropped_updates: usize,
    hostile_code: Option<Vec<u8>>,
}

struct Channel {
    config: SimulatorConfig,
    bot: Bot,
    responder: Option<Address>,
    channel_id: Option<String>,
    fsm_id: Option<String>,
    status: ChannelStatus,
    round: u64,
    round_hidden: bool,
    generation: u64,
    clock: u64,
    tx_counter: u64,
    balances: HashMap<Address, u64>,
    contract: Option<(Address, HandContract)>,
    history: Vec<CallResult>,
    attempts: HashMap<&'static str, usize>,
    faults: Faults,
    events: Option<EventSender>,
    signer: Option<Arc<dyn Sign>>,
}

fn entrypoint(call_data: &[u8]) -> &'static str {
    Call::decode(call_data)
        .map(|call| call.entrypoint())
        .unwrap_or("unknown")
}

impl Channel {
    fn emit(&self, event: ChannelEvent) {
        if let Some(sender) = &self.events {
            sender.emit(event);
        }
    }

    fn set_status(&mut self, status: ChannelStatus) {
        debug!(%status, "channel status");
        self.status = status;
        self.emit(ChannelEvent::StatusChanged(status));
    }

    fn relay_bot_log(&mut self) {
        for relay in self.bot.drain_log() {
            match ChannelMessage::bot_log(&relay) {
                Ok(message) => self.emit(ChannelEvent::Message(message)),
                Err(err) => warn!(?err, "failed to encode bot log entry"),
            }
        }
    }

    fn next_hash(&mut self) -> String {
        self.tx_counter += 1;
        format!("th_{:016x}", self.tx_counter)
    }

    fn balance(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    fn ensure_live(&self, generation: u64) -> Result<()> {
        if generation != self.generation || self.status != ChannelStatus::Open {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    fn signer(&self) -> Result<Arc<dyn Sign>> {
        self.signer.clone().ok_or(Error::SessionClosed)
    }

    fn next_tx(&self, updates: Vec<Update>) -> ChannelTx {
        ChannelTx {
            round: self.round + 1,
            updates,
        }
    }

    fn detach(&mut self) {
        self.events = None;
        self.signer = None;
    }

    /// Validate a call proposed by the responder and build the update to co-sign.
    fn propose(
        &mut self,
        generation: u64,
        caller: &Address,
        call: &ContractCall,
    ) -> Result<(SignRequest, Arc<dyn Sign>)> {
        self.ensure_live(generation)?;
        let name = entrypoint(&call.call_data);
        *self.attempts.entry(name).or_default() += 1;
        if let Some(reason) = self
            .faults
            .rejections
            .get_mut(name)
            .and_then(VecDeque::pop_front)
        {
            warn!(entrypoint = name, %reason, "rejecting call");
            return Err(Error::Rejected(reason));
        }
        match &self.contract {
            Some((address, _)) if address == &call.contract => {}
            _ => {
                return Err(Error::Rejected(RejectReason::Other(format!(
                    "unknown contract {}",
                    call.contract
                ))))
            }
        }
        if self.balance(caller) < call.amount {
            return Err(Error::Rejected(RejectReason::Insufficient));
        }
        let tx = self.next_tx(vec![Update::CallContract {
            caller: caller.clone(),
            contract: call.contract.clone(),
            amount: call.amount,
            call_data: call.call_data.clone(),
        }]);
        Ok((
            SignRequest {
                tag: SignTag::Update,
                tx,
            },
            self.signer()?,
        ))
    }

    fn execute(
        &mut self,
        round: u64,
        caller: &Address,
        contract: &Address,
        amount: u64,
        call_data: &[u8],
    ) -> Option<(Call, u64)> {
        let clock = self.clock;
        let (outcome, stake) = {
            let Some((address, hand)) = self.contract.as_mut() else {
                warn!(%contract, "call to missing contract");
                return None;
            };
            if address != contract {
                warn!(%contract, "call to unknown contract");
                return None;
            }
            let outcome = match Call::decode(call_data) {
                Ok(call) => hand.execute(caller, &call, amount, clock),
                Err(_) => Err("bad_calldata"),
            };
            (outcome, hand.state().stake)
        };

        let mut result = CallResult {
            caller: caller.clone(),
            contract: contract.clone(),
            round,
            call_data: call_data.to_vec(),
            return_value: Vec::new(),
            log: Vec::new(),
            revert: None,
        };
        let mut reaction = None;
        match outcome {
            Ok(execution) => {
                let debited = self.balance(caller).saturating_sub(amount);
                self.balances.insert(caller.clone(), debited);
                for (address, payout) in &execution.payouts {
                    *self.balances.entry(address.clone()).or_default() += payout;
                }
                result.return_value = execution.return_value;
                result.log = execution
                    .events
                    .iter()
                    .map(|event| event.encode().to_vec())
                    .collect();
                reaction = self.bot.apply_events(&execution.events, stake, clock);
            }
            Err(reason) => {
                debug!(round, %caller, reason, "call reverted");
                result.revert = Some(reason.to_string());
            }
        }
        self.history.push(result);
        reaction
    }

    /// Apply a fully signed transaction, returning the bot's reaction to it.
    fn apply(&mut self, tx: &ChannelTx) -> Option<(Call, u64)> {
        self.clock += 1;
        let mut reaction = None;
        for update in &tx.updates {
            match update {
                Update::NewContract {
                    owner, call_data, ..
                } => {
                    let Ok(Call::Init {
                        player0,
                        player1,
                        reaction_time,
                    }) = Call::decode(call_data.as_slice())
                    else {
                        warn!(round = tx.round, "deployment without init call");
                        continue;
                    };
                    let address = Address::contract(owner, tx.round);
                    info!(%address, round = tx.round, "contract deployed");
                    self.contract = Some((
                        address,
                        HandContract::init(player0, player1, reaction_time, self.clock),
                    ));
                    self.bot.deployed(self.clock);
                }
                Update::CallContract {
                    caller,
                    contract,
                    amount,
                    call_data,
                } => {
                    reaction = self.execute(tx.round, caller, contract, *amount, call_data);
                }
            }
        }
        self.round = tx.round;
        self.round_hidden = false;
        if self.faults.dropped_updates > 0 {
            self.faults.dropped_updates -= 1;
            if let Some(sender) = &self.events {
                sender.discard(ChannelEvent::StateChanged(tx.clone()));
            }
        } else {
            self.emit(ChannelEvent::StateChanged(tx.clone()));
        }
        self.relay_bot_log();
        reaction
    }
}

/// In-process channel service with a bot on the initiator side.
#[derive(Clone)]
pub struct Simulator {
    inner: Arc<Mutex<Channel>>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let bot = Bot::new(Keypair::from_seed(config.bot_seed), config.bot_seed);
        Self {
            inner: Arc::new(Mutex::new(Channel {
                config,
                bot,
                responder: None,
                channel_id: None,
                fsm_id: None,
                status: ChannelStatus::Disconnected,
                round: 0,
                round_hidden: false,
                generation: 0,
                clock: 1_000,
                tx_counter: 0,
                balances: HashMap::new(),
                contract: None,
                history: Vec::new(),
                attempts: HashMap::new(),
                faults: Faults::default(),
                events: None,
                signer: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channel> {
        match self.inner.lock() {
            Ok(channel) => channel,
            Err(poisoned) => {
                warn!("channel lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn bot_address(&self) -> Address {
        self.lock().bot.address().clone()
    }

    /// Parameters of a channel between the bot and `responder`.
    pub fn channel_config_for(&self, responder: &Address, host: &str, port: u16) -> ChannelConfig {
        let channel = self.lock();
        ChannelConfig {
            initiator_id: channel.bot.address().clone(),
            responder_id: responder.clone(),
            initiator_amount: channel.config.deposit,
            responder_amount: channel.config.deposit,
            push_amount: 0,
            channel_reserve: channel.config.channel_reserve,
            host: host.to_string(),
            port,
            lock_period: channel.config.lock_period,
            timeouts: Timeouts::default(),
            existing_channel_id: None,
            existing_fsm_id: None,
        }
    }

    /// Whether a channel is currently held by someone other than `responder`.
    pub fn is_busy_for(&self, responder: &Address) -> bool {
        let channel = self.lock();
        !channel.status.is_terminal()
            && channel.status != ChannelStatus::Disconnected
            && channel
                .responder
                .as_ref()
                .is_some_and(|current| current != responder)
    }

    pub fn status(&self) -> ChannelStatus {
        self.lock().status
    }

    pub fn round(&self) -> u64 {
        self.lock().round
    }

    pub fn contract_address(&self) -> Option<Address> {
        self.lock()
            .contract
            .as_ref()
            .map(|(address, _)| address.clone())
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.lock().balance(address)
    }

    pub fn set_balance(&self, address: &Address, amount: u64) {
        self.lock().balances.insert(address.clone(), amount);
    }

    pub fn history(&self) -> Vec<CallResult> {
        self.lock().history.clone()
    }

    /// Applied calls to `entrypoint`, including reverted ones.
    pub fn calls_to(&self, entrypoint_name: &str) -> usize {
        self.lock()
            .history
            .iter()
            .filter(|result| entrypoint(&result.call_data) == entrypoint_name)
            .count()
    }

    /// Calls to `entrypoint` proposed by the responder, accepted or not.
    pub fn attempts(&self, entrypoint_name: &str) -> usize {
        self.lock()
            .attempts
            .get(entrypoint_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn script_bot(&self, moves: impl IntoIterator<Item = Move>) {
        self.lock().bot.script(moves);
    }

    pub fn silence_bot(&self, silent: bool) {
        self.lock().bot.set_silent(silent);
    }

    pub fn advance_clock(&self, seconds: u64) {
        self.lock().clock += seconds;
    }

    /// Refuse the next call to `entrypoint` with `reason`.
    pub fn reject_next(&self, entrypoint_name: &'static str, reason: RejectReason) {
        self.lock()
            .faults
            .rejections
            .entry(entrypoint_name)
            .or_default()
            .push_back(reason);
    }

    /// Apply the next call to `entrypoint` but report a timeout to the caller.
    pub fn lose_next_ack(&self, entrypoint_name: &'static str) {
        *self
            .lock()
            .faults
            .lost_acks
            .entry(entrypoint_name)
            .or_default() += 1;
    }

    /// Make the next `count` historical call lookups for `caller` hang.
    pub fn stall_fetches_for(&self, caller: &Address, count: usize) {
        *self
            .lock()
            .faults
            .stalled_fetches
            .entry(caller.clone())
            .or_default() += count;
    }

    /// Drop the next `count` state updates as if the event buffer had overflowed.
    pub fn drop_updates(&self, count: usize) {
        self.lock().faults.dropped_updates += count;
    }

    /// Have the bot propose `code` instead of the audited contract.
    pub fn deploy_hostile_code(&self, code: Vec<u8>) {
        self.lock().faults.hostile_code = Some(code);
    }

    /// Drop the transport from the service side.
    pub fn drop_connection(&self) {
        let mut channel = self.lock();
        channel.set_status(ChannelStatus::Disconnected);
        channel.detach();
    }

    /// The channel can no longer be used or resumed.
    pub fn kill(&self) {
        let mut channel = self.lock();
        channel.set_status(ChannelStatus::Died);
        channel.detach();
        channel.channel_id = None;
        channel.fsm_id = None;
    }

    fn attach(
        &self,
        config: &ChannelConfig,
        signer: Arc<dyn Sign>,
        reconnect: bool,
    ) -> Result<(LocalSession, EventStream)> {
        let mut channel = self.lock();
        let (sender, stream) = events::channel(channel.config.event_buffer);
        if reconnect {
            let known = channel.channel_id.is_some()
                && channel.channel_id == config.existing_channel_id
                && channel.fsm_id == config.existing_fsm_id
                && channel.responder.as_ref() == Some(&config.responder_id);
            if !known || channel.status.is_terminal() {
                return Err(Error::Rejected(RejectReason::Other(
                    "unknown channel".to_string(),
                )));
            }
        } else {
            if config.initiator_id != *channel.bot.address() {
                return Err(Error::Rejected(RejectReason::Declined(
                    "initiator is not this bot".to_string(),
                )));
            }
            channel.responder = Some(config.responder_id.clone());
            channel.balances = HashMap::from([
                (config.initiator_id.clone(), config.initiator_amount),
                (config.responder_id.clone(), config.responder_amount),
            ]);
            channel.contract = None;
            channel.history.clear();
            channel.round = 0;
            channel.channel_id = None;
            channel.fsm_id = None;
        }

        channel.generation += 1;
        channel.events = Some(sender);
        channel.signer = Some(signer);
        let session = LocalSession {
            simulator: self.clone(),
            generation: channel.generation,
            address: config.responder_id.clone(),
        };
        if reconnect {
            channel.round_hidden = true;
            channel.set_status(ChannelStatus::Open);
        } else {
            channel.set_status(ChannelStatus::Connecting);
            channel.set_status(ChannelStatus::Accepted);
        }
        Ok((session, stream))
    }

    async fn open(&self, session: &LocalSession) -> Result<()> {
        let (request, signer) = {
            let channel = self.lock();
            let request = SignRequest {
                tag: SignTag::Open,
                tx: channel.next_tx(Vec::new()),
            };
            (request, channel.signer()?)
        };
        let signature = match signer.sign(&request).await {
            Ok(signature) => signature,
            Err(err) => {
                let mut channel = self.lock();
                channel.set_status(ChannelStatus::Died);
                channel.detach();
                return Err(err.into());
            }
        };

        let mut channel = self.lock();
        if !verify_signature(&session.address, &request.payload(), &signature) {
            channel.set_status(ChannelStatus::Died);
            channel.detach();
            return Err(Error::Rejected(RejectReason::Declined(
                "invalid open signature".to_string(),
            )));
        }
        channel.set_status(ChannelStatus::HalfSigned);
        channel.set_status(ChannelStatus::Signed);
        channel.round = request.tx.round;
        channel.clock += 1;
        let channel_id = format!("ch_{:08x}", channel.generation);
        let fsm_id = format!("fsm_{:08x}", channel.generation);
        channel.channel_id = Some(channel_id);
        channel.fsm_id = Some(fsm_id);
        channel.set_status(ChannelStatus::Open);
        let hash = channel.next_hash();
        channel.emit(ChannelEvent::OnChainTx(OnChainTx {
            hash,
            info: "channel_create_tx".to_string(),
        }));
        info!(channel_id = ?channel.channel_id, responder = %session.address, "channel open");
        Ok(())
    }

    /// The bot proposes deploying the hand contract; the responder must co-sign.
    async fn deploy(&self, session: &LocalSession) -> Result<()> {
        let (request, signer) = {
            let channel = self.lock();
            channel.ensure_live(session.generation)?;
            let code = channel
                .faults
                .hostile_code
                .clone()
                .unwrap_or_else(|| channel.config.contract_code.clone());
            let init = Call::Init {
                player0: session.address.clone(),
                player1: channel.bot.address().clone(),
                reaction_time: channel.config.reaction_time,
            };
            let tx = channel.next_tx(vec![Update::NewContract {
                owner: channel.bot.address().clone(),
                code,
                deposit: 0,
                call_data: init.encode().to_vec(),
            }]);
            (
                SignRequest {
                    tag: SignTag::UpdateAck,
                    tx,
                },
                channel.signer()?,
            )
        };

        let accepted = match signer.sign(&request).await {
            Ok(signature) => verify_signature(&session.address, &request.payload(), &signature),
            Err(err) => {
                warn!(%err, "responder declined contract deployment");
                false
            }
        };
        let mut channel = self.lock();
        channel.ensure_live(session.generation)?;
        if accepted && request.tx.round == channel.round + 1 {
            channel.apply(&request.tx);
        }
        Ok(())
    }

    /// Let the bot make `call`, co-signed by the responder.
    async fn bot_turn(&self, session: &LocalSession, call: Call, amount: u64) {
        let prepared = {
            let channel = self.lock();
            let bot = channel.bot.address().clone();
            match (channel.ensure_live(session.generation), &channel.contract) {
                (Ok(()), Some((contract, _))) if channel.balance(&bot) >= amount => channel
                    .signer()
                    .ok()
                    .map(|signer| {
                        let tx = channel.next_tx(vec![Update::CallContract {
                            caller: bot,
                            contract: contract.clone(),
                            amount,
                            call_data: call.encode().to_vec(),
                        }]);
                        (
                            SignRequest {
                                tag: SignTag::UpdateAck,
                                tx,
                            },
                            signer,
                        )
                    }),
                _ => None,
            }
        };
        let Some((request, signer)) = prepared else {
            let mut channel = self.lock();
            let clock = channel.clock;
            channel.bot.settled(&call, false, clock);
            channel.relay_bot_log();
            return;
        };

        let accepted = match signer.sign(&request).await {
            Ok(signature) => verify_signature(&session.address, &request.payload(), &signature),
            Err(err) => {
                warn!(%err, "responder declined bot update");
                false
            }
        };
        let mut channel = self.lock();
        let applied = accepted
            && channel.ensure_live(session.generation).is_ok()
            && request.tx.round == channel.round + 1;
        if applied {
            channel.apply(&request.tx);
        }
        let clock = channel.clock;
        channel.bot.settled(&call, applied, clock);
        channel.relay_bot_log();
    }
}

impl Connector for Simulator {
    type Session = LocalSession;

    async fn initialize(
        &self,
        config: &ChannelConfig,
        signer: Arc<dyn Sign>,
    ) -> Result<(LocalSession, EventStream)> {
        let (session, stream) = self.attach(config, signer, false)?;
        self.open(&session).await?;
        self.deploy(&session).await?;
        Ok((session, stream))
    }

    async fn reconnect(
        &self,
        config: &ChannelConfig,
        signer: Arc<dyn Sign>,
    ) -> Result<(LocalSession, EventStream)> {
        let (session, stream) = self.attach(config, signer, true)?;
        info!(channel_id = ?config.existing_channel_id, "channel resumed");
        Ok((session, stream))
    }
}

/// The responder's handle on the simulated channel.
pub struct LocalSession {
    simulator: Simulator,
    generation: u64,
    address: Address,
}

impl Session for LocalSession {
    fn channel_id(&self) -> String {
        self.simulator.lock().channel_id.clone().unwrap_or_default()
    }

    fn fsm_id(&self) -> String {
        self.simulator.lock().fsm_id.clone().unwrap_or_default()
    }

    fn round(&self) -> Option<u64> {
        let channel = self.simulator.lock();
        if channel.round_hidden || channel.round == 0 {
            return None;
        }
        Some(channel.round)
    }

    fn status(&self) -> ChannelStatus {
        let channel = self.simulator.lock();
        if channel.generation != self.generation {
            return ChannelStatus::Disconnected;
        }
        channel.status
    }

    async fn call_contract(&self, call: ContractCall) -> Result<CallReceipt> {
        let (request, signer) =
            self.simulator
                .lock()
                .propose(self.generation, &self.address, &call)?;
        let signature = signer.sign(&request).await?;

        let (reaction, lost_ack) = {
            let mut channel = self.simulator.lock();
            channel.ensure_live(self.generation)?;
            if request.tx.round != channel.round + 1 {
                return Err(Error::Rejected(RejectReason::Conflict));
            }
            if !verify_signature(&self.address, &request.payload(), &signature) {
                return Err(Error::Rejected(RejectReason::Declined(
                    "invalid signature".to_string(),
                )));
            }
            let reaction = channel.apply(&request.tx);
            let name = entrypoint(&call.call_data);
            let lost_ack = match channel.faults.lost_acks.get_mut(name) {
                Some(pending) if *pending > 0 => {
                    *pending -= 1;
                    true
                }
                _ => false,
            };
            (reaction, lost_ack)
        };

        if let Some((bot_call, amount)) = reaction {
            self.simulator.bot_turn(self, bot_call, amount).await;
        }
        if lost_ack {
            warn!(round = request.tx.round, "dropping acknowledgement");
            return Err(Error::Rejected(RejectReason::Timeout));
        }
        Ok(CallReceipt { tx: request.tx })
    }

    async fn balances(&self, accounts: &[Address]) -> Result<HashMap<Address, u64>> {
        let channel = self.simulator.lock();
        if channel.generation != self.generation {
            return Err(Error::SessionClosed);
        }
        Ok(accounts
            .iter()
            .map(|account| (account.clone(), channel.balance(account)))
            .collect())
    }

    async fn get_contract_call(
        &self,
        caller: &Address,
        contract: &Address,
        round: u64,
    ) -> Result<CallResult> {
        let stalled = match self.simulator.lock().faults.stalled_fetches.get_mut(caller) {
            Some(pending) if *pending > 0 => {
                *pending -= 1;
                true
            }
            _ => false,
        };
        if stalled {
            debug!(%caller, round, "stalling call lookup");
            futures::future::pending::<()>().await;
        }
        self.simulator
            .lock()
            .history
            .iter()
            .rev()
            .find(|result| {
                &result.caller == caller && &result.contract == contract && result.round == round
            })
            .cloned()
            .ok_or_else(|| Error::CallNotFound {
                caller: caller.clone(),
                contract: contract.clone(),
                round,
            })
    }

    async fn shutdown(&self) -> Result<OnChainTx> {
        let (request, signer) = {
            let mut channel = self.simulator.lock();
            channel.ensure_live(self.generation)?;
            channel.set_status(ChannelStatus::Closing);
            let request = SignRequest {
                tag: SignTag::Shutdown,
                tx: channel.next_tx(Vec::new()),
            };
            (request, channel.signer()?)
        };
        if let Err(err) = signer.sign(&request).await {
            self.simulator.lock().set_status(ChannelStatus::Open);
            return Err(err.into());
        }

        let mut channel = self.simulator.lock();
        channel.round = request.tx.round;
        channel.set_status(ChannelStatus::Closed);
        let tx = OnChainTx {
            hash: channel.next_hash(),
            info: "channel_close_mutual_tx".to_string(),
        };
        channel.emit(ChannelEvent::OnChainTx(tx.clone()));
        channel.detach();
        channel.channel_id = None;
        channel.fsm_id = None;
        info!(hash = %tx.hash, "channel closed");
        Ok(tx)
    }

    fn disconnect(&self) {
        let mut channel = self.simulator.lock();
        if channel.generation != self.generation {
            return;
        }
        if !channel.status.is_terminal() {
            channel.set_status(ChannelStatus::Disconnected);
        }
        channel.detach();
    }
}

impl LocalSession {
    pub fn address(&self) -> &Address {
        &self.address
    }
}
