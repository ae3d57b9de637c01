use crate::{
    Error, GameChannel, MemorySnapshotStore, Notification, Options, Phase, RetryPolicy,
    RoundPhase, SigningInterceptor, SnapshotStore,
};
use rand::{rngs::StdRng, SeedableRng};
use rochambeau_client::{
    BytecodeVerifier, Connector, ContractCall, DigestVerifier, RejectReason, Session, Sign,
};
use rochambeau_simulator::{Simulator, SimulatorConfig, HAND_CONTRACT_CODE};
use rochambeau_types::{
    hash_selection, log::OPEN_ROUND, Call, ChannelEvent, ChannelStatus, ChannelTx, Commitment,
    Keypair, Move, Round, Snapshot, TransactionLogs,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;

const STAKE: u64 = 10;
const DEPOSIT: u64 = 1_000;

fn options() -> Options {
    Options {
        stake: STAKE,
        fetch_timeout: Duration::from_secs(1),
        verify_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(10),
            max: Duration::from_millis(40),
        },
        log_retention_rounds: 16,
        notification_buffer: 64,
    }
}

fn verifier() -> Arc<dyn BytecodeVerifier> {
    Arc::new(DigestVerifier::for_code(HAND_CONTRACT_CODE))
}

fn game(
    simulator: &Simulator,
    store: &MemorySnapshotStore,
) -> GameChannel<Simulator, MemorySnapshotStore> {
    GameChannel::new(
        simulator.clone(),
        store.clone(),
        Keypair::from_seed(42),
        verifier(),
        options(),
    )
    .with_seed(7)
}

async fn open_game() -> (
    Simulator,
    MemorySnapshotStore,
    GameChannel<Simulator, MemorySnapshotStore>,
) {
    let simulator = Simulator::new(SimulatorConfig::default());
    let store = MemorySnapshotStore::default();
    let mut game = game(&simulator, &store);
    let config = simulator.channel_config_for(game.address(), "localhost", 3001);
    game.open(config).await.unwrap();
    (simulator, store, game)
}

fn finished_rounds(receiver: &mut broadcast::Receiver<Notification>) -> Vec<Round> {
    let mut rounds = Vec::new();
    while let Ok(notification) = receiver.try_recv() {
        if let Notification::RoundFinished(round) = notification {
            rounds.push(round);
        }
    }
    rounds
}

fn errors(receiver: &mut broadcast::Receiver<Notification>) -> Vec<String> {
    let mut errors = Vec::new();
    while let Ok(notification) = receiver.try_recv() {
        if let Notification::Error(message) = notification {
            errors.push(message);
        }
    }
    errors
}

#[tokio::test]
async fn test_open_binds_verified_contract() {
    let (simulator, store, game) = open_game().await;
    assert_eq!(game.phase(), Phase::Open(RoundPhase::AwaitingSelection));
    assert_eq!(game.round().index, 1);
    assert_eq!(
        game.contract().map(|binding| binding.address),
        simulator.contract_address()
    );
    assert_eq!(game.balances().user, DEPOSIT);
    assert_eq!(game.balances().bot, DEPOSIT);

    let opened = game.logs().user.entries(OPEN_ROUND);
    assert!(opened
        .iter()
        .any(|entry| entry.on_chain && entry.id.is_some()));

    let snapshot = store.load().unwrap().unwrap();
    assert_eq!(snapshot.contract_creation_round, 2);
    assert_eq!(snapshot.round.index, 1);
}

#[tokio::test]
async fn test_user_wins_round() {
    let (simulator, _, mut game) = open_game().await;
    let mut receiver = game.subscribe();
    simulator.script_bot([Move::Scissors]);

    game.set_user_selection(Move::Rock).await.unwrap();

    let finished = finished_rounds(&mut receiver);
    assert_eq!(finished.len(), 1);
    let round = &finished[0];
    assert_eq!(round.index, 1);
    assert!(round.is_completed);
    assert!(!round.user_in_action);
    assert_eq!(round.user_selection, Move::Rock);
    assert_eq!(round.bot_selection, Move::Scissors);
    assert_eq!(round.winner.as_ref(), Some(game.address()));

    assert_eq!(game.round().index, 2);
    assert!(game.round().hash_key.is_none());
    assert_eq!(game.phase(), Phase::Open(RoundPhase::AwaitingSelection));
    assert_eq!(game.balances().user, DEPOSIT + STAKE);
    assert_eq!(game.balances().bot, DEPOSIT - STAKE);
    assert_eq!(simulator.calls_to("reveal"), 1);

    // The revealed key opens the published commitment
    let binding = game.contract().unwrap();
    let history = simulator.history();
    let hash = history
        .iter()
        .find_map(|result| match binding.decode_call(&result.call_data) {
            Ok(Call::ProvideHash { hash }) => Some(hash),
            _ => None,
        })
        .unwrap();
    let (key, selection) = history
        .iter()
        .find_map(|result| match binding.decode_call(&result.call_data) {
            Ok(Call::Reveal { key, selection }) => Some((key, selection)),
            _ => None,
        })
        .unwrap();
    assert_eq!(selection, Move::Rock);
    assert!(Commitment::verify(&hash, &key, Move::Rock));
}

#[tokio::test]
async fn test_draw_refunds_both() {
    let (simulator, _, mut game) = open_game().await;
    let mut receiver = game.subscribe();
    simulator.script_bot([Move::Paper]);

    game.set_user_selection(Move::Paper).await.unwrap();

    let finished = finished_rounds(&mut receiver);
    assert_eq!(finished.len(), 1);
    assert!(finished[0].is_draw());
    assert_eq!(game.round().index, 2);
    assert_eq!(game.balances().user, DEPOSIT);
    assert_eq!(game.balances().bot, DEPOSIT);
}

#[tokio::test]
async fn test_user_loses_round() {
    let (simulator, _, mut game) = open_game().await;
    let mut receiver = game.subscribe();
    simulator.script_bot([Move::Paper]);

    game.set_user_selection(Move::Rock).await.unwrap();

    let finished = finished_rounds(&mut receiver);
    assert_eq!(finished[0].winner, Some(simulator.bot_address()));
    assert_eq!(game.balances().user, DEPOSIT - STAKE);
}

#[tokio::test]
async fn test_none_selection_is_rejected() {
    let (simulator, _, mut game) = open_game().await;
    assert!(matches!(
        game.set_user_selection(Move::None).await,
        Err(Error::InvalidSelection(Move::None))
    ));
    assert_eq!(simulator.attempts("provide_hash"), 0);
    assert!(game.round().is_consistent());
}

#[tokio::test]
async fn test_commit_is_idempotent_while_waiting() {
    let (simulator, _, mut game) = open_game().await;
    simulator.silence_bot(true);

    game.set_user_selection(Move::Rock).await.unwrap();
    assert_eq!(game.phase(), Phase::Open(RoundPhase::AwaitingBotMove));
    assert!(game.round().user_in_action);

    game.set_user_selection(Move::Paper).await.unwrap();
    assert_eq!(simulator.attempts("provide_hash"), 1);
    assert_eq!(game.round().user_selection, Move::Rock);
    assert!(game.round().is_consistent());
}

#[tokio::test]
async fn test_autoplay_stops_after_budget() {
    let (simulator, _, mut game) = open_game().await;

    game.engage_autoplay(3).await.unwrap();

    assert_eq!(simulator.calls_to("provide_hash"), 3);
    assert_eq!(game.round().index, 4);
    assert!(!game.autoplay().enabled);
    assert_eq!(game.autoplay().start_round, 1);
    assert_eq!(game.phase(), Phase::Open(RoundPhase::AwaitingSelection));
}

#[tokio::test]
async fn test_autoplay_after_completed_round_starts_next() {
    let (simulator, _, mut game) = open_game().await;
    game.set_user_selection(Move::Rock).await.unwrap();
    assert_eq!(game.round().index, 2);

    game.engage_autoplay(1).await.unwrap();
    assert_eq!(game.autoplay().start_round, 2);
    assert_eq!(simulator.calls_to("provide_hash"), 2);
    assert_eq!(game.round().index, 3);
    assert!(!game.autoplay().enabled);
}

#[tokio::test]
async fn test_start_new_round_resets_fields() {
    let (_, _, mut game) = open_game().await;
    for expected in 2..=4 {
        game.start_new_round().await.unwrap();
        let round = game.round();
        assert_eq!(round.index, expected);
        assert_eq!(round.user_selection, Move::None);
        assert_eq!(round.bot_selection, Move::None);
        assert!(round.hash_key.is_none());
        assert!(!round.is_completed);
        assert!(round.winner.is_none());
    }
}

#[tokio::test]
async fn test_finish_sets_winner_exactly() {
    let (simulator, _, mut game) = open_game().await;
    let mut receiver = game.subscribe();
    let bot = simulator.bot_address();

    game.finish_game_round(Some(bot.clone())).await.unwrap();

    let finished = finished_rounds(&mut receiver);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].winner, Some(bot));
    assert!(finished[0].is_completed);
    assert!(!finished[0].user_in_action);
    assert_eq!(game.round().index, 2);
}

#[tokio::test]
async fn test_resume_reveals_after_bot_moved() {
    let simulator = Simulator::new(SimulatorConfig::default());
    let keypair = Keypair::from_seed(42);
    let config = simulator.channel_config_for(keypair.address(), "localhost", 3001);

    // Play the commit by hand, then vanish before revealing
    let signer = Arc::new(SigningInterceptor::new(
        keypair.clone(),
        verifier(),
        Duration::from_secs(1),
    ));
    let (session, _events) = simulator
        .initialize(&config, signer.clone() as Arc<dyn Sign>)
        .await
        .unwrap();
    let binding = signer.contract().unwrap();
    simulator.script_bot([Move::Scissors]);
    let commitment = hash_selection(Move::Rock, &mut StdRng::seed_from_u64(1));
    session
        .call_contract(ContractCall {
            contract: binding.address.clone(),
            call_data: binding.encode_call(&Call::ProvideHash {
                hash: commitment.hash,
            }),
            amount: STAKE,
        })
        .await
        .unwrap();
    assert_eq!(simulator.round(), 4);

    let mut round = Round::new(STAKE);
    round.user_selection = Move::Rock;
    round.hash_key = Some(commitment.key);
    round.user_in_action = true;
    let snapshot = Snapshot {
        keypair: keypair.clone(),
        channel_id: Some(session.channel_id()),
        fsm_id: Some(session.fsm_id()),
        channel_config: config,
        channel_round: Some(simulator.round()),
        round,
        transaction_logs: TransactionLogs::default(),
        contract_creation_round: binding.creation_round,
    };
    session.disconnect();

    let store = MemorySnapshotStore::with_raw(snapshot.to_json().unwrap());
    let mut game = GameChannel::new(
        simulator.clone(),
        store.clone(),
        Keypair::from_seed(99),
        verifier(),
        options(),
    );
    let mut receiver = game.subscribe();
    assert!(game.resume().await.unwrap());

    assert_eq!(game.address(), keypair.address());
    assert_eq!(simulator.calls_to("reveal"), 1);
    assert_eq!(game.round().index, 2);
    let finished = finished_rounds(&mut receiver);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].bot_selection, Move::Scissors);
    assert_eq!(finished[0].winner.as_ref(), Some(keypair.address()));
    assert_eq!(store.load().unwrap().unwrap().round.index, 2);
}

#[tokio::test]
async fn test_resume_while_waiting_for_bot() {
    let (simulator, store, mut first) = open_game().await;
    simulator.silence_bot(true);
    first.set_user_selection(Move::Rock).await.unwrap();

    simulator.drop_connection();
    first.process_events().await.unwrap();
    assert_eq!(first.phase(), Phase::Disconnected);

    let mut second = game(&simulator, &store);
    assert!(second.resume().await.unwrap());
    assert_eq!(second.phase(), Phase::Open(RoundPhase::AwaitingBotMove));
    assert!(second.round().user_in_action);
    assert_eq!(second.round().user_selection, Move::Rock);
    assert!(second.round().hash_key.is_some());
    assert_eq!(simulator.attempts("provide_hash"), 1);
    assert_eq!(simulator.status(), ChannelStatus::Open);
}

#[tokio::test]
async fn test_resume_resubmits_commit_that_never_landed() {
    let simulator = Simulator::new(SimulatorConfig::default());
    let keypair = Keypair::from_seed(42);
    let config = simulator.channel_config_for(keypair.address(), "localhost", 3001);

    // Save a commit as in flight, then vanish before it reaches the channel
    let signer = Arc::new(SigningInterceptor::new(
        keypair.clone(),
        verifier(),
        Duration::from_secs(1),
    ));
    let (session, _events) = simulator
        .initialize(&config, signer.clone() as Arc<dyn Sign>)
        .await
        .unwrap();
    let binding = signer.contract().unwrap();
    simulator.script_bot([Move::Scissors]);
    let commitment = hash_selection(Move::Rock, &mut StdRng::seed_from_u64(1));

    let mut round = Round::new(STAKE);
    round.user_selection = Move::Rock;
    round.hash_key = Some(commitment.key);
    round.user_in_action = true;
    let snapshot = Snapshot {
        keypair: keypair.clone(),
        channel_id: Some(session.channel_id()),
        fsm_id: Some(session.fsm_id()),
        channel_config: config,
        channel_round: Some(simulator.round()),
        round,
        transaction_logs: TransactionLogs::default(),
        contract_creation_round: binding.creation_round,
    };
    session.disconnect();

    let store = MemorySnapshotStore::with_raw(snapshot.to_json().unwrap());
    let mut game = GameChannel::new(
        simulator.clone(),
        store.clone(),
        Keypair::from_seed(99),
        verifier(),
        options(),
    );
    let mut receiver = game.subscribe();
    assert!(game.resume().await.unwrap());

    assert_eq!(simulator.calls_to("provide_hash"), 1);
    assert_eq!(simulator.calls_to("reveal"), 1);
    assert_eq!(game.round().index, 2);
    assert!(!game.round().user_in_action);
    let finished = finished_rounds(&mut receiver);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].user_selection, Move::Rock);
    assert_eq!(finished[0].winner.as_ref(), Some(keypair.address()));
}

#[tokio::test]
async fn test_unsent_commit_in_later_round_is_resubmitted() {
    let (simulator, store, mut first) = open_game().await;
    first.set_user_selection(Move::Rock).await.unwrap();
    assert_eq!(first.round().index, 2);

    simulator.drop_connection();
    first.process_events().await.unwrap();

    // Reload a copy of the game that believes its next commit is in flight
    let mut snapshot = store.load().unwrap().unwrap();
    let commitment = hash_selection(Move::Paper, &mut StdRng::seed_from_u64(3));
    snapshot.round.user_selection = Move::Paper;
    snapshot.round.hash_key = Some(commitment.key);
    snapshot.round.user_in_action = true;
    store.save(&snapshot);

    let mut second = game(&simulator, &store);
    assert!(second.resume().await.unwrap());
    assert_eq!(simulator.calls_to("provide_hash"), 2);
    assert_eq!(simulator.calls_to("reveal"), 2);
    assert_eq!(second.round().index, 3);

    // Nothing is left to reconcile afterwards
    second.handle_last_contract_call().await.unwrap();
    assert_eq!(simulator.attempts("provide_hash"), 2);
    assert_eq!(second.round().index, 3);
}

#[tokio::test]
async fn test_resume_without_snapshot() {
    let simulator = Simulator::new(SimulatorConfig::default());
    let store = MemorySnapshotStore::default();
    let mut game = game(&simulator, &store);
    assert!(!game.resume().await.unwrap());
    assert_eq!(game.phase(), Phase::Idle);
}

#[tokio::test]
async fn test_corrupted_snapshot_is_discarded() {
    let (_, store, _) = open_game().await;
    let mut value: serde_json::Value = serde_json::from_slice(&store.raw().unwrap()).unwrap();
    value
        .as_object_mut()
        .unwrap()
        .remove("contractCreationRound");
    let corrupted = MemorySnapshotStore::with_raw(serde_json::to_vec(&value).unwrap());

    let simulator = Simulator::new(SimulatorConfig::default());
    let mut game = game(&simulator, &corrupted);
    let mut receiver = game.subscribe();
    assert!(matches!(game.resume().await, Err(Error::Corrupted(_))));
    assert!(corrupted.raw().is_none());
    assert_eq!(game.phase(), Phase::Idle);
    assert_eq!(simulator.status(), ChannelStatus::Disconnected);
    assert_eq!(errors(&mut receiver).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_lookup_falls_back_to_bot() {
    let (simulator, _, mut game) = open_game().await;
    simulator.script_bot([Move::Scissors]);
    simulator.stall_fetches_for(game.address(), 1);

    let start = tokio::time::Instant::now();
    game.set_user_selection(Move::Rock).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(game.round().index, 2);
    assert_eq!(simulator.calls_to("reveal"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_lookups_recover_from_last_call() {
    let (simulator, _, mut game) = open_game().await;
    simulator.script_bot([Move::Scissors]);
    simulator.stall_fetches_for(game.address(), 1);
    simulator.stall_fetches_for(&simulator.bot_address(), 1);

    game.set_user_selection(Move::Rock).await.unwrap();
    assert_eq!(game.round().index, 1);
    assert!(game.round().bot_selection.is_none());
    assert_eq!(simulator.calls_to("reveal"), 0);

    game.handle_last_contract_call().await.unwrap();
    assert_eq!(game.round().index, 2);
    assert_eq!(simulator.calls_to("reveal"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_result_lookup_is_retried() {
    let (simulator, _, mut game) = open_game().await;
    simulator.script_bot([Move::Scissors]);
    simulator.stall_fetches_for(game.address(), 2);

    let start = tokio::time::Instant::now();
    game.set_user_selection(Move::Rock).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(simulator.calls_to("reveal"), 1);
    assert_eq!(game.round().index, 2);
}

#[tokio::test]
async fn test_lost_updates_are_reconciled() {
    let (simulator, _, mut game) = open_game().await;
    simulator.script_bot([Move::Scissors]);
    simulator.drop_updates(2);

    game.set_user_selection(Move::Rock).await.unwrap();

    assert_eq!(simulator.calls_to("reveal"), 1);
    assert_eq!(game.round().index, 2);
}

#[tokio::test]
async fn test_conflict_is_retried() {
    let (simulator, _, mut game) = open_game().await;
    simulator.reject_next("provide_hash", RejectReason::Conflict);

    game.set_user_selection(Move::Rock).await.unwrap();

    assert_eq!(simulator.attempts("provide_hash"), 2);
    assert_eq!(simulator.calls_to("provide_hash"), 1);
    assert_eq!(game.round().index, 2);
}

#[tokio::test]
async fn test_lost_ack_is_reconciled() {
    let (simulator, _, mut game) = open_game().await;
    simulator.lose_next_ack("provide_hash");

    game.set_user_selection(Move::Rock).await.unwrap();

    assert_eq!(simulator.attempts("provide_hash"), 1);
    assert_eq!(simulator.calls_to("provide_hash"), 1);
    assert_eq!(simulator.calls_to("reveal"), 1);
    assert_eq!(game.round().index, 2);
}

#[tokio::test]
async fn test_declined_commit_resets_round() {
    let (simulator, _, mut game) = open_game().await;
    simulator.reject_next("provide_hash", RejectReason::Declined("busy".into()));

    let err = game.set_user_selection(Move::Rock).await.unwrap_err();
    assert!(matches!(
        err,
        Error::SelectionRejected(RejectReason::Declined(_))
    ));
    assert!(!game.round().user_in_action);
    assert_eq!(game.round().user_selection, Move::None);
    assert!(game.round().hash_key.is_none());
    assert_eq!(game.phase(), Phase::Open(RoundPhase::AwaitingSelection));

    game.set_user_selection(Move::Rock).await.unwrap();
    assert_eq!(game.round().index, 2);
}

#[tokio::test]
async fn test_reveal_failure_is_bounded() {
    let (simulator, _, mut game) = open_game().await;
    for _ in 0..3 {
        simulator.reject_next("reveal", RejectReason::Other("unavailable".into()));
    }

    let err = game.set_user_selection(Move::Rock).await.unwrap_err();
    assert!(matches!(err, Error::RevealFailed { attempts: 3, .. }));
    assert!(!game.round().user_in_action);
    assert!(game.round().can_reveal());
    assert_eq!(simulator.attempts("reveal"), 3);

    game.reveal_round_result().await.unwrap();
    assert_eq!(game.round().index, 2);
    assert_eq!(simulator.calls_to("reveal"), 1);
}

#[tokio::test]
async fn test_reveal_requires_bot_move() {
    let (simulator, _, mut game) = open_game().await;
    simulator.silence_bot(true);
    game.set_user_selection(Move::Rock).await.unwrap();

    assert!(matches!(
        game.reveal_round_result().await,
        Err(Error::Precondition {
            operation: "reveal",
            ..
        })
    ));
    assert_eq!(simulator.attempts("reveal"), 0);
}

#[tokio::test]
async fn test_hostile_bytecode_is_refused() {
    let simulator = Simulator::new(SimulatorConfig::default());
    simulator.deploy_hostile_code(b"drain everything".to_vec());
    let store = MemorySnapshotStore::default();
    let mut game = game(&simulator, &store);
    let config = simulator.channel_config_for(game.address(), "localhost", 3001);

    assert!(matches!(game.open(config).await, Err(Error::NoContract)));
    assert!(game.contract().is_none());
    assert!(store.raw().is_none());
    assert!(simulator.contract_address().is_none());
    assert!(matches!(
        game.set_user_selection(Move::Rock).await,
        Err(Error::NoContract)
    ));
}

#[tokio::test]
async fn test_insufficient_balance_halts_progress() {
    let (simulator, _, mut game) = open_game().await;
    let mut receiver = game.subscribe();
    simulator.set_balance(game.address(), 15);
    simulator.script_bot([Move::Paper]);

    game.set_user_selection(Move::Rock).await.unwrap();

    assert_eq!(game.round().index, 1);
    assert!(game.round().is_completed);
    assert_eq!(game.balances().user, 5);
    assert!(errors(&mut receiver)
        .iter()
        .any(|message| message.contains("insufficient balance")));
    assert!(matches!(
        game.set_user_selection(Move::Rock).await,
        Err(Error::RoundCompleted { index: 1 })
    ));
}

#[tokio::test]
async fn test_insufficient_balance_stops_autoplay() {
    let (simulator, _, mut game) = open_game().await;
    simulator.set_balance(game.address(), 15);
    simulator.script_bot([Move::Paper]);
    game.set_user_selection(Move::Rock).await.unwrap();
    assert!(game.round().is_completed);

    assert!(matches!(
        game.engage_autoplay(3).await,
        Err(Error::Precondition {
            operation: "autoplay",
            ..
        })
    ));
    assert!(!game.autoplay().enabled);
    assert_eq!(game.round().index, 1);
}

#[tokio::test]
async fn test_failed_step_disengages_autoplay() {
    let (simulator, _, mut game) = open_game().await;
    simulator.reject_next("provide_hash", RejectReason::Declined("busy".into()));

    assert!(game.engage_autoplay(3).await.is_err());
    assert!(!game.autoplay().enabled);
    assert!(!game.round().user_in_action);
}

#[tokio::test]
async fn test_dispute_no_move() {
    let (simulator, _, mut game) = open_game().await;
    let mut receiver = game.subscribe();
    simulator.silence_bot(true);
    game.set_user_selection(Move::Rock).await.unwrap();

    let err = game.dispute_no_move().await.unwrap_err();
    assert!(matches!(err, Error::DisputeRejected(reason) if reason == "too_early"));
    assert_eq!(game.round().index, 1);
    assert!(game.round().has_commit());

    simulator.advance_clock(30);
    game.dispute_no_move().await.unwrap();

    let finished = finished_rounds(&mut receiver);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].winner.as_ref(), Some(game.address()));
    assert_eq!(game.round().index, 2);
    assert_eq!(simulator.calls_to("player0_dispute_no_move"), 2);
}

#[tokio::test]
async fn test_dispute_requires_pending_commit() {
    let (_, _, mut game) = open_game().await;
    assert!(matches!(
        game.dispute_no_move().await,
        Err(Error::Precondition {
            operation: "dispute",
            ..
        })
    ));
}

#[tokio::test]
async fn test_close_settles_and_forgets() {
    let (simulator, store, mut game) = open_game().await;
    game.set_user_selection(Move::Rock).await.unwrap();

    let tx = game.close().await.unwrap();

    assert_eq!(game.phase(), Phase::Closed);
    assert_eq!(simulator.status(), ChannelStatus::Closed);
    assert!(store.raw().is_none());
    assert!(game
        .logs()
        .user
        .rounds()
        .flat_map(|(_, entries)| entries)
        .any(|entry| entry.id.as_deref() == Some(tx.hash.as_str())));
    assert!(matches!(
        game.set_user_selection(Move::Rock).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_channel_death_is_terminal() {
    let (simulator, store, mut game) = open_game().await;
    let mut receiver = game.subscribe();

    simulator.kill();
    game.process_events().await.unwrap();

    assert_eq!(game.phase(), Phase::Closed);
    assert!(store.raw().is_none());
    assert!(errors(&mut receiver)
        .iter()
        .any(|message| message == "channel died"));
}

#[tokio::test]
async fn test_bot_log_is_relayed() {
    let (simulator, _, mut game) = open_game().await;
    simulator.script_bot([Move::Scissors]);
    game.set_user_selection(Move::Rock).await.unwrap();

    assert!(!game.logs().bot.entries(OPEN_ROUND).is_empty());
    assert!(game
        .logs()
        .bot
        .entries(1)
        .iter()
        .any(|entry| entry.description == "player1_move(scissors)"));
}

#[tokio::test]
async fn test_logs_are_pruned() {
    let simulator = Simulator::new(SimulatorConfig::default());
    let store = MemorySnapshotStore::default();
    let mut game = GameChannel::new(
        simulator.clone(),
        store.clone(),
        Keypair::from_seed(42),
        verifier(),
        Options {
            log_retention_rounds: 2,
            ..options()
        },
    );
    let config = simulator.channel_config_for(game.address(), "localhost", 3001);
    game.open(config).await.unwrap();

    game.engage_autoplay(4).await.unwrap();
    assert_eq!(game.round().index, 5);
    let rounds: Vec<u64> = game.logs().user.rounds().map(|(round, _)| *round).collect();
    assert!(rounds.contains(&OPEN_ROUND));
    assert!(rounds.len() <= 3);
}

#[tokio::test]
async fn test_run_stops_when_channel_dies() {
    let (simulator, _, mut game) = open_game().await;
    simulator.kill();
    game.run().await.unwrap();
    assert_eq!(game.phase(), Phase::Closed);
}

#[tokio::test]
async fn test_disconnect_event_is_surfaced() {
    let (_, _, mut game) = open_game().await;
    let mut receiver = game.subscribe();
    game.handle_event(ChannelEvent::StatusChanged(ChannelStatus::Disconnected))
        .await
        .unwrap();
    assert_eq!(game.phase(), Phase::Disconnected);
    assert!(errors(&mut receiver)
        .iter()
        .any(|message| message == "channel disconnected"));
}

#[tokio::test]
async fn test_bot_selection_unlocks_reveal_phase() {
    let (simulator, store, mut game) = open_game().await;
    simulator.silence_bot(true);
    game.set_user_selection(Move::Rock).await.unwrap();

    game.set_bot_selection(Move::Paper);
    assert_eq!(game.phase(), Phase::Open(RoundPhase::Revealing));
    assert!(game.round().can_reveal());
    assert_eq!(
        store.load().unwrap().unwrap().round.bot_selection,
        Move::Paper
    );
}

#[tokio::test]
async fn test_opponent_call_is_reconciled_once() {
    let (simulator, _, mut game) = open_game().await;
    simulator.script_bot([Move::Scissors]);
    game.set_user_selection(Move::Rock).await.unwrap();
    assert_eq!(game.round().index, 2);

    // The bot's move at channel round 4 was already applied
    let bot_move = ChannelTx {
        round: 4,
        updates: Vec::new(),
    };
    game.handle_opponent_call(&bot_move).await.unwrap();
    assert_eq!(game.round().index, 2);
    assert_eq!(simulator.calls_to("reveal"), 1);
}

#[tokio::test]
async fn test_disengage_autoplay() {
    let (simulator, _, mut game) = open_game().await;
    simulator.silence_bot(true);
    game.engage_autoplay(5).await.unwrap();
    assert!(game.autoplay().enabled);
    assert!(game.round().user_in_action);

    game.disengage_autoplay();
    assert!(!game.autoplay().enabled);
    assert_eq!(simulator.calls_to("provide_hash"), 1);
}
