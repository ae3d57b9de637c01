use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use rand::rngs::OsRng;
use rochambeau_client::{BytecodeVerifier, CompilerVerifier, DigestVerifier, Matchmaker};
use rochambeau_player::{Config, FileSnapshotStore, GameChannel, ValidatedConfig};
use rochambeau_simulator::{Api, Simulator, SimulatorConfig, HAND_CONTRACT_CODE};
use rochambeau_types::Keypair;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

fn init_logging(config: &ValidatedConfig) {
    let builder = tracing_subscriber::fmt().with_max_level(config.log_level);
    if config.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_verifier(config: &ValidatedConfig) -> Result<Arc<dyn BytecodeVerifier>> {
    let Some((url, source_path)) = &config.compiler else {
        return Ok(Arc::new(DigestVerifier::for_code(HAND_CONTRACT_CODE)));
    };
    let source = std::fs::read_to_string(source_path)
        .with_context(|| format!("Could not read contract source {}", source_path.display()))?;
    let verifier =
        CompilerVerifier::new(url.as_str(), source).context("Invalid compiler service URL")?;
    Ok(Arc::new(verifier))
}

/// Serve the bundled matchmaker for `simulator` on an ephemeral local port.
async fn spawn_matchmaker(simulator: Simulator) -> Result<String> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .context("Could not bind matchmaker")?;
    let addr = listener
        .local_addr()
        .context("Could not read matchmaker address")?;
    let app = Api::new(simulator).router();
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            error!("matchmaker failed on {addr}: {err}");
        }
    });
    Ok(format!("http://{addr}"))
}

fn print_dry_run_report(config: &ValidatedConfig) {
    println!("dry-run report");
    match &config.keypair {
        Some(keypair) => println!("  account: {}", keypair.address()),
        None => println!("  account: <generated at startup>"),
    }
    match &config.matchmaking_url {
        Some(url) => println!("  matchmaker: {url}"),
        None => println!("  matchmaker: <bundled>"),
    }
    println!("  channel: {}:{}", config.host, config.port);
    println!("  snapshot: {}", config.snapshot_path.display());
    println!(
        "  verifier: {}",
        match &config.compiler {
            Some((url, source)) => format!("compiler {url} ({})", source.display()),
            None => "bundled digest".to_string(),
        }
    );
    println!(
        "  rounds: stake={} autoplay={} log_retention={}",
        config.options.stake, config.autoplay_rounds, config.options.log_retention_rounds
    );
    println!(
        "  timeouts: fetch={:?} verify={:?}",
        config.options.fetch_timeout, config.options.verify_timeout
    );
    println!(
        "  retry: attempts={} base={:?} max={:?}",
        config.options.retry.max_attempts, config.options.retry.base, config.options.retry.max
    );
}

async fn play(config: ValidatedConfig) -> Result<()> {
    let simulator = Simulator::new(SimulatorConfig {
        event_buffer: config.event_buffer,
        ..SimulatorConfig::default()
    });
    let verifier = build_verifier(&config)?;
    let store = FileSnapshotStore::new(&config.snapshot_path);
    let mut keypair = config
        .keypair
        .clone()
        .unwrap_or_else(|| Keypair::generate(&mut OsRng));

    let mut game = GameChannel::new(
        simulator.clone(),
        store.clone(),
        keypair.clone(),
        verifier.clone(),
        config.options.clone(),
    );
    let resumed = match game.resume().await {
        Ok(resumed) => resumed,
        Err(err) => {
            warn!(%err, "could not resume saved game, starting a new one");
            false
        }
    };

    if !resumed {
        let matchmaking_url = match &config.matchmaking_url {
            Some(url) => url.to_string(),
            None => spawn_matchmaker(simulator.clone()).await?,
        };
        let matchmaker =
            Matchmaker::new(&matchmaking_url).context("Invalid matchmaking URL")?;
        let channel_config = matchmaker
            .open_with_regeneration(&mut keypair, &mut OsRng, &config.host, config.port)
            .await
            .context("Matchmaking failed")?;
        game = GameChannel::new(
            simulator,
            store,
            keypair,
            verifier,
            config.options.clone(),
        );
        game.open(channel_config)
            .await
            .context("Could not open channel")?;
    }
    info!(account = %game.address(), index = game.round().index, resumed, "ready");

    if config.autoplay_rounds > 0 {
        game.engage_autoplay(config.autoplay_rounds)
            .await
            .context("Autoplay failed")?;
        while game.autoplay().enabled && game.next_event().await? {}
    }

    let balances = game
        .refresh_balances()
        .await
        .context("Could not read balances")?;
    println!(
        "round {}: user={} bot={}",
        game.round().index,
        balances.user,
        balances.bot
    );
    let tx = game.close().await.context("Could not close channel")?;
    println!("closed: {}", tx.hash);
    Ok(())
}

fn main() {
    if let Err(err) = main_result() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn main_result() -> Result<()> {
    // Parse arguments
    let matches = Command::new("rochambeau-player")
        .about("Play rock-paper-scissors against a bot in a state channel.")
        .arg(Arg::new("config").long("config").required(true))
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Validate config and exit without opening a channel")
                .action(ArgAction::SetTrue),
        )
        .get_matches();
    let dry_run = matches.get_flag("dry-run");

    // Load config
    let config_file = matches
        .get_one::<String>("config")
        .context("missing --config")?;
    let config_file = std::fs::read_to_string(config_file)
        .with_context(|| format!("Could not read config file {config_file}"))?;
    let config: Config =
        serde_yaml::from_str(&config_file).context("Could not parse config file")?;

    if dry_run {
        println!("{:#?}", config.redacted_debug());
        let config = config.validate().context("Invalid config")?;
        print_dry_run_report(&config);
        println!("config ok");
        return Ok(());
    }

    let redacted = format!("{:?}", config.redacted_debug());
    let config = config.validate().context("Invalid config")?;
    init_logging(&config);
    info!(config = %redacted, "loaded config file");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Could not start runtime")?;
    runtime.block_on(play(config))
}
