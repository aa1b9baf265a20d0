mod console;
mod surface;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use live_view::{InteractionBus, LiveSession, SessionConfig, SessionHandle, SessionSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::console::{ConsoleCommand, HELP};
use crate::surface::{AutoplayPolicy, HeadlessSurface};

#[derive(Debug, Parser)]
#[command(
    name = "fleet-viewer",
    author,
    version,
    about = "Headless operator console: one live video session per fleet agent"
)]
struct Cli {
    /// Agent names to view.
    #[arg(required = true)]
    agents: Vec<String>,

    /// Relay base URL; http(s) is rewritten to ws(s).
    #[arg(long, env = "FLEET_RELAY_URL")]
    relay_url: Option<String>,

    /// Comma separated STUN servers.
    #[arg(long, env = "FLEET_STUN_SERVERS", value_delimiter = ',')]
    stun: Vec<String>,

    /// Wait this long for video after the answer; 0 disables the check.
    #[arg(long, env = "FLEET_TRACK_TIMEOUT_MS")]
    track_timeout_ms: Option<u64>,

    /// Start with streaming off; use `on <agent>` or `toggle <agent>`.
    #[arg(long, default_value_t = false)]
    paused: bool,

    /// Refuse automatic playback until the first console click.
    #[arg(long, env = "FLEET_STRICT_AUTOPLAY", default_value_t = false)]
    strict_autoplay: bool,

    /// Seconds between status tables; 0 prints only on request.
    #[arg(long, env = "FLEET_STATUS_INTERVAL_SECS", default_value_t = 10)]
    status_interval_secs: u64,
}

#[derive(Debug, Clone)]
struct ViewerConfig {
    agents: Vec<String>,
    session: SessionConfig,
    strict_autoplay: bool,
    status_interval: Option<Duration>,
}

impl TryFrom<Cli> for ViewerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let mut agents: Vec<String> = Vec::new();
        for agent in cli.agents {
            let agent = agent.trim().to_string();
            if agent.is_empty() {
                bail!("agent names must not be empty");
            }
            if !agents.contains(&agent) {
                agents.push(agent);
            }
        }

        let mut session = SessionConfig::from_env().with_auto_connect(!cli.paused);
        if let Some(relay_url) = cli.relay_url {
            session = session.with_relay_url(relay_url);
        }
        let stun: Vec<String> = cli
            .stun
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if !stun.is_empty() {
            session.ice_servers = stun;
        }
        if let Some(timeout) = cli.track_timeout_ms {
            session = session
                .with_track_timeout((timeout > 0).then(|| Duration::from_millis(timeout)));
        }
        // fail early on a relay address no session could use
        live_view::config::signaling_url(&session.relay_url, &agents[0])?;

        Ok(ViewerConfig {
            agents,
            session,
            strict_autoplay: cli.strict_autoplay,
            status_interval: (cli.status_interval_secs > 0)
                .then(|| Duration::from_secs(cli.status_interval_secs)),
        })
    }
}

struct Card {
    handle: SessionHandle,
    surface: Arc<HeadlessSurface>,
}

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = ViewerConfig::try_from(cli)?;
    info!(
        relay_url = %config.session.relay_url,
        agents = config.agents.len(),
        strict_autoplay = config.strict_autoplay,
        "starting fleet viewer"
    );

    run(config).await
}

async fn run(config: ViewerConfig) -> Result<()> {
    let bus = InteractionBus::new();
    let policy = AutoplayPolicy::new(config.strict_autoplay);

    let cards: Vec<Card> = config
        .agents
        .iter()
        .map(|agent| {
            let surface = Arc::new(HeadlessSurface::new(agent.as_str(), policy.clone()));
            let handle = LiveSession::new(agent.as_str(), config.session.clone(), surface.clone())
                .with_interactions(bus.clone())
                .spawn();
            tokio::spawn(report_transitions(handle.subscribe()));
            Card { handle, surface }
        })
        .collect();

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = config.status_interval.map(tokio::time::interval);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => handle_command(command, &cards, &bus, &policy).await,
                    Err(err) => println!("{err}\n{HELP}"),
                }
            }
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => ticker.tick().await,
                    None => std::future::pending().await,
                }
            } => print_status(&cards).await,
            _ = signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    for card in &cards {
        card.handle.shutdown().await;
    }
    Ok(())
}

async fn handle_command(
    command: ConsoleCommand,
    cards: &[Card],
    bus: &InteractionBus,
    policy: &AutoplayPolicy,
) {
    match command {
        ConsoleCommand::Click => {
            policy.record_gesture();
            let listeners = bus.interact();
            info!(listeners, "click");
        }
        ConsoleCommand::Status => print_status(cards).await,
        ConsoleCommand::Quit => {}
        command => {
            let Some(agent) = command.agent() else {
                return;
            };
            let Some(card) = cards.iter().find(|card| card.handle.agent() == agent) else {
                warn!(agent = %agent, "no such agent");
                return;
            };
            match command {
                ConsoleCommand::Toggle(_) => card.handle.toggle(),
                ConsoleCommand::Play(_) => {
                    // pressing the play button is itself a gesture
                    policy.record_gesture();
                    card.handle.manual_play();
                }
                ConsoleCommand::Restart(_) => card.handle.restart(),
                ConsoleCommand::Enable(_) => card.handle.enable(),
                ConsoleCommand::Disable(_) => card.handle.disable(),
                ConsoleCommand::Click | ConsoleCommand::Status | ConsoleCommand::Quit => {}
            }
        }
    }
}

async fn print_status(cards: &[Card]) {
    for card in cards {
        let snapshot = card.handle.snapshot().await;
        println!(
            "{:<16} {:<14} {:<12} packets={:<8} retries={}{}",
            snapshot.agent,
            snapshot.badge(),
            snapshot.status,
            card.surface.packets(),
            snapshot.retry_count,
            describe_extra(&snapshot),
        );
    }
}

fn describe_extra(snapshot: &SessionSnapshot) -> String {
    let mut extra = String::new();
    if snapshot.awaiting_interaction() {
        extra.push_str(" [click to play]");
    }
    if let Some(delay) = snapshot.next_retry {
        extra.push_str(&format!(" next retry in {}ms", delay.as_millis()));
    }
    if let Some(error) = &snapshot.last_error {
        extra.push_str(&format!(" error: {error}"));
    }
    extra
}

async fn report_transitions(mut state: watch::Receiver<SessionSnapshot>) {
    while state.changed().await.is_ok() {
        let snapshot = state.borrow_and_update().clone();
        info!(
            agent = %snapshot.agent,
            badge = %snapshot.badge(),
            status = %snapshot.status,
            playback = ?snapshot.playback,
            error = snapshot.last_error.as_deref().unwrap_or_default(),
            "session state"
        );
    }
}
