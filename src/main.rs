use anyhow::Context;
use callrelay::calls::{CallManager, CallService, IncomingCallNotifier};
use callrelay::collaborators::{InMemoryDirectory, LogNotificationSink, StaticIdentityResolver};
use callrelay::config::AppConfig;
use callrelay::negotiation::loopback::{LoopbackMedia, LoopbackPeerFactory};
use callrelay::negotiation::{
    NegotiationClient, NegotiationEvent, NegotiationHandle, PeerConnectionState,
};
use callrelay::{CallStatus, ConversationId, UserId};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// Runs a complete call between two in-process endpoints.
//
// Usage:
//   cargo run                                  # alice calls bob, bob accepts
//   cargo run -- --reject                      # bob declines
//   cargo run -- --deny-media                  # bob's camera permission is denied
//   cargo run -- --config callrelay.json -t 3000

#[derive(Parser, Debug)]
#[command(name = "callrelay", about = "Loopback video call demo")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long the call stays connected before alice hangs up
    #[arg(short = 't', long, default_value_t = 1500)]
    talk_ms: u64,

    /// Bob declines the call instead of accepting it
    #[arg(long)]
    reject: bool,

    /// Bob's media permission prompt is dismissed
    #[arg(long)]
    deny_media: bool,
}

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(args)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => AppConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };

    let alice = UserId::new("alice");
    let bob = UserId::new("bob");
    let conversation = ConversationId::new("conv-alice-bob");

    let identity = Arc::new(StaticIdentityResolver::new());
    identity.insert("alice-token", alice.clone());
    identity.insert("bob-token", bob.clone());
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_conversation(conversation.clone(), vec![alice.clone(), bob.clone()]);

    let manager = CallManager::new(config.calls.clone());
    let reaper = manager.spawn_reaper();
    let notifier = IncomingCallNotifier::new(&manager, Arc::new(LogNotificationSink)).spawn();
    let service = CallService::new(manager.clone(), identity, directory);

    let session = service
        .start_call("alice-token", &bob, &conversation)
        .await?;
    let call_id = session.id.clone();

    let peers = Arc::new(LoopbackPeerFactory::default());
    let alice_media = Arc::new(LoopbackMedia::new());
    let bob_media = Arc::new(LoopbackMedia::new());
    bob_media.deny_permission(args.deny_media);

    let spawn_client = |user: &UserId,
                        media: Arc<LoopbackMedia>|
     -> (NegotiationHandle, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        tokio::spawn(log_events(user.to_string(), rx, connected_tx));
        let handle = NegotiationClient::new(
            manager.clone(),
            call_id.clone(),
            user.clone(),
            media,
            peers.clone(),
            config.negotiation.clone(),
        )
        .with_events(tx)
        .spawn();
        (handle, connected_rx)
    };
    let (alice_client, alice_connected) = spawn_client(&alice, alice_media.clone());
    let (bob_client, bob_connected) = spawn_client(&bob, bob_media.clone());

    // The notifier moves the call to ringing once bob's device shows it.
    let mut feed = service.subscribe("bob-token", &call_id).await?;
    tokio::time::timeout(
        STEP_TIMEOUT,
        feed.wait_for_status(|status| status != CallStatus::Calling),
    )
    .await
    .context("call never started ringing")?;

    service
        .answer_call("bob-token", &call_id, !args.reject)
        .await?;

    if !args.reject {
        if !args.deny_media {
            let (alice_up, bob_up) = tokio::time::timeout(STEP_TIMEOUT, async {
                tokio::join!(alice_connected, bob_connected)
            })
            .await
            .context("peers never connected")?;
            alice_up
                .and(bob_up)
                .context("a client stopped before connecting")?;
            info!("Both endpoints connected, talking for {}ms", args.talk_ms);
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(args.talk_ms)) => {}
            _ = tokio::signal::ctrl_c() => info!("Interrupted, hanging up"),
        }
        let duration = alice_client.hang_up().await?;
        info!("Alice hung up after {duration}s");
    }

    for (who, handle) in [("alice", alice_client), ("bob", bob_client)] {
        match handle.join().await {
            Ok(outcome) => info!("{who}: {outcome:?}"),
            Err(e) => warn!("{who}: {e}"),
        }
    }
    info!(
        "Live media streams after teardown: alice={}, bob={}",
        alice_media.live_streams(),
        bob_media.live_streams()
    );

    let record = service.get_call("alice-token", &call_id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    notifier.abort();
    Ok(())
}

/// Logs a client's events and fires `connected` on its first connection.
async fn log_events(
    user: String,
    mut rx: mpsc::UnboundedReceiver<NegotiationEvent>,
    connected: oneshot::Sender<()>,
) {
    let mut connected = Some(connected);
    while let Some(event) = rx.recv().await {
        if matches!(
            event,
            NegotiationEvent::ConnectionState(PeerConnectionState::Connected)
        ) && let Some(tx) = connected.take()
        {
            let _ = tx.send(());
        }
        match event {
            NegotiationEvent::Error(e) => warn!(target: "Demo", "{user}: {e}"),
            NegotiationEvent::ConnectionTrouble(state) => {
                warn!(target: "Demo", "{user}: connection {state:?}")
            }
            other => info!(target: "Demo", "{user}: {other:?}"),
        }
    }
}
