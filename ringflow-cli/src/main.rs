//! Ringflow CLI Application
//!
//! Drives the call coordinator against in-memory loopback collaborators so
//! call flows can be watched from a terminal.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use rand::Rng;
use ringflow_core::loopback::{LoopbackBackend, LoopbackMedia, LoopbackPush, Script};
use ringflow_core::prelude::*;
use ringflow_core::MatchStatus;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local user identity
    #[arg(short, long, env = "RINGFLOW_IDENTITY")]
    identity: Option<String>,

    /// Path to a JSON config file
    #[arg(short, long, env = "RINGFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call to a scripted peer
    Call {
        /// Peer to call
        target: String,

        /// Video call instead of audio
        #[arg(long)]
        video: bool,

        /// Peer accepts after this many seconds
        #[arg(long, conflicts_with_all = ["decline_after", "busy", "unreachable"])]
        answer_after: Option<u64>,

        /// Peer declines after this many seconds
        #[arg(long, conflicts_with_all = ["busy", "unreachable"])]
        decline_after: Option<u64>,

        /// Peer is already in a call
        #[arg(long, conflicts_with = "unreachable")]
        busy: bool,

        /// Peer is offline
        #[arg(long)]
        unreachable: bool,

        /// Hang up after this many seconds
        #[arg(long)]
        hangup_after: Option<u64>,

        /// Purchased call budget in seconds
        #[arg(long, default_value_t = 3_600)]
        budget: u64,
    },

    /// Receive a simulated incoming call
    Listen {
        /// Who calls
        #[arg(long, default_value = "caller")]
        caller: String,

        /// Incoming call is a video call
        #[arg(long)]
        video: bool,

        /// Decline instead of accepting
        #[arg(long)]
        decline: bool,

        /// Seconds before answering
        #[arg(long, default_value_t = 2)]
        answer_after: u64,

        /// The caller hangs up after this many seconds
        #[arg(long)]
        remote_hangup_after: Option<u64>,

        /// Hang up locally after this many seconds
        #[arg(long)]
        hangup_after: Option<u64>,
    },

    /// Ring candidates one at a time until one accepts
    Match {
        /// Candidates, in order
        #[arg(required = true)]
        candidates: Vec<String>,

        /// Video call instead of audio
        #[arg(long)]
        video: bool,

        /// Candidate with the requested call type disabled
        #[arg(long)]
        ineligible: Vec<String>,

        /// Candidate that accepts, as ID=SECONDS
        #[arg(long, value_parser = parse_answer)]
        answer: Vec<(String, u64)>,

        /// Hang up the matched call after this many seconds
        #[arg(long, default_value_t = 5)]
        hangup_after: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ringflow=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let identity = cli.identity.unwrap_or_else(generate_random_identity);

    match cli.command {
        Commands::Call {
            target,
            video,
            answer_after,
            decline_after,
            busy,
            unreachable,
            hangup_after,
            budget,
        } => {
            let script = if busy {
                Script::Busy
            } else if unreachable {
                Script::Unreachable
            } else if let Some(secs) = decline_after {
                Script::RejectAfter(Duration::from_secs(secs))
            } else if let Some(secs) = answer_after {
                Script::AnswerAfter(Duration::from_secs(secs))
            } else {
                Script::NeverAnswer
            };
            handle_call(config, &identity, &target, call_type(video), script, hangup_after, budget)
                .await?;
        }
        Commands::Listen {
            caller,
            video,
            decline,
            answer_after,
            remote_hangup_after,
            hangup_after,
        } => {
            handle_listen(
                config,
                &identity,
                &caller,
                call_type(video),
                decline,
                answer_after,
                remote_hangup_after,
                hangup_after,
            )
            .await?;
        }
        Commands::Match {
            candidates,
            video,
            ineligible,
            answer,
            hangup_after,
        } => {
            handle_match(
                config,
                &identity,
                candidates,
                call_type(video),
                ineligible,
                answer.into_iter().collect(),
                hangup_after,
            )
            .await?;
        }
        Commands::Config => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("serializing config")?
            );
        }
    }

    Ok(())
}

struct Loopback {
    service: CallService,
    backend: Arc<LoopbackBackend>,
    push: Arc<LoopbackPush>,
}

async fn start_loopback(config: CoordinatorConfig, identity: &str) -> Result<Loopback> {
    let push = Arc::new(LoopbackPush::new());
    let backend = Arc::new(LoopbackBackend::new().linked_to(Arc::clone(&push)));
    let media = Arc::new(LoopbackMedia::new());
    media.peer_joins_after(Duration::from_millis(800));

    let service = CallService::builder()
        .with_config(config)
        .local_user(PeerId::new(identity))
        .backend(backend.clone())
        .status(backend.clone())
        .push(push.clone())
        .media(media)
        .build()
        .context("building call service")?;
    service.start().await.context("starting call service")?;
    println!("🔗 Using identity: {identity}");

    Ok(Loopback {
        service,
        backend,
        push,
    })
}

async fn handle_call(
    config: CoordinatorConfig,
    identity: &str,
    target: &str,
    call_type: CallType,
    script: Script,
    hangup_after: Option<u64>,
    budget: u64,
) -> Result<()> {
    let lb = start_loopback(config, identity).await?;
    let target = PeerId::new(target);
    lb.backend.script(&target, script);
    lb.backend.set_max_duration(budget);

    println!("📞 Calling {target} ({call_type})...");
    let session = lb.service.start_outbound(target, call_type)?;
    if let Some(secs) = hangup_after {
        schedule_hangup(lb.service.clone(), session.id(), secs);
    }

    let last = watch_session(&session).await?;
    print_outcome(&session, last).await;
    lb.service.shutdown().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_listen(
    config: CoordinatorConfig,
    identity: &str,
    caller: &str,
    call_type: CallType,
    decline: bool,
    answer_after: u64,
    remote_hangup_after: Option<u64>,
    hangup_after: Option<u64>,
) -> Result<()> {
    let lb = start_loopback(config, identity).await?;
    let mut events = lb.service.subscribe_events();

    println!("👂 Listening for incoming calls...");
    let call_id = lb.backend.place_inbound(&PeerId::new(caller), call_type);

    let session = loop {
        match events.recv().await.context("service event stream closed")? {
            ServiceEvent::IncomingCall {
                session,
                caller,
                call_type,
                ..
            } => {
                println!("📞 Incoming {call_type} call from {caller}");
                break lb.service.handle(session)?;
            }
            other => tracing::debug!(?other, "Service event"),
        }
    };

    let service = lb.service.clone();
    let id = session.id();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(answer_after)).await;
        let result = if decline {
            println!("❌ Declining call...");
            service.reject_inbound(id, "declined")
        } else {
            println!("✅ Accepting call...");
            service.accept_inbound(id)
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Could not answer");
        }
    });
    if let Some(secs) = remote_hangup_after {
        let push = Arc::clone(&lb.push);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            push.publish(PushMessage::Ended { call_id });
        });
    }
    if let Some(secs) = hangup_after {
        schedule_hangup(lb.service.clone(), id, secs);
    }

    let last = watch_session(&session).await?;
    print_outcome(&session, last).await;
    lb.service.shutdown().await;
    Ok(())
}

async fn handle_match(
    config: CoordinatorConfig,
    identity: &str,
    candidates: Vec<String>,
    call_type: CallType,
    ineligible: Vec<String>,
    answers: HashMap<String, u64>,
    hangup_after: u64,
) -> Result<()> {
    let lb = start_loopback(config, identity).await?;
    for candidate in &ineligible {
        lb.backend.set_capabilities(
            &PeerId::new(candidate.as_str()),
            PeerCapabilities {
                audio_enabled: call_type != CallType::Audio,
                video_enabled: call_type != CallType::Video,
            },
        );
    }
    for (candidate, secs) in &answers {
        lb.backend.script(
            &PeerId::new(candidate.as_str()),
            Script::AnswerAfter(Duration::from_secs(*secs)),
        );
    }

    let candidates: Vec<PeerId> = candidates.into_iter().map(PeerId::new).collect();
    println!("🎲 Matching across {} candidates...", candidates.len());
    // Subscribed before the run starts: a finished run is released at once
    let mut events = lb.service.subscribe_events();
    let controller = lb.service.start_matching(candidates, call_type)?;
    let queue = controller.id();

    let mut progress = controller.subscribe();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let status = progress.borrow_and_update().clone();
            match status {
                MatchStatus::CheckingBalance => println!("   checking balance"),
                MatchStatus::Checking(candidate) => println!("   checking {candidate}"),
                MatchStatus::Ringing { candidate, .. } => println!("   🔔 ringing {candidate}"),
                MatchStatus::Finished(_) => break,
            }
        }
    });

    let report = loop {
        match events.recv().await {
            Ok(ServiceEvent::MatchFinished { queue: q, report }) if q == queue => break report,
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Service events lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                bail!("call service stopped before matching finished")
            }
        }
    };
    println!(
        "   rung: [{}]  skipped: [{}]",
        join(&report.rung),
        join(&report.skipped)
    );
    match report.outcome {
        MatchOutcome::Matched(matched) => {
            println!(
                "✅ Matched {} on call {} (channel {})",
                matched.candidate,
                matched.call_id,
                matched
                    .credentials
                    .as_ref()
                    .map_or("-", |credentials| credentials.channel.as_str())
            );
            let session = lb.service.handle(matched.session)?;
            schedule_hangup(lb.service.clone(), session.id(), hangup_after);
            let last = watch_session(&session).await?;
            print_outcome(&session, last).await;
        }
        other => println!("❌ No match: {other:?}"),
    }

    lb.service.shutdown().await;
    Ok(())
}

fn schedule_hangup(service: CallService, session: SessionId, secs: u64) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        println!("👋 Hanging up...");
        if let Err(e) = service.end_locally(session).await {
            tracing::warn!(error = %e, "Hangup failed");
        }
    });
}

/// Print state changes until the session is terminal
async fn watch_session(session: &SessionHandle) -> Result<SessionSnapshot> {
    let started = Instant::now();
    let mut updates = session.subscribe();
    let mut last_state = None;
    let mut low_time = false;

    while let Some(snapshot) = updates.next().await {
        if last_state != Some(snapshot.state) {
            println!(
                "[{:>5.1}s] {}",
                started.elapsed().as_secs_f32(),
                snapshot.state
            );
            last_state = Some(snapshot.state);
        }
        if snapshot.is_low_time && !low_time {
            println!(
                "⏳ {} seconds left",
                snapshot.remaining_seconds.unwrap_or_default()
            );
            low_time = true;
        }
        if snapshot.state.is_terminal() {
            return Ok(snapshot);
        }
    }
    bail!("session {} closed unexpectedly", session.id())
}

async fn print_outcome(session: &SessionHandle, last: SessionSnapshot) {
    // The backend summary arrives shortly after a connected call ends
    let last = if last.was_ever_connected && last.summary.is_none() {
        tokio::time::timeout(
            Duration::from_secs(2),
            session.wait_until(|s| s.summary.is_some()),
        )
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or(last)
    } else {
        last
    };

    match last.outcome() {
        Some(CallOutcome::Connected {
            elapsed_seconds,
            summary,
        }) => {
            println!("📞 Call ended after {elapsed_seconds}s");
            if let Some(summary) = summary {
                println!(
                    "   billed {}s, charged {}",
                    summary.duration_seconds, summary.amount_charged
                );
            }
        }
        Some(CallOutcome::NeverConnected) => println!("📞 Call cancelled"),
        Some(CallOutcome::Error { reason }) => println!("⚠️  {reason}"),
        None => println!("📞 Session still live"),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<CoordinatorConfig> {
    if let Some(path) = path {
        return CoordinatorConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    if let Some(dirs) = directories::ProjectDirs::from("io", "ringflow", "ringflow") {
        let default_path = dirs.config_dir().join("config.json");
        if default_path.exists() {
            return CoordinatorConfig::load(&default_path)
                .with_context(|| format!("loading config from {}", default_path.display()));
        }
    }
    Ok(CoordinatorConfig::default())
}

fn parse_answer(raw: &str) -> Result<(String, u64), String> {
    let (id, secs) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=SECONDS, got {raw:?}"))?;
    let secs = secs
        .parse()
        .map_err(|e| format!("invalid seconds in {raw:?}: {e}"))?;
    Ok((id.to_string(), secs))
}

fn call_type(video: bool) -> CallType {
    if video {
        CallType::Video
    } else {
        CallType::Audio
    }
}

fn join(peers: &[PeerId]) -> String {
    peers
        .iter()
        .map(PeerId::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo",
        "sierra", "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    (0..3)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect::<Vec<_>>()
        .join("-")
}
