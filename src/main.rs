//! readaloud: read text aloud from the command line or a local HTTP API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use readaloud::config::Config;
use readaloud::narrator::api::{self, ApiState};
use readaloud::narrator::audio::{self, AudioOutput};
use readaloud::narrator::backend::native::{NativeSpeechAdapter, SpeechPlatform};
use readaloud::narrator::backend::offline::{EspeakSynth, OfflineSynthAdapter};
use readaloud::narrator::backend::remote::RemoteNeuralAdapter;
use readaloud::narrator::backend::SpeechBackend;
use readaloud::narrator::fallback::{AvailabilityProbe, Backends, FallbackCoordinator};
use readaloud::narrator::history::History;
use readaloud::narrator::progress::format_clock;
use readaloud::narrator::voices::neural_voices_for;
use readaloud::narrator::{
    EngineEvent, EngineKind, PlaybackEngine, SessionSummary, StartOptions, VoiceCatalog,
};

#[derive(Parser, Debug)]
#[command(name = "readaloud", about = "Read text aloud with native, neural, or offline voices")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read text aloud. Type p/r/s + Enter to pause, resume, stop.
    Speak {
        /// Text to read (default: --file, else stdin)
        text: Option<String>,

        /// Read the text from a file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Voice id (see `readaloud voices`)
        #[arg(long)]
        voice: Option<String>,

        /// Speaking rate multiplier
        #[arg(long, default_value_t = 1.0)]
        rate: f32,

        /// Preferred engine: native, neural, or offline
        #[arg(long)]
        engine: Option<EngineKind>,

        /// Save the neural audio here once finished
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Run the HTTP control API
    Serve,
    /// List available voices
    Voices {
        #[arg(long)]
        engine: Option<EngineKind>,

        /// Language tag, e.g. en or en-GB
        #[arg(long)]
        lang: Option<String>,
    },
    /// Check whether the neural voice service is reachable
    Probe,
    /// Print the session report for a date (YYYY-MM-DD or "today")
    History {
        #[arg(long, default_value = "today")]
        date: String,
    },
}

/// Everything the subcommands need.
struct Stack {
    engine: PlaybackEngine,
    catalog: Arc<VoiceCatalog>,
    probe: Option<Arc<AvailabilityProbe>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy HTTP/decoder internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,hyper=info,reqwest=info,symphonia=info")
    } else {
        EnvFilter::new("info,hyper=warn,reqwest=warn,symphonia=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(args.config.as_deref());

    match args.command {
        Command::History { date } => {
            let history = History::default_location().ok_or("No home directory")?;
            println!("{}", history.report(&date));
        }
        Command::Probe => {
            let stack = build(&config).await?;
            let up = match &stack.probe {
                Some(probe) => probe.probe().await,
                None => false,
            };
            println!(
                "{}: {}",
                config.remote.base_url,
                if up { "reachable" } else { "unreachable" }
            );
        }
        Command::Voices { engine, lang } => {
            let stack = build(&config).await?;
            let engines = match engine {
                Some(e) => vec![e],
                None => vec![EngineKind::Neural, EngineKind::Native, EngineKind::Offline],
            };
            for engine in engines {
                let voices = match (engine, lang.as_deref()) {
                    (EngineKind::Neural, Some(lang)) => neural_voices_for(lang),
                    (_, Some(lang)) => stack
                        .catalog
                        .list_voices(engine)
                        .into_iter()
                        .filter(|v| api::language_matches(&v.language, lang))
                        .collect(),
                    (_, None) => stack.catalog.list_voices(engine),
                };
                println!("# {engine} ({})", voices.len());
                for v in voices {
                    println!("{:<28} {:<8} {}", v.id, v.language, v.label);
                }
            }
        }
        Command::Serve => {
            let stack = build(&config).await?;
            let shutdown = CancellationToken::new();
            if let Some(probe) = &stack.probe {
                probe.spawn_monitor(shutdown.clone());
            }
            if config.history.enabled {
                match History::default_location() {
                    Some(history) => {
                        history.spawn_recorder(stack.engine.subscribe());
                    }
                    None => warn!("No home directory, session history disabled"),
                }
            }

            let state = ApiState {
                engine: stack.engine.clone(),
                catalog: stack.catalog.clone(),
            };
            let server = tokio::spawn(api::serve(state, config.api.port, shutdown.clone()));
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            stack.engine.stop();
            shutdown.cancel();
            server.await??;
        }
        Command::Speak {
            text,
            file,
            voice,
            rate,
            engine,
            save,
        } => {
            let interactive = text.is_some() || file.is_some();
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(path)) => tokio::fs::read_to_string(&path).await?,
                (None, None) => {
                    let mut buf = String::new();
                    tokio::io::stdin().read_to_string(&mut buf).await?;
                    buf
                }
            };

            let stack = build(&config).await?;
            if let Some(probe) = &stack.probe {
                probe.probe().await;
            }
            let options = StartOptions {
                voice_id: voice,
                rate,
                engine,
            };
            let summary = speak(&stack.engine, &text, options, interactive).await?;
            if let (true, Some(summary)) = (config.history.enabled, summary) {
                match History::default_location() {
                    Some(history) => history.save(&summary),
                    None => warn!("No home directory, session not recorded"),
                }
            }

            if let Some(path) = save {
                match stack.engine.download() {
                    Some(audio) => {
                        tokio::fs::write(&path, &audio).await?;
                        println!("Saved {} bytes to {}", audio.len(), path.display());
                    }
                    None => warn!("No neural audio to save"),
                }
            }
        }
    }

    Ok(())
}

async fn build(config: &Config) -> Result<Stack, Box<dyn std::error::Error>> {
    let engine_cfg = &config.engine;
    let tick = engine_cfg.tick_interval();

    let output: Option<Arc<dyn AudioOutput>> = match audio::open_default_output() {
        Ok(output) => Some(output),
        Err(e) => {
            warn!("{e}; neural and offline voices disabled");
            None
        }
    };

    let platform = if config.native.enabled {
        connect_platform(config).await
    } else {
        None
    };
    let catalog = Arc::new(VoiceCatalog::new(
        platform.clone(),
        &config.offline.voices,
        config.native.excluded_voices.clone(),
    ));

    let mut backends = Backends::default();
    let mut probe = None;

    if config.remote.enabled {
        let remote = Arc::new(RemoteNeuralAdapter::new(
            &config.remote,
            engine_cfg.remote_chunk_chars,
            engine_cfg.assumed_chars_per_second(),
            tick,
            output.clone(),
        )?);
        probe = Some(Arc::new(AvailabilityProbe::new(
            remote.clone(),
            config.remote.probe_timeouts(),
            Duration::from_secs(config.remote.reprobe_interval_secs),
        )));
        backends.remote = Some(remote as Arc<dyn SpeechBackend>);
    }

    if let Some(platform) = platform {
        backends.native = Some(Arc::new(NativeSpeechAdapter::new(
            platform,
            engine_cfg.assumed_chars_per_second(),
            engine_cfg.native_chunk_chars,
            tick,
        )));
        let ready = catalog
            .await_ready(EngineKind::Native, Duration::from_millis(config.native.ready_timeout_ms))
            .await;
        if !ready {
            warn!("No native voices after {}ms", config.native.ready_timeout_ms);
        }
    }

    if config.offline.enabled {
        let synth = Arc::new(EspeakSynth::new(&config.offline));
        backends.offline = Some(Arc::new(OfflineSynthAdapter::new(
            synth,
            output,
            config.offline.default_voice.clone(),
            engine_cfg.offline_chunk_chars,
            engine_cfg.assumed_chars_per_second(),
            tick,
        )));
    }

    let coordinator = FallbackCoordinator::new(backends, probe.clone(), engine_cfg.demotion_threshold);
    let engine = PlaybackEngine::new(
        coordinator,
        Some(catalog.clone()),
        engine_cfg.assumed_chars_per_second(),
    );
    Ok(Stack {
        engine,
        catalog,
        probe,
    })
}

#[cfg(unix)]
async fn connect_platform(config: &Config) -> Option<Arc<dyn SpeechPlatform>> {
    use readaloud::narrator::backend::speechd::SpeechDispatcher;

    let socket = config.native.resolve_socket()?;
    match SpeechDispatcher::connect(&socket).await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("Native voices unavailable: {e}");
            None
        }
    }
}

#[cfg(not(unix))]
async fn connect_platform(_config: &Config) -> Option<Arc<dyn SpeechPlatform>> {
    None
}

/// Run one session in the foreground, printing progress to stderr.
async fn speak(
    engine: &PlaybackEngine,
    text: &str,
    options: StartOptions,
    interactive: bool,
) -> Result<Option<SessionSummary>, Box<dyn std::error::Error>> {
    let mut events = engine.subscribe();
    let id = engine.start(text, options)?;

    if interactive {
        let control = engine.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match line.trim() {
                    "p" => {
                        control.pause();
                    }
                    "r" => {
                        control.resume();
                    }
                    "s" | "q" => {
                        control.stop();
                    }
                    _ => {}
                }
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.stop();
            }
            event = events.recv() => match event {
                Ok(EngineEvent::Progress { session, progress }) if session == id => {
                    eprint!(
                        "\r{:>3}%  {} elapsed, ~{} left   ",
                        progress.percent,
                        format_clock(progress.elapsed_seconds),
                        format_clock(progress.remaining_seconds_estimate),
                    );
                }
                Ok(EngineEvent::Warning { message, .. }) => eprintln!("\n{message}"),
                Ok(EngineEvent::Demoted { from, to, .. }) => eprintln!("\nSwitched from {from} to {to} voices"),
                Ok(EngineEvent::Error { message, .. }) => eprintln!("\n{message}"),
                Ok(EngineEvent::Ended { summary }) if summary.session == id => {
                    eprintln!();
                    info!(
                        "Session {} {:?}: {}/{} chars, {} skipped chunks",
                        summary.session,
                        summary.outcome,
                        summary.chars_processed,
                        summary.total_chars,
                        summary.skipped_chunks
                    );
                    return Ok(Some(summary));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(None),
            },
        }
    }
}
