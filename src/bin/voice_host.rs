//! Interactive host for the voice session engine.
//!
//! Wires the default microphone and speaker, the WebSocket connector and an
//! empty tool registry, then maps stdin lines to control calls:
//!
//! ```text
//! start | stop | stop! | mute | pause <secs> | interrupt | video on|off
//! voice <name> | status | quit
//! ```
//!
//! All tracing goes to stderr; `RUST_LOG` overrides the default filter.

use livevoice::audio::capture::CpalCaptureDevice;
use livevoice::audio::playback::CpalOutput;
use livevoice::channel::websocket::WebSocketConnector;
use livevoice::config::API_KEY_ENV;
use livevoice::tools::EmptyToolRegistry;
use livevoice::{RuntimeEvent, SessionBuilder, SessionConfig, VoiceControl};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("livevoice=info")),
        )
        .init();

    let config = load_config(std::env::args().nth(1).map(PathBuf::from))?;
    tracing::info!(
        endpoint = %config.endpoint_url,
        voice = %config.voice_profile,
        "livevoice-host starting"
    );

    let (output, clock) = CpalOutput::open(&config.audio)?;
    let (voice, engine) = SessionBuilder::new(config.clone())
        .connector(Arc::new(WebSocketConnector::from_config(&config)))
        .capture_device(Box::new(CpalCaptureDevice::new(&config.audio)))
        .audio_output(Box::new(output), clock)
        .tools(Arc::new(EmptyToolRegistry))
        .on_error(|e| eprintln!("error: {}", e.user_message()))
        .spawn()?;

    tokio::spawn(log_events(voice.subscribe_events()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !dispatch(&voice, line.trim()) {
            break;
        }
    }

    voice.shutdown();
    engine
        .await
        .map_err(|e| anyhow::anyhow!("session engine task failed: {e}"))?;
    tracing::info!("livevoice-host shut down cleanly");
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<SessionConfig> {
    let path = path.unwrap_or_else(SessionConfig::default_config_path);
    let config = if path.exists() {
        SessionConfig::from_file(&path)?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        SessionConfig {
            api_key: std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()),
            ..SessionConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

/// Apply one command line. Returns `false` on quit.
fn dispatch(voice: &VoiceControl, line: &str) -> bool {
    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();

    match cmd {
        "" => {}
        "start" => {
            if !voice.start() {
                eprintln!("start rejected (see status)");
            }
        }
        "stop" => voice.stop(false),
        "stop!" => voice.stop(true),
        "mute" => voice.toggle_mute(),
        "pause" => match arg.parse::<u64>() {
            Ok(secs) => voice.pause(secs),
            Err(_) => eprintln!("usage: pause <seconds>"),
        },
        "interrupt" => {
            let flushed = voice.interrupt();
            eprintln!("flushed {flushed} buffer(s)");
        }
        "video" => match arg {
            "on" => voice.enable_video(),
            "off" => voice.disable_video(),
            _ => eprintln!("usage: video on|off"),
        },
        "voice" if !arg.is_empty() => voice.set_voice_profile(arg),
        "status" => eprintln!("{:?}", voice.status()),
        "quit" | "exit" => return false,
        other => eprintln!("unknown command: {other}"),
    }
    true
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<RuntimeEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(RuntimeEvent::TurnCommitted {
                turn_id,
                input,
                output,
                interrupted,
            }) => {
                eprintln!("[turn {turn_id}{}]", if interrupted { ", interrupted" } else { "" });
                eprintln!("  you:   {input}");
                eprintln!("  model: {output}");
            }
            Ok(RuntimeEvent::StateChanged(state)) => eprintln!("[state] {state:?}"),
            Ok(other) => tracing::debug!(event = ?other, "runtime event"),
            Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
