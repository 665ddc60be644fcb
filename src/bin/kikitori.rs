//! CLI binary for kikitori.

use clap::Parser;
use kikitori::asr::WhisperEngine;
use kikitori::audio::{list_input_devices, AudioSource, FileSource, MicSource};
use kikitori::config::SummaryBackend;
use kikitori::events::MessageLevel;
use kikitori::summary::{ClaudeClient, LlmClient, OpenAiCompatClient};
use kikitori::ui::StatusUi;
use kikitori::vad::SileroVad;
use kikitori::{App, ScribeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Kikitori: real-time speech transcription with VAD, Whisper, and LLM
/// summaries.
#[derive(Parser)]
#[command(name = "kikitori", version, about)]
struct Cli {
    /// List available audio input devices and exit.
    #[arg(short = 'l', long)]
    list_devices: bool,

    /// Audio input device ID (see --list-devices).
    #[arg(short, long, value_name = "ID")]
    device: Option<usize>,

    /// Audio file (mp3/wav) to transcribe instead of microphone input.
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Disable real-time summary generation.
    #[arg(long)]
    no_summary: bool,

    /// Configuration file (default: config.toml + config.local.toml in the
    /// working directory).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Suppress noisy dependency logs by default; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kikitori=info,ort=warn,whisper_rs=warn")),
        )
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        print_input_devices()?;
        return Ok(());
    }

    let config = match cli.config {
        Some(ref path) => ScribeConfig::from_file(path)?,
        None => ScribeConfig::load(std::path::Path::new("."))?,
    };
    let summary_requested = !cli.no_summary && config.summary.enabled;
    config.validate(summary_requested)?;

    let source: Box<dyn AudioSource> = match cli.file {
        Some(ref path) => Box::new(FileSource::new(path, false, &config.core)),
        None => Box::new(MicSource::new(cli.device, &config.core, &config.audio)?),
    };
    let is_file_mode = cli.file.is_some();

    let vad = SileroVad::new(&config.vad.model)?;
    let engine = WhisperEngine::new(&config.whisper.model)?;

    let llm: Option<Arc<dyn LlmClient>> = if summary_requested {
        let client: Arc<dyn LlmClient> = match config.summary.backend {
            SummaryBackend::Claude => Arc::new(ClaudeClient::new(&config.summary)?),
            SummaryBackend::Vllm => Arc::new(OpenAiCompatClient::new(&config.summary)?),
        };
        info!("summary backend: {}", client.backend_info());
        Some(client)
    } else {
        None
    };

    let mut app = App::start(config.clone(), source, Box::new(vad), Box::new(engine), llm);

    let ui = StatusUi::new(&app.bus(), &config.app);
    let ui_cancel = CancellationToken::new();
    let ui_task = ui.spawn_refresh(
        app.stream_handle(),
        app.transcriber_client(),
        app.summarizer_client(),
        config.app.status_update_interval_sec,
        ui_cancel.clone(),
    );

    let bus = app.bus();
    bus.post_message(
        MessageLevel::Success,
        "Listening... (Ctrl+C to stop, press twice for fast exit)\n",
    );

    let pipeline_failed = app.cancelled();
    let graceful = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            bus.post_message(MessageLevel::Success, "\nGoodbye!");
            true
        }
        () = pipeline_failed.cancelled() => {
            bus.post_message(MessageLevel::Error, "\nPipeline failed, fast exit");
            false
        }
        () = wait_for_file_completion(&mut app, is_file_mode) => {
            bus.post_message(MessageLevel::Success, "\nFile processing completed.");
            true
        }
    };

    // A second Ctrl+C during the graceful path abandons everything.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nFast exit");
            std::process::exit(130);
        }
    });

    let result = app.shutdown(graceful).await;
    ui_cancel.cancel();
    let _ = ui_task.await;
    result?;

    if !graceful {
        std::process::exit(1);
    }
    Ok(())
}

/// Completes when a file source has been fully consumed and transcribed.
/// Never completes in microphone mode.
async fn wait_for_file_completion(app: &mut App, is_file_mode: bool) {
    if is_file_mode {
        app.wait_until_drained().await;
    } else {
        std::future::pending::<()>().await;
    }
}

fn print_input_devices() -> kikitori::Result<()> {
    let devices = list_input_devices()?;
    println!("\nAvailable audio input devices:\n");
    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  [{}] {}{marker}", device.id, device.name);
    }
    println!();
    Ok(())
}
