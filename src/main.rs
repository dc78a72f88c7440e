//! llama-bridge - stream a completion from a local GGUF model

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llama_bridge::inference::{EngineError, Session, StopReason};
use llama_bridge::storage::settings::{load_settings, save_settings};

#[derive(Parser)]
#[command(name = "llama-bridge")]
#[command(about = "Stream a greedy completion from a local GGUF model")]
#[command(version)]
struct Cli {
    /// Path to model file (.gguf)
    model: PathBuf,

    /// Prompt text
    prompt: String,

    /// Engine shared library (defaults to the platform's libllama)
    #[arg(long)]
    library: Option<PathBuf>,

    /// Context window in tokens
    #[arg(long)]
    context_size: Option<u32>,

    /// Decode threads
    #[arg(long)]
    threads: Option<u32>,

    /// Stop once prompt + output reach this many tokens
    #[arg(long)]
    max_length: Option<u32>,

    /// Layers to offload to the GPU
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Print special tokens such as end-of-turn markers
    #[arg(long)]
    render_special: bool,

    /// Store the effective settings as the new defaults
    #[arg(long)]
    save_settings: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only generated text
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("llama_bridge=info")),
        )
        .init();

    info!("Starting llama-bridge v{}", env!("CARGO_PKG_VERSION"));

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, EngineError> {
    let mut settings = load_settings();
    if cli.library.is_some() {
        settings.library_path = cli.library;
    }
    if let Some(n) = cli.context_size {
        settings.context_size = n;
    }
    if cli.threads.is_some() {
        settings.threads = cli.threads;
    }
    if cli.max_length.is_some() {
        settings.max_length = cli.max_length;
    }
    if let Some(n) = cli.gpu_layers {
        settings.gpu_layers = n;
    }
    settings.render_special |= cli.render_special;
    settings.validate();

    if cli.save_settings {
        if let Err(e) = save_settings(&settings) {
            tracing::warn!("Failed to save settings: {}", e);
        }
    }

    let session = Session::native(settings)?;
    info!(
        context_size = session.settings().context_size,
        max_length = ?session.settings().max_length,
        "Engine ready"
    );
    let model = session.load_model(&cli.model)?;
    let mut stream = session.generate(&model, cli.prompt);
    let cancel = stream.cancel_handle();

    let mut stdout = std::io::stdout();
    let mut failed = false;
    loop {
        tokio::select! {
            item = stream.next_fragment() => match item {
                Some(Ok(fragment)) => {
                    if write!(stdout, "{fragment}").and_then(|_| stdout.flush()).is_err() {
                        cancel.cancel();
                    }
                }
                Some(Err(e)) => {
                    eprintln!("\nerror: {e}");
                    failed = true;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping generation");
                cancel.cancel();
            }
        }
    }
    let _ = writeln!(stdout);

    let reason = stream.stop_reason();
    session.close_model(model);

    Ok(match reason {
        _ if failed => ExitCode::FAILURE,
        Some(reason) if reason.is_completed() => ExitCode::SUCCESS,
        Some(StopReason::Cancelled) => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}
