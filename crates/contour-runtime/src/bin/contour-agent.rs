use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use contour_observability::{init_process_logging, init_stderr_logging, ProcessKind};
use contour_wire::{Framing, DEFAULT_MAX_FRAME_BYTES};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FramingArg {
    Newline,
    LengthPrefixed,
}

impl From<FramingArg> for Framing {
    fn from(value: FramingArg) -> Self {
        match value {
            FramingArg::Newline => Framing::Newline,
            FramingArg::LengthPrefixed => Framing::LengthPrefixed,
        }
    }
}

/// Reference backend: reads protocol frames on stdin and answers on stdout.
#[derive(Debug, Parser)]
#[command(name = "contour-agent", version)]
struct Args {
    #[arg(long, value_enum, default_value = "newline")]
    framing: FramingArg,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    /// Also write JSONL logs into this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 14)]
    log_retention_days: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = match &args.log_dir {
        Some(dir) => {
            let (guard, info) = init_process_logging(ProcessKind::Agent, dir, args.log_retention_days)
                .context("failed to initialize logging")?;
            tracing::debug!("Logging to {} ({})", info.logs_dir, info.prefix);
            Some(guard)
        }
        None => {
            init_stderr_logging(ProcessKind::Agent);
            None
        }
    };

    contour_runtime::agent::serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        args.framing.into(),
        args.max_frame_bytes,
    )
    .await
    .context("agent protocol loop failed")?;
    Ok(())
}
