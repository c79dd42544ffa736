mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use spool_core::{discover_inputs, open_source, verify_output, Pipeline, SpoolError, TiktokenEncoder};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_config, resolve_encode_config, AppConfig, DEFAULT_CONFIG};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status when every shard was written but the manifest was not.
const EXIT_MANIFEST_FAILED: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "spool",
    version = VERSION,
    about = "Encodes inputs offline into token shards for fast and efficient dataloading"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Tokenize a corpus and write shards plus manifest.json.
    Encode(EncodeArgs),
    /// Re-read every shard listed in a manifest and check its invariants.
    Verify { root: PathBuf },
}

#[derive(Args, Debug, Clone)]
struct EncodeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    tokenizer: Option<String>,
    #[arg(long = "tokenizer-file")]
    tokenizer_file: Option<PathBuf>,
    #[arg(long = "max-tokens-per-shard")]
    max_tokens_per_shard: Option<u64>,
    #[arg(long = "batch-rows")]
    batch_rows: Option<usize>,
    #[arg(long = "input-format")]
    input_format: Option<String>,
    #[arg(long)]
    field: Option<String>,
    #[arg(long)]
    pattern: Option<String>,
    #[arg(long = "every-docs")]
    every_docs: Option<u64>,
    #[arg(long = "every-seconds")]
    every_seconds: Option<u64>,
    #[arg(long, action = ArgAction::SetTrue)]
    overwrite: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_for(&err);
            if code == EXIT_MANIFEST_FAILED {
                error!("all shards were written but the manifest was not: {err:#}");
            } else {
                error!("{err:#}");
            }
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let file_config = load_config(&config_path)?;
    match cli.command {
        Commands::Encode(args) => run_encode(&args, &file_config),
        Commands::Verify { root } => run_verify(&root),
    }
}

fn run_encode(args: &EncodeArgs, file_config: &AppConfig) -> Result<()> {
    let resolved = resolve_encode_config(args, file_config)?;
    let encoder = TiktokenEncoder::new(&resolved.tokenizer)
        .with_context(|| format!("failed to load tokenizer {}", resolved.tokenizer.name()))?;

    let files = discover_inputs(&resolved.input, &resolved.pattern)?;
    if files.is_empty() {
        warn!(
            input = %resolved.input.display(),
            pattern = %resolved.pattern,
            "no input files matched"
        );
    }
    info!(
        files = files.len(),
        tokenizer = %resolved.tokenizer.name(),
        max_tokens_per_shard = resolved.pipeline.max_tokens_per_shard,
        output = %resolved.output.display(),
        "starting encode"
    );

    let source = open_source(files, &resolved.source);
    let summary = Pipeline::new(&encoder, &resolved.output, resolved.pipeline.clone())
        .run(source)
        .with_context(|| format!("encode into {} failed", resolved.output.display()))?;

    println!(
        "Finished writing encoded data to `{}`.",
        resolved.output.display()
    );
    println!("Total shards: {}", summary.manifest.num_shards);
    println!("Total documents: {}", summary.manifest.docs);
    println!("Total tokens: {}", summary.manifest.tokens);
    Ok(())
}

fn run_verify(root: &Path) -> Result<()> {
    let report = verify_output(root)
        .with_context(|| format!("verification of {} failed", root.display()))?;
    println!(
        "{}: {} shards, {} documents, {} tokens (encoding {}, largest shard {} tokens)",
        root.display(),
        report.shards,
        report.docs,
        report.tokens,
        report.encoding,
        report.max_shard_tokens
    );
    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let manifest_failed = err.chain().any(|cause| {
        cause
            .downcast_ref::<SpoolError>()
            .map_or(false, SpoolError::is_manifest_failure)
    });
    if manifest_failed {
        EXIT_MANIFEST_FAILED
    } else {
        1
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
