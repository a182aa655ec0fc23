use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;

use dictgen::commands::{create_dict_command, CreateOptions};
use dictgen_core::guard::ProcessResources;
use dictgen_core::pipeline::DictionaryOutcome;

/// Write an AFL dictionary from the strings a binary's functions reference.
///
/// This CLI is a thin wrapper around `dictgen-core` (exposed in code as
/// `dictgen_core`); analysis, filtering and the file format live there.
#[derive(Parser, Debug)]
#[command(name = "create_dict", version, long_about = None)]
struct Cli {
    /// Binary to analyze.
    binary: PathBuf,

    /// Dictionary file to write (created or truncated).
    outfile: PathBuf,

    /// Anything after the two paths is accepted and ignored.
    #[arg(hide = true)]
    extra: Vec<OsString>,

    /// Settings file (JSON, or YAML when named *.yaml / *.yml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address-space ceiling in bytes (0 = unlimited). Overrides DRILLER_MEM_LIMIT.
    #[arg(long)]
    mem_limit: Option<u64>,

    /// Seconds before the process is interrupted (0 = never). Overrides
    /// DRILLER_DICTIONARY_TIMEOUT.
    #[arg(long)]
    timeout: Option<u32>,

    /// Analysis backend (capstone, rizin).
    #[arg(long)]
    backend: Option<String>,

    /// Architecture hint when the header does not say (x86, x86_64, arm, arm64).
    #[arg(long)]
    arch: Option<String>,

    /// Per-function instruction budget for disassembling backends.
    #[arg(long)]
    max_instructions: Option<usize>,

    /// Explicit path to the backend tool (e.g. a rizin executable).
    #[arg(long)]
    backend_path: Option<PathBuf>,

    /// Only use immediates and PC-relative operands as string candidates.
    #[arg(long, default_value_t = false)]
    no_backward_slicing: bool,

    /// Reset tracked register state at every basic block.
    #[arg(long, default_value_t = false)]
    no_input_state: bool,
}

impl From<Cli> for CreateOptions {
    fn from(cli: Cli) -> Self {
        CreateOptions {
            binary: cli.binary,
            outfile: cli.outfile,
            config: cli.config,
            mem_limit: cli.mem_limit,
            timeout: cli.timeout,
            backend: cli.backend,
            arch: cli.arch,
            max_instructions: cli.max_instructions,
            backend_path: cli.backend_path,
            no_backward_slicing: cli.no_backward_slicing,
            no_input_state: cli.no_input_state,
        }
    }
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            ErrorKind::MissingRequiredArgument => {
                log::error!("incorrect number of arguments passed to create_dict");
                return Ok(ExitCode::FAILURE);
            }
            _ => {
                log::error!("{}", e.render().to_string().trim_end());
                return Ok(ExitCode::FAILURE);
            }
        },
    };

    if !cli.extra.is_empty() {
        log::warn!("ignoring {} extra argument(s)", cli.extra.len());
    }
    let opts = CreateOptions::from(cli);
    match create_dict_command(&opts, &ProcessResources)? {
        DictionaryOutcome::Written { .. } => Ok(ExitCode::SUCCESS),
        DictionaryOutcome::Empty => Ok(ExitCode::FAILURE),
    }
}
