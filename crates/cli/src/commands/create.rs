use std::path::PathBuf;

use anyhow::{Context, Result};

use dictgen_core::config::{DictConfig, ResourceLimits};
use dictgen_core::guard::{self, ResourceControl};
use dictgen_core::pipeline::{create_dictionary, DictionaryOutcome};
use dictgen_core::services::analysis::{
    default_backend_registry, AnalysisRequest, DEFAULT_BACKEND,
};

use crate::sha256_file;

/// Everything the command line can say about one run.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub binary: PathBuf,
    pub outfile: PathBuf,
    pub config: Option<PathBuf>,
    pub mem_limit: Option<u64>,
    pub timeout: Option<u32>,
    pub backend: Option<String>,
    pub arch: Option<String>,
    pub max_instructions: Option<usize>,
    pub backend_path: Option<PathBuf>,
    pub no_backward_slicing: bool,
    pub no_input_state: bool,
}

/// Settings after merging flags, environment, config file and defaults.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub limits: ResourceLimits,
    pub backend: String,
    pub request: AnalysisRequest,
}

/// Merge sources with precedence flag > environment > config file > default.
pub fn resolve_settings(opts: &CreateOptions, env: ResourceLimits) -> Result<ResolvedSettings> {
    let file = match &opts.config {
        Some(path) => DictConfig::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => DictConfig::default(),
    };

    let flags = ResourceLimits { mem_limit: opts.mem_limit, timeout_secs: opts.timeout };
    let limits = file.limits().overlay(env).overlay(flags);

    let mut options = file.cfg_options();
    if opts.no_backward_slicing {
        options.advanced_backward_slicing = false;
    }
    if opts.no_input_state {
        options.keep_input_state = false;
    }
    if opts.max_instructions.is_some() {
        options.max_instructions = opts.max_instructions;
    }

    let mut request = AnalysisRequest::new(&opts.binary);
    request.arch = opts.arch.clone().or(file.arch);
    request.backend_path = opts.backend_path.clone().or(file.backend_path);
    request.options = options;

    let backend = opts.backend.clone().or(file.backend).unwrap_or_else(|| DEFAULT_BACKEND.into());
    Ok(ResolvedSettings { limits, backend, request })
}

/// Guard the process, analyze the binary and write the dictionary.
pub fn create_dict_command(
    opts: &CreateOptions,
    control: &dyn ResourceControl,
) -> Result<DictionaryOutcome> {
    let env = ResourceLimits::from_env().context("Invalid resource limit in environment")?;
    let settings = resolve_settings(opts, env)?;
    guard::install(&settings.limits, control).context("Failed to install resource limits")?;

    let registry = default_backend_registry();
    let backend = registry.resolve(&settings.backend)?;
    log::info!("analyzing {} with the {} backend", opts.binary.display(), backend.name());
    match sha256_file(&opts.binary) {
        Ok(hash) => log::info!("sha256 {hash}"),
        Err(err) => log::debug!("no fingerprint: {err:#}"),
    }

    let outcome = create_dictionary(backend, &settings.request, &opts.outfile).with_context(
        || format!("Failed to build dictionary for {}", opts.binary.display()),
    )?;
    if outcome == DictionaryOutcome::Empty {
        log::warn!("no usable strings found; {} not written", opts.outfile.display());
    }
    Ok(outcome)
}
