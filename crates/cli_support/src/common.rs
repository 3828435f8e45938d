use clap::{Args, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Compute backend selectable on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    NdArray,
    Wgpu,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::NdArray => "ndarray",
            BackendKind::Wgpu => "wgpu",
        }
    }
}

/// Runtime options shared by `train` and `eval`.
#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
    /// Worker threads for data preparation (defaults to all cores).
    #[arg(long)]
    pub num_threads: Option<usize>,
    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOpts {
    pub backend: BackendKind,
    pub verbose: bool,
}

impl From<&RuntimeArgs> for RuntimeOpts {
    fn from(args: &RuntimeArgs) -> Self {
        RuntimeOpts {
            backend: args.backend.unwrap_or_default(),
            verbose: args.verbose,
        }
    }
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over `verbose`.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Sizes the global rayon pool and returns the thread count in effect.
///
/// The global pool can only be built once per process; if it already exists
/// the existing size is returned and the request is logged.
pub fn configure_thread_pool(num_threads: Option<usize>) -> usize {
    let Some(requested) = num_threads.filter(|n| *n > 0) else {
        return rayon::current_num_threads();
    };
    match rayon::ThreadPoolBuilder::new()
        .num_threads(requested)
        .build_global()
    {
        Ok(()) => requested,
        Err(e) => {
            tracing::warn!(requested, "thread pool already configured: {e}");
            rayon::current_num_threads()
        }
    }
}

/// Expands `~` or a leading `~/` to `$HOME`. `~user` forms are left alone.
pub fn expand_path(raw: &str) -> PathBuf {
    let rest = match raw {
        "~" => Some(""),
        _ => raw.strip_prefix("~/"),
    };
    if let Some(rest) = rest {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(raw)
}
