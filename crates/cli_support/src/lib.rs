//! Shared command-line pieces for the training binaries.

pub mod common;

pub use common::{
    configure_thread_pool, expand_path, init_tracing, BackendKind, RuntimeArgs, RuntimeOpts,
};
