//! plugin-tests: sharded, isolated unit-test runs for plugin packages.
//!
//! A distribution bundles many independently versioned plugins. This crate
//! tests each of them in its own throwaway environment, optionally spread
//! over several CI nodes, and reports one outcome per plugin.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Registry**: Resolves the ordered plugin list and applies the skip list
//! - **Shard**: Assigns plugins to CI nodes round-robin
//! - **Pipeline**: Fetches, provisions and tests one plugin in isolation
//! - **Summary**: Folds outcomes into an overall result
//! - **Orchestrator**: Ties the above together with bounded concurrency
//! - **Report**: Console, JSON and JUnit XML output
//!
//! # Example
//!
//! ```no_run
//! use plugin_tests::config::load_config;
//! use plugin_tests::plugin::SkipSet;
//! use plugin_tests::registry::{resolve, source_from_config};
//! use plugin_tests::shard::plan;
//!
//! let config = load_config(std::path::Path::new("plugin-tests.toml"))?;
//! let source = source_from_config(&config.registry);
//! let plugins = resolve(source.as_ref(), &SkipSet::new())?;
//! let shard = plan(&plugins, 0, 2)?;
//! println!("node 0 tests {} plugins", shard.len());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod logs;
pub mod orchestrator;
pub mod pipeline;
pub mod plugin;
pub mod provider;
pub mod registry;
pub mod report;
pub mod shard;
pub mod summary;

// Re-export commonly used types
pub use config::{Config, ConfigError, load_config};
pub use orchestrator::{Orchestrator, RunError};
pub use pipeline::IsolationPipeline;
pub use plugin::{ExecutionOutcome, PluginSpec, PluginStatus, SkipSet};
pub use registry::{Registry, RegistryError};
pub use report::Reporter;
pub use summary::RunSummary;
