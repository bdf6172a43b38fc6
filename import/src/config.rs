//! Configuration fields the import core consumes.
//!
//! All values are read when the pipeline is constructed; only the provider
//! list hot-swaps at runtime (through [crate::pool::PoolManager]).

use std::path::PathBuf;

use serde::Deserialize;

fn default_max_workers() -> usize {
    8
}

fn default_max_cache_size_mb() -> u64 {
    32
}

fn default_max_validation_concurrency() -> usize {
    10
}

fn default_port() -> u16 {
    119
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Informational; external path mapping uses it, the core does not.
    #[serde(default)]
    pub mount_path: Option<PathBuf>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub importer: ImporterConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataConfig {
    /// Root directory of the metadata store.
    pub root_path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Parallel article fetches per sequential stream.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Upper bound on decoded articles held in flight, per stream.
    #[serde(default = "default_max_cache_size_mb")]
    pub max_cache_size_mb: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            providers: Vec::new(),
            max_workers: default_max_workers(),
            max_cache_size_mb: default_max_cache_size_mb(),
        }
    }
}

impl PoolConfig {
    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_size_mb * 1024 * 1024
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub max_connections: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImporterConfig {
    /// Concurrency cap for segment reachability probes.
    #[serde(default = "default_max_validation_concurrency")]
    pub max_validation_concurrency: usize,

    /// Probe every segment instead of a sample.
    #[serde(default)]
    pub full_segment_validation: bool,

    /// Media extensions recognized when deriving folder names from NZB
    /// filenames (`Movie.mkv.nzb` -> `Movie`).
    #[serde(default)]
    pub allowed_file_extensions: Vec<String>,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        ImporterConfig {
            max_validation_concurrency: default_max_validation_concurrency(),
            full_segment_validation: false,
            allowed_file_extensions: Vec::new(),
        }
    }
}
