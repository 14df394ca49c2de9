//! Repository publish parameters from `server.conf`
//!
//! The repository configuration is a plain key=value file under
//! `/etc/cascadefs/repositories.d/<repo>/server.conf`. Required keys abort
//! the publish when missing; the two balancer thresholds are optional and
//! fall back to documented defaults.

use crate::chunker::ChunkerConfig;
use crate::codec::CompressionAlgorithm;
use crate::error::CoreError;
use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default balancer split threshold (catalog row count)
pub const DEFAULT_MAX_WEIGHT: u32 = 100_000;
/// Default minimum subtree weight worth splitting out
pub const DEFAULT_MIN_WEIGHT: u32 = 1_000;

/// Parsed publish parameters for one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishParams {
    /// Spooler backend definition, e.g. `local,/srv/cascadefs/repo/data/txn,/srv/cascadefs/repo`
    pub upstream_storage: String,
    /// Digest algorithm for all stored objects
    pub hash_algorithm: HashAlgorithm,
    /// Codec for all stored objects
    pub compression: CompressionAlgorithm,
    /// Emit a whole-file artifact alongside chunks for legacy readers
    pub generate_legacy_bulk_chunks: bool,
    /// Master chunking enable
    pub use_file_chunking: bool,
    /// Minimum chunk size in bytes
    pub min_chunk_size: u64,
    /// Average chunk size in bytes (power of two)
    pub avg_chunk_size: u64,
    /// Maximum chunk size in bytes
    pub max_chunk_size: u64,
    /// Enable the catalog balancer
    pub use_autocatalogs: bool,
    /// Balancer split threshold
    pub max_weight: u32,
    /// Minimum subtree weight worth splitting out
    pub min_weight: u32,
}

impl PublishParams {
    /// Conventional location of a repository's server.conf
    pub fn config_path(repo_name: &str) -> PathBuf {
        PathBuf::from(format!(
            "/etc/cascadefs/repositories.d/{repo_name}/server.conf"
        ))
    }

    /// Parse a server.conf file. Gateway (`gw,`) upstreams are rejected;
    /// this publisher only drives storage backends directly.
    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let params = Self::parse(path)?;
        if params.upstream_storage.starts_with("gw,") {
            return Err(CoreError::GatewayUpstream(params.upstream_storage));
        }
        Ok(params)
    }

    /// Parse a server.conf file, rewriting a gateway upstream to a local
    /// backend rooted at `/srv/cascadefs/<repo>`. Single-machine testing
    /// shim; production code goes through [`PublishParams::from_file`].
    pub fn from_file_for_testing(path: &Path, repo_name: &str) -> Result<Self, CoreError> {
        let mut params = Self::parse(path)?;
        if params.upstream_storage.starts_with("gw,") {
            let short_name = repo_name.rsplit('/').next().unwrap_or(repo_name);
            params.upstream_storage = format!(
                "local,/srv/cascadefs/{short_name}/data/txn,/srv/cascadefs/{short_name}"
            );
            tracing::warn!(
                repo = repo_name,
                upstream = %params.upstream_storage,
                "rewrote gateway upstream to local backend (testing only)"
            );
        }
        Ok(params)
    }

    /// The chunker bounds as a validated [`ChunkerConfig`]
    pub fn chunker_config(&self) -> Result<ChunkerConfig, CoreError> {
        let config = ChunkerConfig {
            min_size: self.min_chunk_size,
            avg_size: self.avg_chunk_size,
            max_size: self.max_chunk_size,
        };
        config.validate()?;
        Ok(config)
    }

    fn parse(path: &Path) -> Result<Self, CoreError> {
        let contents = std::fs::read_to_string(path)?;
        let values = parse_key_values(&contents);

        let params = Self {
            upstream_storage: required(&values, "CASCADEFS_UPSTREAM_STORAGE")?.to_string(),
            hash_algorithm: HashAlgorithm::parse(required(&values, "CASCADEFS_HASH_ALGORITHM")?)?,
            compression: CompressionAlgorithm::parse(required(
                &values,
                "CASCADEFS_COMPRESSION_ALGORITHM",
            )?)?,
            generate_legacy_bulk_chunks: required_bool(
                &values,
                "CASCADEFS_GENERATE_LEGACY_BULK_CHUNKS",
            )?,
            use_file_chunking: required_bool(&values, "CASCADEFS_USE_FILE_CHUNKING")?,
            min_chunk_size: required_u64(&values, "CASCADEFS_MIN_CHUNK_SIZE")?,
            avg_chunk_size: required_u64(&values, "CASCADEFS_AVG_CHUNK_SIZE")?,
            max_chunk_size: required_u64(&values, "CASCADEFS_MAX_CHUNK_SIZE")?,
            use_autocatalogs: required_bool(&values, "CASCADEFS_AUTOCATALOGS")?,
            max_weight: optional_u32(
                &values,
                "CASCADEFS_AUTOCATALOGS_MAX_WEIGHT",
                DEFAULT_MAX_WEIGHT,
            )?,
            min_weight: optional_u32(
                &values,
                "CASCADEFS_AUTOCATALOGS_MIN_WEIGHT",
                DEFAULT_MIN_WEIGHT,
            )?,
        };
        Ok(params)
    }
}

fn required<'a>(
    values: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, CoreError> {
    values
        .get(key)
        .map(String::as_str)
        .ok_or(CoreError::ConfigMissingKey(key))
}

fn required_bool(values: &HashMap<String, String>, key: &'static str) -> Result<bool, CoreError> {
    match required(values, key)? {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(CoreError::ConfigInvalidValue {
            key,
            value: other.to_string(),
        }),
    }
}

fn required_u64(values: &HashMap<String, String>, key: &'static str) -> Result<u64, CoreError> {
    let raw = required(values, key)?;
    raw.parse().map_err(|_| CoreError::ConfigInvalidValue {
        key,
        value: raw.to_string(),
    })
}

fn optional_u32(
    values: &HashMap<String, String>,
    key: &'static str,
    default: u32,
) -> Result<u32, CoreError> {
    match values.get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| CoreError::ConfigInvalidValue {
            key,
            value: raw.clone(),
        }),
    }
}

/// Parse key=value lines. Blank lines and `#` comments are skipped; values
/// may be wrapped in single or double quotes.
fn parse_key_values(contents: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        values.insert(key.trim().to_string(), value.to_string());
    }
    values
}
