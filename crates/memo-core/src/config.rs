//! Configuration structures for memo-core.
//!
//! The core crate does not read environment variables. All configuration
//! is provided explicitly by the caller so that two runs with the same
//! inputs behave identically.

use std::path::{Path, PathBuf};

/// Filename layout of a cache entry.
///
/// For a stage named `N` under cache directory `D` the entry is the sibling
/// triple `D/N.<stage_ext>`, `D/N.<inputs_ext>`, `D/N.<outputs_ext>`.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    pub stage_ext: String,
    pub inputs_ext: String,
    pub outputs_ext: String,
}

impl Default for CacheLayout {
    fn default() -> Self {
        Self {
            stage_ext: "stage".to_string(),
            inputs_ext: "inputs".to_string(),
            outputs_ext: "outputs".to_string(),
        }
    }
}

impl CacheLayout {
    /// Resolve the cache entry paths for a stage name under a directory.
    pub fn entry(&self, cache_dir: &Path, stage_name: &str) -> CacheEntryPaths {
        CacheEntryPaths {
            stage: cache_dir.join(format!("{stage_name}.{}", self.stage_ext)),
            inputs: cache_dir.join(format!("{stage_name}.{}", self.inputs_ext)),
            outputs: cache_dir.join(format!("{stage_name}.{}", self.outputs_ext)),
        }
    }
}

/// The three files that make up one persisted cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntryPaths {
    pub stage: PathBuf,
    pub inputs: PathBuf,
    pub outputs: PathBuf,
}

/// File digesting configuration.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    /// Read buffer size for streaming digests. Files larger than memory
    /// are consumed chunk by chunk.
    pub buffer_bytes: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_paths_use_stage_name_as_stem() {
        let layout = CacheLayout::default();
        let entry = layout.entry(Path::new("/tmp/cache"), "convert");
        assert_eq!(entry.stage, PathBuf::from("/tmp/cache/convert.stage"));
        assert_eq!(entry.inputs, PathBuf::from("/tmp/cache/convert.inputs"));
        assert_eq!(entry.outputs, PathBuf::from("/tmp/cache/convert.outputs"));
    }
}
