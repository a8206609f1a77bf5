//! Storage manager configuration
//!
//! Tuning knobs arrive from the deployment's config file; two environment
//! variables override at construction time:
//!
//! - `GRIST_BACKUP_DELAY_SECS` — debounce window before a changed document
//!   is pushed (default 15).
//! - `GRIST_DISABLE_S3` — `"true"` disables remote storage entirely;
//!   documents live on the local filesystem only.

use serde::{Deserialize, Serialize};

/// Debounce and retry settings for the storage manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocStorageOptions {
    /// Debounce window between the last change notification and the push.
    pub seconds_before_push: u64,
    /// First retry delay for failed pushes and store inconsistencies.
    pub seconds_before_first_retry: u64,
    /// Whether "last edited" times are pushed to the workspace database.
    pub push_doc_update_times: bool,
}

impl Default for DocStorageOptions {
    fn default() -> Self {
        Self {
            seconds_before_push: 15,
            seconds_before_first_retry: 3,
            push_doc_update_times: true,
        }
    }
}

impl DocStorageOptions {
    /// Defaults with environment overrides applied. Read once at
    /// construction; later environment changes have no effect.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(secs) = read_env_u64("GRIST_BACKUP_DELAY_SECS") {
            options.seconds_before_push = secs;
        }
        options
    }
}

/// Whether `GRIST_DISABLE_S3` turns remote storage off.
pub fn s3_disabled_by_env() -> bool {
    std::env::var("GRIST_DISABLE_S3")
        .map(|v| v == "true")
        .unwrap_or(false)
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = DocStorageOptions::default();
        assert_eq!(options.seconds_before_push, 15);
        assert_eq!(options.seconds_before_first_retry, 3);
        assert!(options.push_doc_update_times);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let options: DocStorageOptions =
            serde_json::from_str(r#"{"secondsBeforePush": 2}"#).unwrap();
        assert_eq!(options.seconds_before_push, 2);
        assert_eq!(options.seconds_before_first_retry, 3);
    }
}
