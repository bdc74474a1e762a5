use std::path::PathBuf;
use std::time::Duration;

use crate::error::DownloadError;
use crate::playlist::VariantSelectionPolicy;

/// Configuration for a VOD download run.
///
/// Everything here is per-downloader; there is no process-global state.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Scratch directory for segment files and the progress file.
    pub work_dir: PathBuf,
    /// Final combined output file.
    pub output_path: PathBuf,
    /// Fixed size of the segment worker pool. Must be >= 1.
    pub num_workers: usize,
    /// Delete segment files as they are folded into the output.
    pub cleanup_segments_on_complete: bool,
    /// Fail the parse on unrecognized tags and over-long segment durations.
    pub strict_parse: bool,
    /// TCP connect timeout for every fetch.
    pub connect_timeout: Duration,
    /// Read timeout for every fetch.
    pub read_timeout: Duration,
    /// Total attempts per fetch, counting the first.
    pub max_attempts: u32,
    /// Base for the exponential retry backoff.
    pub retry_base_delay: Duration,
    /// How long to wait for outstanding workers after a terminal condition
    /// before abandoning them.
    pub shutdown_grace: Duration,
    /// Which variant to follow when the URL points at a master playlist.
    pub variant_policy: VariantSelectionPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            output_path: PathBuf::from("output.ts"),
            num_workers: 1,
            cleanup_segments_on_complete: true,
            strict_parse: false,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            variant_policy: VariantSelectionPolicy::default(),
        }
    }
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.num_workers == 0 {
            return Err(DownloadError::invalid_config("num_workers must be >= 1"));
        }
        if self.max_attempts == 0 {
            return Err(DownloadError::invalid_config("max_attempts must be >= 1"));
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(DownloadError::invalid_config("work_dir must not be empty"));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(DownloadError::invalid_config(
                "output_path must not be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DownloadConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = DownloadConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DownloadError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let config = DownloadConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DownloadError::InvalidConfig { .. })
        ));
    }
}
