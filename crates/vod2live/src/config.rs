use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::window::WindowPolicy;

/// Sequencing configuration for one asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VodConfig {
    /// Target duration of one live window, in seconds.
    pub sequence_duration: f64,
    pub policy: WindowPolicy,
    /// Added on top of the computed `EXT-X-TARGETDURATION`.
    pub target_duration_padding: u64,
    /// Replaces the computed target duration when set.
    pub forced_target_duration: Option<u64>,
    /// Subtitle tracks this asset is expected to carry. Subtitle windowing
    /// without this list is a configuration error at load start.
    pub expected_subtitle_tracks: Vec<SubtitleTrack>,
}

impl Default for VodConfig {
    fn default() -> Self {
        Self {
            sequence_duration: 60.0,
            policy: WindowPolicy::default(),
            target_duration_padding: 0,
            forced_target_duration: None,
            expected_subtitle_tracks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub group_id: String,
    pub language: String,
}

/// Retry/timeout knobs for the HTTP manifest fetcher.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub fetch_timeout: Duration,
    pub max_retries: u32,
    /// Base for exponential backoff between attempts.
    pub retry_delay_base: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_delay_base: Duration::from_millis(500),
        }
    }
}
