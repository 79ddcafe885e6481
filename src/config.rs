use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{RecorderError, Result};

/// Seconds between encoded frames when hardware video encoding is available.
pub const FRAME_INTERVAL_ACCELERATED_SECS: i64 = 2;
/// Fallback cadence for software encoding.
pub const FRAME_INTERVAL_SOFTWARE_SECS: i64 = 4;

/// Recorded duration (seconds) an episode must exceed before the optional
/// file-change tracking side effect runs.
pub const FILE_TRACKING_MIN_SECS: i64 = 30;

static DEFAULT_PRIVACY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["(?i)incognito", "(?i)private", "(?i)^duckduckgo\\.com$"]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});

const DEFAULT_BROWSER_BUNDLES: &[&str] = &[
    "com.apple.Safari",
    "com.google.Chrome",
    "org.mozilla.firefox",
    "com.microsoft.edgemac",
    "com.brave.Browser",
    "company.thebrowser.Browser",
];

/// Configuration consumed (not owned) by the recording core.
#[derive(Clone)]
pub struct RecorderConfig {
    /// Root directory for video assets, laid out as `YYYY/MM/DD/<title>.mp4`.
    pub data_dir: PathBuf,
    /// Days of history to keep. 0 means retain forever.
    pub retention_days: u32,
    /// Fixed inter-frame interval driving the container timeline.
    pub seconds_per_frame: i64,
    /// Enables the recent-file scan after long episodes.
    pub track_files: bool,
    /// Directory scanned by file tracking (typically the home directory).
    pub tracked_files_root: Option<PathBuf>,
    /// Capture resolution the encoder session is sized to.
    pub capture_width: u32,
    pub capture_height: u32,
    /// The recorder's own bundle identifier; never recorded.
    pub own_bundle: String,
    /// Episodes closing with fewer accepted frames than this are suppressed.
    pub min_frame_count: u64,
    privacy_patterns: Vec<Regex>,
    browser_bundles: Vec<String>,
}

impl RecorderConfig {
    pub fn new(data_dir: PathBuf, retention_days: u32, hardware_accelerated: bool) -> Self {
        let seconds_per_frame = if hardware_accelerated {
            FRAME_INTERVAL_ACCELERATED_SECS
        } else {
            FRAME_INTERVAL_SOFTWARE_SECS
        };
        Self {
            data_dir,
            retention_days,
            seconds_per_frame,
            track_files: false,
            tracked_files_root: dirs::home_dir(),
            capture_width: 1920,
            capture_height: 1080,
            own_bundle: "io.episodic.recorder".to_string(),
            min_frame_count: 1,
            privacy_patterns: DEFAULT_PRIVACY_PATTERNS.clone(),
            browser_bundles: DEFAULT_BROWSER_BUNDLES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Replace the privacy rules with user-supplied patterns.
    pub fn with_privacy_patterns(mut self, patterns: &[String]) -> Result<Self> {
        self.privacy_patterns = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| RecorderError::Config(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    pub fn with_capture_size(mut self, width: u32, height: u32) -> Self {
        self.capture_width = width;
        self.capture_height = height;
        self
    }

    pub fn with_file_tracking(mut self, enabled: bool) -> Self {
        self.track_files = enabled;
        self
    }

    /// True when the context identifier matches any privacy heuristic.
    pub fn is_private_context(&self, context: &str) -> bool {
        self.privacy_patterns.iter().any(|p| p.is_match(context))
    }

    /// True when the bundle belongs to a browser-like process whose page
    /// context should be resolved via the address bar.
    pub fn is_browser_bundle(&self, bundle: &str) -> bool {
        self.browser_bundles.iter().any(|b| b == bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RecorderConfig {
        RecorderConfig::new(PathBuf::from("/tmp/episodic"), 30, true)
    }

    #[test]
    fn cadence_follows_hardware_flag() {
        assert_eq!(config().seconds_per_frame, FRAME_INTERVAL_ACCELERATED_SECS);
        let sw = RecorderConfig::new(PathBuf::from("/tmp"), 30, false);
        assert_eq!(sw.seconds_per_frame, FRAME_INTERVAL_SOFTWARE_SECS);
    }

    #[test]
    fn default_privacy_patterns_match() {
        let c = config();
        assert!(c.is_private_context("Incognito"));
        assert!(!c.is_private_context("github.com"));
    }

    #[test]
    fn custom_privacy_patterns_replace_defaults() {
        let c = config()
            .with_privacy_patterns(&["^bank\\.".to_string()])
            .unwrap();
        assert!(c.is_private_context("bank.example.com"));
        assert!(!c.is_private_context("incognito"));
    }

    #[test]
    fn browser_bundles() {
        let c = config();
        assert!(c.is_browser_bundle("com.apple.Safari"));
        assert!(!c.is_browser_bundle("com.apple.dt.Xcode"));
    }

    #[test]
    fn invalid_privacy_pattern_is_config_error() {
        assert!(config().with_privacy_patterns(&["(".to_string()]).is_err());
    }
}
