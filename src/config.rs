//! Pacing knobs for peer-to-peer snapshot downloads.
//!
//! We serialize to json because the data is small and short-lived, and we
//! only expect our own Rust code to deserialize what we write, so we can
//! use all the flexibility offered by serde_json.
use serde::Deserialize;
use serde::Serialize;

/// The minimum sustained transfer rate we are willing to tolerate from a
/// peer, in KB/s.  Slower transfers hit the per-file timeout.
const DEFAULT_LOW_SPEED_LIMIT_KBPS: u64 = 50;

/// The floor for the per-file timeout, in seconds: small files still get
/// this much time.
const DEFAULT_LOW_SPEED_TIME_SECS: u64 = 300;

/// Transfer pacing configuration.
///
/// A fixed per-file timeout either kills large transfers or hides stalls,
/// so the GET timeout is derived from the advertised file size and these
/// two knobs (see `estimated_download_timeout`).
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Minimum tolerated transfer rate, in KB/s.
    #[serde(default = "default_low_speed_limit_kbps")]
    pub download_low_speed_limit_kbps: u64,

    /// Timeout floor, in seconds.
    #[serde(default = "default_low_speed_time")]
    pub download_low_speed_time: u64,
}

fn default_low_speed_limit_kbps() -> u64 {
    DEFAULT_LOW_SPEED_LIMIT_KBPS
}

fn default_low_speed_time() -> u64 {
    DEFAULT_LOW_SPEED_TIME_SECS
}

impl Default for TransferConfig {
    fn default() -> TransferConfig {
        TransferConfig {
            download_low_speed_limit_kbps: DEFAULT_LOW_SPEED_LIMIT_KBPS,
            download_low_speed_time: DEFAULT_LOW_SPEED_TIME_SECS,
        }
    }
}

impl TransferConfig {
    /// Returns the per-file GET timeout, in seconds, for a file of
    /// `size` bytes: the time the file would take at the minimum
    /// tolerated rate, but never below the configured floor.
    pub fn estimated_download_timeout(&self, size: u64) -> u64 {
        let estimate = size / self.download_low_speed_limit_kbps / 1024;
        estimate.max(self.download_low_speed_time)
    }
}

#[test]
fn test_serialization_smoke_test() {
    let config = TransferConfig {
        download_low_speed_limit_kbps: 1024,
        download_low_speed_time: 30,
    };

    let expected = "{\"download_low_speed_limit_kbps\":1024,\"download_low_speed_time\":30}";

    assert_eq!(
        serde_json::to_string(&config).expect("should serialize"),
        expected
    );

    assert_eq!(
        serde_json::from_str::<TransferConfig>(expected).expect("should deserialize"),
        config
    );

    // Missing fields fall back to the defaults.
    assert_eq!(
        serde_json::from_str::<TransferConfig>("{}").expect("should deserialize"),
        TransferConfig::default()
    );
}

/// A 100 MiB file at 1024 KB/s takes 100 seconds, which dominates the
/// 30 second floor.
#[test]
fn test_timeout_scales_with_size() {
    let config = TransferConfig {
        download_low_speed_limit_kbps: 1024,
        download_low_speed_time: 30,
    };

    assert_eq!(config.estimated_download_timeout(100 * 1024 * 1024), 100);
}

/// Small files get the floor.
#[test]
fn test_timeout_floor() {
    let config = TransferConfig {
        download_low_speed_limit_kbps: 1024,
        download_low_speed_time: 30,
    };

    assert_eq!(config.estimated_download_timeout(4096), 30);
    assert_eq!(config.estimated_download_timeout(0), 30);
}
