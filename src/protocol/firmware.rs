//! Firmware versions and negotiated watch information.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::{info, warn};

fn version_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(r"v?([0-9]+)\.([0-9]+)(?:\.([0-9]+))?(?:-(.*))?").ok())
        .as_ref()
}

/// A firmware version as reported by the watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// The version tag as reported, e.g. `v4.3.1-core`.
    pub string_version: String,
    /// Build timestamp.
    pub timestamp: DateTime<Utc>,
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
    /// Text after the first `-`, if any.
    pub suffix: Option<String>,
    /// Short git hash of the build.
    pub git_hash: String,
    /// Whether this is a recovery firmware build.
    pub is_recovery: bool,
}

impl FirmwareVersion {
    /// Parse a version tag.
    ///
    /// Returns `None` if the tag has no `major.minor` pair. A missing patch
    /// number reads as 0.
    pub fn parse(
        tag: &str,
        timestamp: DateTime<Utc>,
        git_hash: impl Into<String>,
        is_recovery: bool,
    ) -> Option<Self> {
        let Some(captures) = version_regex().and_then(|re| re.captures(tag)) else {
            warn!("Couldn't decode firmware version: '{}'", tag);
            return None;
        };

        let number = |i: usize| captures.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

        Some(Self {
            string_version: tag.to_string(),
            timestamp,
            major: number(1)?,
            minor: number(2)?,
            patch: match captures.get(3) {
                Some(_) => number(3)?,
                None => 0,
            },
            suffix: captures
                .get(4)
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty()),
            git_hash: git_hash.into(),
            is_recovery,
        })
    }

    /// A bare `major.minor.patch` version.
    pub fn from_parts(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            string_version: format!("v{}.{}.{}", major, minor, patch),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            major,
            minor,
            patch,
            suffix: None,
            git_hash: String::new(),
            is_recovery: false,
        }
    }

    /// The numeric triple used for ordering.
    pub fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// Order by version number only. Suffix, build and recovery flag are
    /// ignored.
    pub fn cmp_version(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }

    /// Whether this version number is below `other`'s.
    pub fn is_older_than(&self, other: &Self) -> bool {
        self.cmp_version(other) == Ordering::Less
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.string_version)
    }
}

/// Lowest running firmware that can operate outside recovery mode.
pub fn min_normal_mode_firmware() -> FirmwareVersion {
    FirmwareVersion::from_parts(3, 0, 0)
}

/// Protocol capabilities advertised by the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolCapability {
    /// App run state endpoint.
    AppRunState,
    /// Infinite log dumping.
    InfiniteLogDumping,
    /// Extended music protocol.
    ExtendedMusic,
    /// Extended notification service.
    ExtendedNotifications,
    /// Language packs.
    LanguagePacks,
    /// 8k app messages.
    AppMessage8k,
    /// Health.
    Health,
    /// Voice.
    Voice,
}

/// Information exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchInfo {
    /// The firmware currently running.
    pub running_fw_version: FirmwareVersion,
    /// The recovery firmware installed, if any.
    pub recovery_fw_version: Option<FirmwareVersion>,
    /// Hardware platform number.
    pub platform: Option<u8>,
    /// Board name.
    pub board: String,
    /// Serial number.
    pub serial: String,
    /// Bluetooth address as `AA:BB:CC:DD:EE:FF`.
    pub bt_address: String,
    /// Installed language.
    pub language: String,
    /// Advertised capabilities.
    pub capabilities: BTreeSet<ProtocolCapability>,
}

/// Why a watch must be operated in recovery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// The watch is running its recovery firmware.
    RunningRecovery,
    /// No recovery firmware is installed.
    NoRecoveryFirmware,
    /// The running firmware is older than the minimum supported version.
    UnsupportedFirmware,
}

/// Decide whether `info` requires recovery mode.
pub fn recovery_reason(info: &WatchInfo) -> Option<RecoveryReason> {
    if info.running_fw_version.is_recovery {
        info!("Recovery firmware running; entering recovery mode");
        Some(RecoveryReason::RunningRecovery)
    } else if info.recovery_fw_version.is_none() {
        warn!("No recovery firmware installed; entering recovery mode");
        Some(RecoveryReason::NoRecoveryFirmware)
    } else if info
        .running_fw_version
        .is_older_than(&min_normal_mode_firmware())
    {
        warn!(
            "Firmware {} below {} is not supported; entering recovery mode",
            info.running_fw_version,
            min_normal_mode_firmware()
        );
        Some(RecoveryReason::UnsupportedFirmware)
    } else {
        None
    }
}

/// Format six address bytes as `AA:BB:CC:DD:EE:FF`.
pub fn format_mac_address(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
