//! Status enums stored as Postgres `TEXT`/enum types via explicit
//! `Display`/`FromStr`, rather than the source's "stringified-integer"
//! enum values (spec §9 redesign flag).

use std::fmt;
use std::str::FromStr;

/// `CrawlingStatus` — spec §3. Terminal: `Completed`, `Failed`, `Blocked`,
/// `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlingStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Queued,
    Blocked,
    Stopping,
    Stopped,
}

impl CrawlingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked | Self::Stopped)
    }
}

impl fmt::Display for CrawlingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Queued => "queued",
            Self::Blocked => "blocked",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for CrawlingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "queued" => Ok(Self::Queued),
            "blocked" => Ok(Self::Blocked),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown crawling status: {other}")),
        }
    }
}

/// `ScheduledItem`/`PredefinedItem` status — spec §3. Terminal: `Completed`,
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

/// Maximum retry count before an item is moved to `Failed` terminally.
/// Spec §3: `retry_count <= MAX_RETRIES` (3).
pub const MAX_RETRIES: i32 = 3;
