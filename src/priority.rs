use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scheduling priority for tasks, agents and resource requests.
/// Higher values = more urgent. Any integer is accepted; the named
/// levels are the values used by plan files and labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// `low` (1)
    pub const LOW: Priority = Priority(1);
    /// `normal` (5), the default
    pub const NORMAL: Priority = Priority(5);
    /// `high` (10)
    pub const HIGH: Priority = Priority(10);
    /// `critical` (100)
    pub const CRITICAL: Priority = Priority(100);

    /// Determine priority from a set of labels. Numeric labels are taken
    /// literally; the highest match wins.
    pub fn from_labels(labels: &[impl AsRef<str>]) -> Self {
        let mut highest: Option<Priority> = None;

        for label in labels {
            let Ok(priority) = label.as_ref().parse::<Priority>() else {
                continue;
            };
            if highest.map_or(true, |current| priority > current) {
                highest = Some(priority);
            }
        }

        highest.unwrap_or_default()
    }

    pub fn value(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let label = trimmed.strip_prefix("priority:").unwrap_or(trimmed);
        match label.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::LOW),
            "normal" | "medium" => Ok(Priority::NORMAL),
            "high" => Ok(Priority::HIGH),
            "critical" | "urgent" => Ok(Priority::CRITICAL),
            other => other
                .parse::<i32>()
                .map(Priority)
                .map_err(|_| format!("unrecognised priority label: {s}")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Priority::CRITICAL => write!(f, "CRITICAL"),
            Priority::HIGH => write!(f, "HIGH"),
            Priority::NORMAL => write!(f, "NORMAL"),
            Priority::LOW => write!(f, "LOW"),
            Priority(value) => write!(f, "{value}"),
        }
    }
}
