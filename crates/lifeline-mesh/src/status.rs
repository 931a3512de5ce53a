//! User-affirmed status levels.

use serde::{Deserialize, Serialize};

/// Ordered by increasing severity: `Green < Yellow < Orange < Red`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Safe and calm.
    #[default]
    Green,
    /// Stressed, but managing.
    Yellow,
    /// Struggling; peers should check in.
    Orange,
    /// Distress; needs help now.
    Red,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Green, Status::Yellow, Status::Orange, Status::Red];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Green => "green",
            Status::Yellow => "yellow",
            Status::Orange => "orange",
            Status::Red => "red",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status {:?} (expected green, yellow, orange or red)", s))
    }
}
