//! Caller-selected modes for claim and reset.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::WpNumber;
use crate::error::SchedulerError;

/// How `claim` picks among eligible work packages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimMode {
    /// Lowest eligible `wp_number`.
    #[default]
    Sequential,

    /// Uniformly random among eligible packages.
    Random,
}

/// Which rows `reset` drives back to Ready.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// Suspended rows only.
    #[default]
    Suspended,

    /// Running rows; their lock flags are cleared.
    Running,

    /// Every row regardless of status; all lock flags are cleared.
    All,

    /// The listed work packages; their lock flags are cleared.
    Specific(Vec<WpNumber>),
}

impl ResetScope {
    /// Parse the mode name, attaching `wps` for `specific`.
    pub fn parse(mode: &str, wps: Vec<WpNumber>) -> Result<Self, SchedulerError> {
        match mode {
            "suspended" => Ok(ResetScope::Suspended),
            "running" => Ok(ResetScope::Running),
            "all" => Ok(ResetScope::All),
            "specific" => Ok(ResetScope::Specific(wps)),
            other => Err(SchedulerError::InvalidResetMode(other.to_string())),
        }
    }

    /// Does this reset clear lock flags on the rows it touches?
    pub fn clears_lock(&self) -> bool {
        !matches!(self, ResetScope::Suspended)
    }

    /// Could this reset touch a row currently Running?
    pub fn may_touch(&self, wp: WpNumber) -> bool {
        match self {
            ResetScope::Suspended => false,
            ResetScope::Running | ResetScope::All => true,
            ResetScope::Specific(wps) => wps.contains(&wp),
        }
    }
}

impl FromStr for ResetScope {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResetScope::parse(s, Vec::new())
    }
}
