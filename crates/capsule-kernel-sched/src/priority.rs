//! Priority levels and their time slices.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Base scheduling priority of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Idle,
    Low,
    #[default]
    Normal,
    High,
    Realtime,
    /// Runs to completion and is never preempted.
    System,
}

impl Priority {
    pub const ALL: [Priority; 6] = [
        Priority::Idle,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Realtime,
        Priority::System,
    ];

    /// Numeric level, 0 (Idle) to 5 (System).
    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.get(level as usize).copied()
    }

    /// Time slice in milliseconds. Zero means no slice limit.
    pub fn base_slice_ms(&self) -> u64 {
        match self {
            Priority::Idle => 100,
            Priority::Low => 80,
            Priority::Normal => 60,
            Priority::High => 40,
            Priority::Realtime => 20,
            Priority::System => 0,
        }
    }

    pub fn is_preemptible(&self) -> bool {
        *self != Priority::System
    }

    /// Raise by `levels`, never past Realtime. System is left alone.
    pub fn boosted(&self, levels: u8) -> Priority {
        if *self == Priority::System {
            return Priority::System;
        }
        let capped = self.level().saturating_add(levels).min(Priority::Realtime.level());
        Priority::from_level(capped).unwrap_or(Priority::Realtime)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Idle => "idle",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Realtime => "realtime",
            Priority::System => "system",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slices_shrink_with_priority() {
        let slices: Vec<u64> = Priority::ALL.iter().map(|p| p.base_slice_ms()).collect();
        assert_eq!(slices, vec![100, 80, 60, 40, 20, 0]);
    }

    #[test]
    fn test_boost_caps_at_realtime() {
        assert_eq!(Priority::Low.boosted(2), Priority::High);
        assert_eq!(Priority::High.boosted(2), Priority::Realtime);
        assert_eq!(Priority::Realtime.boosted(1), Priority::Realtime);
        assert_eq!(Priority::System.boosted(0), Priority::System);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Priority::Realtime).unwrap(), "\"realtime\"");
        let p: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(p, Priority::Low);
    }
}
