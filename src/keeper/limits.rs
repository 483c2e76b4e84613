//! Sliding-window rate limits over historical order placements.
//!
//! A rule `(period, amount)` permits a placement of `a` at time `t` iff the
//! sum of recorded placements of the same side within `[t - period, t]`
//! plus `a` stays at or below `amount`. The allowance of a side is the
//! minimum across all of its rules; no rules means unlimited.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::keeper::exchange::Side;

/// One rate-limit rule: an amount cap over a sliding window.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimitRule {
    #[serde(deserialize_with = "deserialize_period")]
    pub period: Duration,
    pub amount: f64,
}

impl LimitRule {
    pub fn new(period: Duration, amount: f64) -> Self {
        Self { period, amount }
    }

    fn available(&self, history: &SideHistory, now: Instant) -> f64 {
        let used = history.used_within(self.period, now);
        (self.amount - used).max(0.0)
    }
}

/// Parses the `<N><s|m|h|d|w>` period grammar, e.g. `"1h"` or `"30m"`.
fn deserialize_period<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_period(&raw).map_err(de::Error::custom)
}

pub(crate) fn parse_period(raw: &str) -> Result<Duration, String> {
    let (number, unit) = raw.split_at(raw.len().saturating_sub(1));
    let per_unit = match unit {
        "s" => 1u64,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        _ => return Err(format!("unknown period unit in {raw:?}")),
    };
    let count: u64 = number
        .parse()
        .map_err(|_| format!("bad period count in {raw:?}"))?;
    if count == 0 {
        return Err(format!("zero period in {raw:?}"));
    }
    Ok(Duration::from_secs(count * per_unit))
}

/// Rate-limit rules for one side of the book.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Limits {
    rules: Vec<LimitRule>,
}

impl Limits {
    pub fn new(rules: Vec<LimitRule>) -> Self {
        Self { rules }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rules.is_empty()
    }

    /// Maximum additional amount allowed right now, the minimum across all
    /// rules. `INFINITY` when no rules are configured.
    pub fn available(&self, history: &SideHistory, now: Instant) -> f64 {
        self.rules
            .iter()
            .map(|rule| rule.available(history, now))
            .fold(f64::INFINITY, f64::min)
    }

    /// The widest window any rule looks back over; history older than this
    /// can be pruned.
    pub fn horizon(&self) -> Duration {
        self.rules
            .iter()
            .map(|rule| rule.period)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rules.is_empty() {
            return f.write_str("unlimited");
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} per {:?}", rule.amount, rule.period)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    at: Instant,
    amount: f64,
}

/// Append-only record of placements for one side.
#[derive(Debug, Default)]
pub struct SideHistory {
    entries: VecDeque<HistoryEntry>,
}

impl SideHistory {
    pub fn record(&mut self, now: Instant, amount: f64) {
        self.entries.push_back(HistoryEntry { at: now, amount });
    }

    fn used_within(&self, period: Duration, now: Instant) -> f64 {
        self.entries
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.at) < period)
            .map(|entry| entry.amount)
            .sum()
    }

    /// Drop entries older than `horizon`. Retention must cover the largest
    /// window of any active rule.
    pub fn prune(&mut self, horizon: Duration, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) > horizon {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Placement history for both sides, owned by the control task.
#[derive(Debug, Default)]
pub struct PlacementHistory {
    pub buy: SideHistory,
    pub sell: SideHistory,
}

impl PlacementHistory {
    pub fn side_mut(&mut self, side: Side) -> &mut SideHistory {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    pub fn side(&self, side: Side) -> &SideHistory {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }
}
