//! Cross-sectional selection.
//!
//! Ranks scored instruments and builds the target book for one cycle:
//! top `long_n` long, bottom `short_n` short, everything else flat.
//! During the configured reverse window the assignment is swapped.

use super::factor::MomentumScore;
use crate::exchange::Instrument;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Desired exposure for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
            Direction::Flat => write!(f, "FLAT"),
        }
    }
}

/// Target for one instrument; `notional` is signed (negative for short).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub direction: Direction,
    pub notional: Decimal,
}

impl Target {
    pub fn flat() -> Self {
        Self {
            direction: Direction::Flat,
            notional: Decimal::ZERO,
        }
    }
}

/// The full target book for one cycle.
///
/// Instruments absent from the map are flat.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetState {
    pub targets: BTreeMap<Instrument, Target>,
    /// Fewer scored instruments than `long_n + short_n`
    pub insufficient_universe: bool,
    pub reversed: bool,
}

impl TargetState {
    pub fn direction_of(&self, instrument: &Instrument) -> Direction {
        self.targets
            .get(instrument)
            .map(|t| t.direction)
            .unwrap_or(Direction::Flat)
    }

    pub fn target_of(&self, instrument: &Instrument) -> Target {
        self.targets
            .get(instrument)
            .copied()
            .unwrap_or_else(Target::flat)
    }

    pub fn longs(&self) -> Vec<&Instrument> {
        self.with_direction(Direction::Long)
    }

    pub fn shorts(&self) -> Vec<&Instrument> {
        self.with_direction(Direction::Short)
    }

    fn with_direction(&self, direction: Direction) -> Vec<&Instrument> {
        self.targets
            .iter()
            .filter(|(_, t)| t.direction == direction)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Weekly UTC window during which selection is reversed.
///
/// The window may wrap past the end of the week (e.g. Friday 20:00 to Monday 08:00).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseWindow {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_start_weekday")]
    pub start_weekday: Weekday,
    #[serde(default = "default_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_end_weekday")]
    pub end_weekday: Weekday,
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
}

fn default_start_weekday() -> Weekday {
    Weekday::Fri
}

fn default_start_hour() -> u32 {
    20
}

fn default_end_weekday() -> Weekday {
    Weekday::Mon
}

fn default_end_hour() -> u32 {
    8
}

impl Default for ReverseWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            start_weekday: default_start_weekday(),
            start_hour: default_start_hour(),
            end_weekday: default_end_weekday(),
            end_hour: default_end_hour(),
        }
    }
}

impl ReverseWindow {
    /// Whether `now` falls inside the window. Always false when disabled.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }

        let minute = minute_of_week(now.weekday(), now.hour()) + now.minute();
        let start = minute_of_week(self.start_weekday, self.start_hour);
        let end = minute_of_week(self.end_weekday, self.end_hour);

        match start.cmp(&end) {
            std::cmp::Ordering::Less => minute >= start && minute < end,
            std::cmp::Ordering::Greater => minute >= start || minute < end,
            std::cmp::Ordering::Equal => false,
        }
    }
}

fn minute_of_week(weekday: Weekday, hour: u32) -> u32 {
    weekday.num_days_from_monday() * MINUTES_PER_DAY + hour * 60
}

/// Builds target books from scores.
#[derive(Debug, Clone)]
pub struct Selector {
    long_n: usize,
    short_n: usize,
    notional_per_leg: Decimal,
}

impl Selector {
    pub fn new(long_n: usize, short_n: usize, notional_per_leg: Decimal) -> Self {
        Self {
            long_n,
            short_n,
            notional_per_leg,
        }
    }

    /// Build the target book.
    ///
    /// Ranking is by score ascending with ties broken by instrument symbol, so the
    /// result depends only on the inputs. With `reversed`, the bottom `short_n`
    /// go long and the top `long_n` go short.
    pub fn select(
        &self,
        scores: &BTreeMap<Instrument, MomentumScore>,
        reversed: bool,
    ) -> TargetState {
        let needed = self.long_n + self.short_n;

        let mut ranked: Vec<(&Instrument, &MomentumScore)> = scores.iter().collect();
        ranked.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));

        let mut state = TargetState {
            targets: ranked
                .iter()
                .map(|(instrument, _)| ((*instrument).clone(), Target::flat()))
                .collect(),
            insufficient_universe: false,
            reversed,
        };

        if ranked.len() < needed {
            warn!(
                scored = ranked.len(),
                needed,
                "Insufficient universe, no new positions this cycle"
            );
            state.insufficient_universe = true;
            return state;
        }

        let (bottom_direction, top_direction) = if reversed {
            (Direction::Long, Direction::Short)
        } else {
            (Direction::Short, Direction::Long)
        };

        let bottom = &ranked[..self.short_n];
        let top = &ranked[ranked.len() - self.long_n..];

        for (instrument, _) in bottom {
            state
                .targets
                .insert((*instrument).clone(), self.target(bottom_direction));
        }
        for (instrument, _) in top {
            state
                .targets
                .insert((*instrument).clone(), self.target(top_direction));
        }

        debug!(
            longs = ?state.longs(),
            shorts = ?state.shorts(),
            reversed,
            "Selection complete"
        );

        state
    }

    fn target(&self, direction: Direction) -> Target {
        let notional = match direction {
            Direction::Long => self.notional_per_leg,
            Direction::Short => -self.notional_per_leg,
            Direction::Flat => Decimal::ZERO,
        };
        Target {
            direction,
            notional,
        }
    }
}
