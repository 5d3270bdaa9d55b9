//! Deterministic, rate-limited row generator. A [RateGenerator] splits a global rows-per-second
//! budget across parallel lanes; every [GeneratorLane] emits its own arithmetic sequence of values so
//! that, taken together, the lanes cover `start, start + 1, start + 2, ...` without overlap.
//!
//! Pacing is per lane: once a lane used up its quota for the current one-second window it sleeps
//! until the window ends.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::error::Error;
use crate::message::Row;
use crate::metrics::{lane_labels, metrics};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub num_lanes: u16,
    /// Global budget, shared by all lanes.
    pub rows_per_second: u64,
    pub start_value: i64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            num_lanes: 1,
            rows_per_second: 1,
            start_value: 0,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_lanes == 0 {
            return Err(Error::Config(
                "generator needs at least one lane".to_string(),
            ));
        }
        if self.rows_per_second < self.num_lanes as u64 {
            return Err(Error::Config(format!(
                "rows_per_second ({}) must be at least the number of lanes ({}) so every lane makes progress",
                self.rows_per_second, self.num_lanes
            )));
        }
        if self
            .start_value
            .checked_add(self.num_lanes as i64 - 1)
            .is_none()
        {
            return Err(Error::Config(format!(
                "start_value {} leaves no room for {} lanes",
                self.start_value, self.num_lanes
            )));
        }
        Ok(())
    }

    /// Rows per second for `lane`. The remainder of the even split goes one row each to the lowest
    /// lanes, so the quotas always add up to `rows_per_second`.
    pub fn lane_quota(&self, lane: u16) -> u64 {
        let lanes = self.num_lanes.max(1) as u64;
        let base = self.rows_per_second / lanes;
        let remainder = self.rows_per_second % lanes;
        if (lane as u64) < remainder {
            base + 1
        } else {
            base
        }
    }
}

/// One generated value with the time it was emitted at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedRow {
    pub timestamp: DateTime<Utc>,
    pub value: i64,
}

impl GeneratedRow {
    /// Encodes the row as JSON.
    pub fn into_row(self) -> Result<Row> {
        let payload = serde_json::to_vec(&self)
            .map_err(|e| Error::Serde(format!("encoding generated row: {e}")))?;
        Ok(Row::new(payload))
    }
}

/// Progress of one lane. `rows_emitted` counts the rows the lane has produced, derived from the
/// value so it survives a restart: `(current_value - start - lane) / num_lanes + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneOffset {
    pub lane: u16,
    /// Last value the lane emitted.
    pub current_value: i64,
    pub rows_emitted: u64,
}

#[derive(Debug, Clone)]
pub struct RateGenerator {
    config: GeneratorConfig,
    cancel_token: CancellationToken,
}

impl RateGenerator {
    pub fn new(config: GeneratorConfig, cancel_token: CancellationToken) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel_token,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// All lanes, starting from the beginning of their sequences.
    pub fn lanes(&self) -> Vec<GeneratorLane> {
        (0..self.config.num_lanes)
            .map(|lane| self.new_lane(lane, Some(self.first_value(lane)), None, 0))
            .collect()
    }

    pub fn lane(&self, lane: u16) -> Result<GeneratorLane> {
        self.check_lane(lane)?;
        Ok(self.new_lane(lane, Some(self.first_value(lane)), None, 0))
    }

    /// Restarts a lane right after the value recorded in `offset`.
    pub fn resume(&self, offset: LaneOffset) -> Result<GeneratorLane> {
        self.check_lane(offset.lane)?;
        let lanes = self.config.num_lanes as i64;
        let distance = offset.current_value.checked_sub(self.first_value(offset.lane));
        let Some(distance) = distance.filter(|d| *d >= 0 && d % lanes == 0) else {
            return Err(Error::Config(format!(
                "value {} was never produced by lane {}",
                offset.current_value, offset.lane
            )));
        };
        let rows_emitted = (distance / lanes + 1) as u64;
        if rows_emitted != offset.rows_emitted {
            return Err(Error::Config(format!(
                "lane {} offset claims {} rows for value {}, expected {rows_emitted}",
                offset.lane, offset.rows_emitted, offset.current_value
            )));
        }

        info!(lane = offset.lane, value = offset.current_value, "Resuming generator lane");
        Ok(self.new_lane(
            offset.lane,
            offset.current_value.checked_add(lanes),
            Some(offset.current_value),
            rows_emitted,
        ))
    }

    fn check_lane(&self, lane: u16) -> Result<()> {
        if lane >= self.config.num_lanes {
            return Err(Error::Config(format!(
                "lane {lane} out of range, generator has {} lanes",
                self.config.num_lanes
            )));
        }
        Ok(())
    }

    // validate() guarantees the last lane's first value fits
    fn first_value(&self, lane: u16) -> i64 {
        self.config.start_value.saturating_add(lane as i64)
    }

    fn new_lane(
        &self,
        lane: u16,
        next_value: Option<i64>,
        last_value: Option<i64>,
        rows_emitted: u64,
    ) -> GeneratorLane {
        GeneratorLane {
            lane,
            step: self.config.num_lanes as i64,
            quota: self.config.lane_quota(lane),
            next_value,
            last_value,
            rows_emitted,
            emitted_this_second: 0,
            window_start: None,
            cancel_token: self.cancel_token.clone(),
        }
    }
}

/// A single lane of a [RateGenerator].
#[derive(Debug)]
pub struct GeneratorLane {
    lane: u16,
    step: i64,
    quota: u64,
    /// `None` once the sequence ran past `i64::MAX`.
    next_value: Option<i64>,
    last_value: Option<i64>,
    rows_emitted: u64,
    emitted_this_second: u64,
    /// Start of the current pacing window, set on the first emission.
    window_start: Option<Instant>,
    cancel_token: CancellationToken,
}

impl GeneratorLane {
    pub fn lane(&self) -> u16 {
        self.lane
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Emits the next value of the sequence, waiting for the next one-second window if this
    /// window's quota is used up. Cancel safe: dropping the future before it resolves emits
    /// nothing, so it can be raced against an epoch tick.
    pub async fn next_row(&mut self) -> Result<GeneratedRow> {
        let Some(value) = self.next_value else {
            return Err(Error::Invariant(format!(
                "generator lane {} has no values left",
                self.lane
            )));
        };
        let now = Instant::now();
        let window_start = *self.window_start.get_or_insert(now);

        if self.emitted_this_second >= self.quota {
            let boundary = window_start + WINDOW;
            if boundary > now {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => return Err(Error::Cancelled),
                    _ = sleep_until(boundary) => {}
                }
                self.window_start = Some(boundary);
            } else {
                // the consumer fell behind, start a fresh window instead of bursting to catch up
                self.window_start = Some(now);
            }
            self.emitted_this_second = 0;
        }

        self.next_value = value.checked_add(self.step);
        self.last_value = Some(value);
        self.rows_emitted += 1;
        self.emitted_this_second += 1;

        metrics()
            .generator
            .rows_total
            .get_or_create(&lane_labels(self.lane))
            .inc();
        Ok(GeneratedRow {
            timestamp: Utc::now(),
            value,
        })
    }

    /// Progress so far, `None` if the lane has not emitted anything yet.
    pub fn offset(&self) -> Option<LaneOffset> {
        self.last_value.map(|current_value| LaneOffset {
            lane: self.lane,
            current_value,
            rows_emitted: self.rows_emitted,
        })
    }
}
