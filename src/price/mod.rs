/* Copyright 2025 Bruce Merry
 *
 * This program is free software: you can redistribute it and/or modify it
 * under the terms of the GNU General Public License as published by the Free
 * Software Foundation, either version 3 of the License, or (at your option)
 * any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
 * more details.
 *
 * You should have received a copy of the GNU General Public License along
 * with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Electricity prices and their classification into tiers

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt;

use crate::error::{Error, Result};

pub mod platform;
pub mod tariff;
pub mod tibber;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum PriceTier {
    Low,
    Normal,
    High,
}

impl fmt::Display for PriceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PriceTier::Low => "low",
            PriceTier::Normal => "normal",
            PriceTier::High => "high",
        })
    }
}

/// Prices at or below `low` are cheap; at or above `high` are expensive.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    #[serde(default = "low_default")]
    pub low: f64,
    #[serde(default = "high_default")]
    pub high: f64,
}

fn low_default() -> f64 {
    0.2
}

fn high_default() -> f64 {
    0.25
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: low_default(),
            high: high_default(),
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        if self.low < self.high {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "low price threshold {} must be below high threshold {}",
                self.low, self.high
            )))
        }
    }

    pub fn classify(&self, price: f64) -> PriceTier {
        if price <= self.low {
            PriceTier::Low
        } else if price >= self.high {
            PriceTier::High
        } else {
            PriceTier::Normal
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PricePoint {
    pub start: DateTime<Utc>,
    pub price: f64,
    pub tier: PriceTier,
}

/// Prices for consecutive slots, sorted by start time
#[derive(Clone, Debug, PartialEq)]
pub struct PriceTimeline {
    points: Vec<PricePoint>,
    end: DateTime<Utc>,
}

impl PriceTimeline {
    /// Build a timeline from (start, price) pairs.
    ///
    /// The start times must be strictly increasing. The last slot is assumed
    /// to be as long as the one before it (or an hour, if there is only one).
    pub fn new(prices: Vec<(DateTime<Utc>, f64)>, thresholds: &Thresholds) -> Result<Self> {
        if let Some(pair) = prices.windows(2).find(|pair| pair[0].0 >= pair[1].0) {
            return Err(Error::Invalid(format!(
                "price at {} does not follow {}",
                pair[1].0, pair[0].0
            )));
        }
        let n = prices.len();
        let end = match n {
            0 => return Err(Error::Invalid("empty price timeline".to_owned())),
            1 => prices[0].0 + Duration::hours(1),
            _ => prices[n - 1].0 + (prices[n - 1].0 - prices[n - 2].0),
        };
        let points = prices
            .into_iter()
            .map(|(start, price)| PricePoint {
                start,
                price,
                tier: thresholds.classify(price),
            })
            .collect();
        Ok(Self { points, end })
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// The slot containing `time`, if the timeline covers it.
    pub fn at(&self, time: DateTime<Utc>) -> Option<&PricePoint> {
        if time >= self.end {
            return None;
        }
        let idx = self.points.partition_point(|point| point.start <= time);
        idx.checked_sub(1).map(|i| &self.points[i])
    }
}

/// A value from a cache, flagged if it may be out of date.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading<T> {
    pub value: T,
    pub stale: bool,
}

impl<T> Reading<T> {
    pub fn fresh(value: T) -> Self {
        Self {
            value,
            stale: false,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reading<U> {
        Reading {
            value: f(self.value),
            stale: self.stale,
        }
    }
}

#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn current_tier(&self, now: DateTime<Utc>) -> Result<Reading<PriceTier>>;

    async fn price_at(&self, time: DateTime<Utc>) -> Result<Reading<f64>>;
}
