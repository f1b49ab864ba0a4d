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

//! Solar production forecast from Solcast
//!
//! The forecast is a list of periods with an average PV power estimate. It
//! is fetched periodically and replaced wholesale; between fetches the
//! controller only reads the cached copy.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::price::Reading;

const SOLCAST_URL: &str = "https://api.solcast.com.au";

#[derive(Clone, Debug, Deserialize)]
pub struct SolcastPeriod {
    /// Average PV power over the period, in kW
    pub pv_estimate: f64,
    pub period_end: DateTime<Utc>,
    #[serde(default = "period_default")]
    pub period: String,
}

fn period_default() -> String {
    "PT30M".to_owned()
}

#[derive(Deserialize)]
struct ForecastResponse {
    forecasts: Vec<SolcastPeriod>,
}

/// Parse the subset of ISO 8601 durations Solcast uses (e.g. `PT30M`).
fn parse_period(period: &str) -> Option<Duration> {
    let rest = period.strip_prefix("PT")?;
    if let Some(minutes) = rest.strip_suffix('M') {
        minutes.parse().ok().map(Duration::minutes)
    } else if let Some(hours) = rest.strip_suffix('H') {
        hours.parse().ok().map(Duration::hours)
    } else {
        None
    }
}

pub struct API {
    url: String,
    key: String,
    resource_id: String,
    hours: u32,
    client: Client,
}

impl API {
    pub fn new(
        key: impl Into<String>,
        resource_id: impl Into<String>,
        hours: u32,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        Ok(Self {
            url: SOLCAST_URL.to_owned(),
            key: key.into(),
            resource_id: resource_id.into(),
            hours,
            client: reqwest::ClientBuilder::new().timeout(timeout).build()?,
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub async fn forecasts(&self) -> Result<Vec<SolcastPeriod>> {
        let url = format!("{}/rooftop_sites/{}/forecasts", self.url, self.resource_id);
        let response: ForecastResponse = self
            .client
            .get(&url)
            .query(&[("format", "json"), ("hours", &self.hours.to_string())])
            .bearer_auth(&self.key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.forecasts)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForecastPoint {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Predicted PV energy in kWh
    pub pv_energy: f64,
    /// PV energy minus baseline consumption, in kWh
    pub excess: f64,
}

impl ForecastPoint {
    fn hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }

    /// Average PV power (kW)
    pub fn pv_power(&self) -> f64 {
        let hours = self.hours();
        if hours > 0.0 {
            self.pv_energy / hours
        } else {
            0.0
        }
    }
}

/// When PV production is first expected to cover a given demand
#[derive(Clone, Debug, PartialEq)]
pub struct DemandMet {
    pub time: DateTime<Utc>,
    /// PV energy (kWh) produced between now and `time`
    pub energy_before: f64,
}

struct Cached {
    points: Vec<ForecastPoint>,
    fetched: DateTime<Utc>,
    failed: bool,
}

pub struct SolarForecast {
    baseline_consumption: f64,
    max_age: Duration,
    cache: Mutex<Option<Cached>>,
}

impl SolarForecast {
    /// `baseline_consumption` is the household's average demand in kW.
    pub fn new(baseline_consumption: f64, max_age: Duration) -> Self {
        Self {
            baseline_consumption,
            max_age,
            cache: Mutex::new(None),
        }
    }

    /// Average household demand (kW)
    pub fn baseline_consumption(&self) -> f64 {
        self.baseline_consumption
    }

    fn to_points(&self, periods: Vec<SolcastPeriod>) -> Vec<ForecastPoint> {
        let mut points: Vec<_> = periods
            .into_iter()
            .map(|period| {
                let length = parse_period(&period.period).unwrap_or(Duration::minutes(30));
                let hours = length.num_seconds() as f64 / 3600.0;
                let pv_energy = period.pv_estimate * hours;
                ForecastPoint {
                    start: period.period_end - length,
                    end: period.period_end,
                    pv_energy,
                    excess: pv_energy - self.baseline_consumption * hours,
                }
            })
            .collect();
        points.sort_by_key(|point| point.start);
        points
    }

    /// Record the outcome of a fetch made at `now`.
    pub fn update(&self, result: Result<Vec<SolcastPeriod>>, now: DateTime<Utc>) {
        let mut lock = self.cache.lock().unwrap();
        match result {
            Ok(periods) => {
                let points = self.to_points(periods);
                info!("Successfully updated solar forecast ({} periods)", points.len());
                *lock = Some(Cached {
                    points,
                    fetched: now,
                    failed: false,
                });
            }
            Err(err) => {
                warn!("Failed to update solar forecast: {err}");
                if let Some(cached) = lock.as_mut() {
                    cached.failed = true;
                }
            }
        }
    }

    fn with_cache<T>(
        &self,
        now: DateTime<Utc>,
        f: impl FnOnce(&[ForecastPoint]) -> T,
    ) -> Result<Reading<T>> {
        let lock = self.cache.lock().unwrap();
        let cached = lock
            .as_ref()
            .ok_or_else(|| Error::unavailable("solar forecast"))?;
        Ok(Reading {
            value: f(&cached.points),
            stale: cached.failed || now - cached.fetched > self.max_age,
        })
    }

    /// Excess energy (kWh) over the periods starting in `[start, end)`.
    ///
    /// Periods are counted whole; there is no interpolation within a period.
    pub fn excess_energy(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Reading<f64>> {
        self.with_cache(now, |points| {
            points
                .iter()
                .filter(|point| start <= point.start && point.start < end)
                .map(|point| point.excess)
                .sum()
        })
    }

    /// Forecast PV power (kW) for the period containing `now`.
    pub fn pv_power(&self, now: DateTime<Utc>) -> Result<Reading<Option<f64>>> {
        self.with_cache(now, |points| {
            points
                .iter()
                .find(|point| point.start <= now && now < point.end)
                .map(ForecastPoint::pv_power)
        })
    }

    /// First period starting after `now` whose average PV power reaches
    /// `demand` (kW).
    pub fn next_meets_demand(
        &self,
        now: DateTime<Utc>,
        demand: f64,
    ) -> Result<Reading<Option<DemandMet>>> {
        self.with_cache(now, |points| {
            let mut energy_before = 0.0;
            for point in points.iter().filter(|point| point.start > now) {
                if point.pv_power() >= demand {
                    return Some(DemandMet {
                        time: point.start,
                        energy_before,
                    });
                }
                energy_before += point.pv_energy;
            }
            None
        })
    }
}

pub async fn poll_forecast(
    api: &API,
    forecast: &SolarForecast,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = token.cancelled() => break,
        }
        forecast.update(api.forecasts().await, Utc::now());
    }
}
