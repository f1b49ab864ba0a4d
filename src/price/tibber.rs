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

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{PriceSource, PriceTier, PriceTimeline, Reading, Thresholds};
use crate::error::{Error, Result};

const TIBBER_URL: &str = "https://api.tibber.com/v1-beta/gql";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub total: f64,
    pub starts_at: DateTime<FixedOffset>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PriceInfo {
    #[serde(default)]
    pub today: Vec<Slot>,
    #[serde(default)]
    pub tomorrow: Vec<Slot>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subscription {
    price_info: PriceInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Home {
    current_subscription: Option<Subscription>,
}

#[derive(Deserialize)]
struct Viewer {
    home: Option<Home>,
    #[serde(default)]
    homes: Vec<Home>,
}

#[derive(Deserialize)]
struct Data {
    viewer: Viewer,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct Response {
    data: Option<Data>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

const PRICE_FIELDS: &str =
    "currentSubscription { priceInfo { today { total startsAt } tomorrow { total startsAt } } }";

pub struct API {
    url: String,
    token: String,
    home_id: Option<String>,
    client: Client,
}

impl API {
    pub fn new(
        token: impl Into<String>,
        home_id: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        Ok(Self {
            url: TIBBER_URL.to_owned(),
            token: token.into(),
            home_id,
            client: reqwest::ClientBuilder::new().timeout(timeout).build()?,
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn query(&self) -> String {
        match &self.home_id {
            Some(id) => format!("{{ viewer {{ home(id: \"{id}\") {{ {PRICE_FIELDS} }} }} }}"),
            None => format!("{{ viewer {{ homes {{ {PRICE_FIELDS} }} }} }}"),
        }
    }

    pub async fn price_info(&self) -> Result<PriceInfo> {
        let response: Response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&json!({"query": self.query()}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(err) = response.errors.first() {
            return Err(Error::Invalid(format!("Tibber: {}", err.message)));
        }
        let viewer = response
            .data
            .ok_or_else(|| Error::Invalid("Tibber response has no data".to_owned()))?
            .viewer;
        viewer
            .home
            .into_iter()
            .chain(viewer.homes)
            .find_map(|home| home.current_subscription)
            .map(|subscription| subscription.price_info)
            .ok_or_else(|| Error::unavailable("Tibber subscription"))
    }
}

impl PriceInfo {
    pub fn prices(&self) -> Vec<(DateTime<Utc>, f64)> {
        self.today
            .iter()
            .chain(self.tomorrow.iter())
            .map(|slot| (slot.starts_at.with_timezone(&Utc), slot.total))
            .collect()
    }
}

struct Cached {
    timeline: PriceTimeline,
    fetched: DateTime<Utc>,
    failed: bool,
}

/// Price source backed by periodic fetches from the cloud API.
///
/// The last good timeline is kept when a fetch fails, and reported as stale.
pub struct HttpPriceSource {
    thresholds: Thresholds,
    max_age: Duration,
    cache: Mutex<Option<Cached>>,
}

impl HttpPriceSource {
    pub fn new(thresholds: Thresholds, max_age: Duration) -> Self {
        Self {
            thresholds,
            max_age,
            cache: Mutex::new(None),
        }
    }

    /// Record the outcome of a fetch made at `now`.
    pub fn update(&self, result: Result<Vec<(DateTime<Utc>, f64)>>, now: DateTime<Utc>) {
        let result = result.and_then(|prices| PriceTimeline::new(prices, &self.thresholds));
        let mut lock = self.cache.lock().unwrap();
        match result {
            Ok(timeline) => {
                info!(
                    "Successfully updated {} prices (until {})",
                    timeline.points().len(),
                    timeline.end()
                );
                *lock = Some(Cached {
                    timeline,
                    fetched: now,
                    failed: false,
                });
            }
            Err(err) => {
                warn!("Failed to update prices: {err}");
                if let Some(cached) = lock.as_mut() {
                    cached.failed = true;
                }
            }
        }
    }

    fn lookup(&self, time: DateTime<Utc>, now: DateTime<Utc>) -> Result<Reading<f64>> {
        let lock = self.cache.lock().unwrap();
        let cached = lock.as_ref().ok_or_else(|| Error::unavailable("prices"))?;
        let point = cached
            .timeline
            .at(time)
            .ok_or_else(|| Error::unavailable(format!("price at {time}")))?;
        Ok(Reading {
            value: point.price,
            stale: cached.failed || now - cached.fetched > self.max_age,
        })
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn current_tier(&self, now: DateTime<Utc>) -> Result<Reading<PriceTier>> {
        let price = self.lookup(now, now)?;
        Ok(price.map(|price| self.thresholds.classify(price)))
    }

    async fn price_at(&self, time: DateTime<Utc>) -> Result<Reading<f64>> {
        self.lookup(time, Utc::now())
    }
}

pub async fn poll_prices(
    api: &API,
    source: &HttpPriceSource,
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
        let result = api.price_info().await.map(|info| info.prices());
        source.update(result, Utc::now());
    }
}
