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

//! Static time-of-use tariff, published to the host as price entities.

use chrono::naive::{NaiveDate, NaiveTime};
use chrono::{DateTime, Duration, Local, TimeZone};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use std::fmt::Display;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{PriceTier, Thresholds};
use crate::entity::{Entity, Value};
use crate::error::Result;
use crate::state::{Attributes, StateAccessor};

/// Local time window with a fixed price.
///
/// A window whose end is not after its start wraps past midnight.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TariffWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub price: f64,
}

impl TariffWindow {
    fn contains(&self, time: NaiveTime) -> bool {
        if self.start < self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TimeOfUseTariff {
    /// Price outside all windows
    pub default_price: f64,
    #[serde(default)]
    pub windows: Vec<TariffWindow>,
    #[serde(default = "slot_default", with = "humantime_serde")]
    pub slot: std::time::Duration,
    #[serde(default = "interval_default", with = "humantime_serde")]
    pub interval: std::time::Duration,
    #[serde(default = "unit_default")]
    pub unit: String,
}

fn slot_default() -> std::time::Duration {
    std::time::Duration::from_secs(1800)
}

fn interval_default() -> std::time::Duration {
    std::time::Duration::from_secs(180)
}

fn unit_default() -> String {
    "EUR/kWh".to_owned()
}

impl TimeOfUseTariff {
    /// Price at a local time of day; the first matching window wins.
    pub fn price(&self, time: NaiveTime) -> f64 {
        self.windows
            .iter()
            .find(|window| window.contains(time))
            .map_or(self.default_price, |window| window.price)
    }

    /// Slot start times and prices covering one local day.
    pub fn day<Tz: TimeZone>(&self, tz: &Tz, date: NaiveDate) -> Vec<(DateTime<Tz>, f64)> {
        let step = Duration::from_std(self.slot)
            .ok()
            .filter(|step| *step > Duration::zero())
            .unwrap_or(Duration::minutes(30));
        let mut slots = Vec::new();
        let mut time = date.and_time(NaiveTime::MIN);
        while time.date() == date {
            // Local times skipped by a DST change have no slot
            if let Some(start) = tz.from_local_datetime(&time).earliest() {
                slots.push((start, self.price(time.time())));
            }
            time += step;
        }
        slots
    }

    /// Write the current price (with today's and tomorrow's slots as
    /// attributes) and the low/high price flags.
    pub async fn publish<Tz>(
        &self,
        accessor: &StateAccessor,
        thresholds: &Thresholds,
        now: &DateTime<Tz>,
    ) -> Result<()>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let tz = now.timezone();
        let today = now.date_naive();
        let slots = |date: NaiveDate| -> Json {
            self.day(&tz, date)
                .into_iter()
                .map(|(start, price)| json!({"startsAt": start.to_rfc3339(), "total": price}))
                .collect()
        };
        let price = self.price(now.time());
        let mut attributes = Attributes::new();
        attributes.insert("unit_of_measurement".to_owned(), json!(self.unit));
        attributes.insert("device_class".to_owned(), json!("monetary"));
        attributes.insert("state_class".to_owned(), json!("measurement"));
        attributes.insert("today".to_owned(), slots(today));
        if let Some(tomorrow) = today.succ_opt() {
            attributes.insert("tomorrow".to_owned(), slots(tomorrow));
        }
        accessor
            .publish(Entity::CurrentPrice, Value::Number(price), attributes)
            .await?;

        let tier = thresholds.classify(price);
        accessor
            .publish(Entity::LowPrice, Value::Bool(tier == PriceTier::Low), Attributes::new())
            .await?;
        accessor
            .publish(Entity::HighPrice, Value::Bool(tier == PriceTier::High), Attributes::new())
            .await?;
        info!("Published tariff price {price} ({tier})");
        Ok(())
    }
}

pub async fn publish_tariff(
    tariff: &TimeOfUseTariff,
    accessor: &StateAccessor,
    thresholds: &Thresholds,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(tariff.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = token.cancelled() => break,
        }
        if let Err(err) = tariff.publish(accessor, thresholds, &Local::now()).await {
            warn!("Failed to publish tariff: {err}");
        }
    }
}
