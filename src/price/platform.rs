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
use chrono::{DateTime, Utc};
use log::warn;
use serde_json::Value as Json;
use std::sync::Arc;

use super::tibber::Slot;
use super::{PriceSource, PriceTier, PriceTimeline, Reading, Thresholds};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::state::StateAccessor;

/// Price source that reads the tier flags and price timeline published on
/// the host by some other integration.
pub struct PlatformPriceSource {
    accessor: Arc<StateAccessor>,
    thresholds: Thresholds,
}

fn parse_slots(attribute: Json) -> Result<Vec<Slot>> {
    match attribute {
        Json::Null => Ok(vec![]),
        other => Ok(serde_json::from_value(other)?),
    }
}

impl PlatformPriceSource {
    pub fn new(accessor: Arc<StateAccessor>, thresholds: Thresholds) -> Self {
        Self {
            accessor,
            thresholds,
        }
    }

    async fn timeline(&self) -> Result<PriceTimeline> {
        let mut slots = parse_slots(self.accessor.attribute(Entity::CurrentPrice, "today").await?)?;
        slots.extend(parse_slots(
            self.accessor.attribute(Entity::CurrentPrice, "tomorrow").await?,
        )?);
        if slots.is_empty() {
            return Err(Error::unavailable("price timeline"));
        }
        let prices = slots
            .into_iter()
            .map(|slot| (slot.starts_at.with_timezone(&Utc), slot.total))
            .collect();
        PriceTimeline::new(prices, &self.thresholds)
    }
}

#[async_trait]
impl PriceSource for PlatformPriceSource {
    async fn current_tier(&self, _now: DateTime<Utc>) -> Result<Reading<PriceTier>> {
        let low = self.accessor.get_bool(Entity::LowPrice).await?;
        let high = self.accessor.get_bool(Entity::HighPrice).await?;
        let tier = match (low, high) {
            (true, true) => {
                warn!("Both low and high price flags are on; treating price as high");
                PriceTier::High
            }
            (_, true) => PriceTier::High,
            (true, false) => PriceTier::Low,
            (false, false) => PriceTier::Normal,
        };
        Ok(Reading::fresh(tier))
    }

    async fn price_at(&self, time: DateTime<Utc>) -> Result<Reading<f64>> {
        let timeline = self.timeline().await?;
        timeline
            .at(time)
            .map(|point| Reading::fresh(point.price))
            .ok_or_else(|| Error::unavailable(format!("price at {time}")))
    }
}
