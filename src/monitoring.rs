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
use std::error::Error;

#[derive(Clone, PartialEq, Debug)]
pub struct BatteryUpdate {
    pub time: DateTime<Utc>,
    pub soc: f64,
    pub price_tier: String,
    pub price_stale: bool,
    pub solar_excess: f64, // kWh over the look-ahead window
    pub target_soc: f64,
    pub reserve_soc: f64,
    pub charge: bool,
    pub discharge: bool,
    pub active: bool,
}

#[derive(Clone, PartialEq, Debug)]
pub struct EvUpdate {
    pub time: DateTime<Utc>,
    pub soc: f64,
    pub required_soc: f64,
    pub smart_limit: f64,
    pub excess_power: Option<f64>, // W
    pub excess_target: f64, // W
    pub enabled: bool,
    pub current: f64,
    pub phases: u32,
    pub next_drive: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Monitor: Send + Sync {
    async fn battery_update(&mut self, update: BatteryUpdate) -> Result<(), Box<dyn Error>>;
    async fn ev_update(&mut self, update: EvUpdate) -> Result<(), Box<dyn Error>>;
}

pub struct NullMonitor;

#[async_trait]
impl Monitor for NullMonitor {
    async fn battery_update(&mut self, _: BatteryUpdate) -> Result<(), Box<dyn Error>> {
        Ok(())
    }

    async fn ev_update(&mut self, _: EvUpdate) -> Result<(), Box<dyn Error>> {
        Ok(())
    }
}
