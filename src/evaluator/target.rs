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

//! Dynamic battery targets
//!
//! The grid-charge target covers the household demand until PV production
//! is expected to take over. The discharge reserve follows the season: it
//! peaks around New Year and bottoms out in midsummer.

use chrono::{Datelike, NaiveDate};
use std::f64::consts::{FRAC_PI_2, TAU};

use crate::config::{DynamicTargetConfig, EvConfig};

/// Smallest energy (kWh) the grid-charge target provides for
pub const MIN_ENERGY: f64 = 3.0;
/// PV power (W) above which a charging EV may claim a share of production
pub const PV_SHARE_THRESHOLD: f64 = 2000.0;
/// PV power (W) left to the house once the EV has its required charge
pub const HOUSE_ALLOWANCE: f64 = 4000.0;

/// Discharge reserve (%) for `date`.
pub fn seasonal_reserve(date: NaiveDate, config: &DynamicTargetConfig) -> f64 {
    let months = f64::from(date.month0()) + f64::from(date.day()) / 30.0;
    let deviation = ((6.0 - months) / 6.0).powi(2);
    (deviation * config.max_reserve)
        .round()
        .clamp(config.min_reserve, config.max_reserve)
}

#[derive(Clone, Debug, PartialEq)]
pub struct TargetInputs {
    pub date: NaiveDate,
    /// State of charge (%) of the home battery
    pub soc: f64,
    /// Household demand minus PV production (kWh) until PV is expected to
    /// cover the demand, or None if that does not happen within the forecast
    pub energy_gap: Option<f64>,
    pub ev_charging: bool,
    /// Forecast PV excess (kWh) over the look-ahead window
    pub solar_excess: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatteryTargets {
    pub target_soc: f64,
    pub reserve_soc: f64,
}

pub fn evaluate(inputs: &TargetInputs, config: &DynamicTargetConfig) -> BatteryTargets {
    let reserve = seasonal_reserve(inputs.date, config);
    let required = inputs
        .energy_gap
        .unwrap_or(config.capacity)
        .max(MIN_ENERGY);
    let target_soc = (required / config.capacity * 100.0 + reserve).min(config.max_target);
    // An EV charging without PV to spare would otherwise drain the battery
    let reserve_soc = if inputs.ev_charging && inputs.solar_excess < 1.0 {
        reserve.max(inputs.soc)
    } else {
        reserve
    };
    BatteryTargets {
        target_soc,
        reserve_soc,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExcessInputs {
    /// State of charge (%) of the home battery
    pub home_soc: f64,
    pub home_target: f64,
    /// Forecast PV power (W) right now
    pub pv_power: Option<f64>,
    pub ev_charging: bool,
    pub drive_within_day: bool,
    /// The EV already holds its required charge
    pub ev_satisfied: bool,
}

/// Grid export (W) to leave over when charging the EV from PV.
///
/// Positive while the home battery is below its target, so that it gets
/// the PV power first; negative above it, so that the EV may draw on the
/// battery. With plenty of PV and no drive coming up, the EV still leaves
/// a share of production to the house.
pub fn ev_excess_target(inputs: &ExcessInputs, config: &EvConfig) -> f64 {
    let angle = ((inputs.home_target - inputs.home_soc) / 100.0 * TAU).clamp(-FRAC_PI_2, FRAC_PI_2);
    let target = angle.sin() * config.max_excess_target;
    match inputs.pv_power {
        Some(pv) if pv > PV_SHARE_THRESHOLD && inputs.ev_charging && !inputs.drive_within_day => {
            let share = if inputs.ev_satisfied {
                pv - HOUSE_ALLOWANCE
            } else {
                pv / 3.0
            };
            target.max(share)
        }
        _ => target,
    }
}
