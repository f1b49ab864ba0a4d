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

use std::fmt;

use super::battery::{self, BatteryInputs, BatteryState};
use crate::config::BatteryConfig;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InverterMode {
    Standby,
    Active,
}

impl fmt::Display for InverterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InverterMode::Standby => "standby",
            InverterMode::Active => "active",
        })
    }
}

pub fn from_battery(state: BatteryState) -> InverterMode {
    match state {
        BatteryState::Idle => InverterMode::Standby,
        BatteryState::Charging | BatteryState::Discharging => InverterMode::Active,
    }
}

/// Standby unless the battery needs to charge or discharge.
pub fn evaluate(inputs: &BatteryInputs, config: &BatteryConfig) -> InverterMode {
    from_battery(battery::evaluate(inputs, config).state)
}
