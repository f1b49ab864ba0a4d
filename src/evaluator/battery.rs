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

use crate::config::BatteryConfig;
use crate::price::PriceTier;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatteryState {
    Idle,
    Charging,
    Discharging,
}

impl BatteryState {
    pub fn charge(self) -> bool {
        self == BatteryState::Charging
    }

    pub fn discharge(self) -> bool {
        self == BatteryState::Discharging
    }
}

impl fmt::Display for BatteryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatteryState::Idle => "idle",
            BatteryState::Charging => "charging",
            BatteryState::Discharging => "discharging",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatteryInputs {
    /// State of charge (%)
    pub soc: f64,
    pub tier: PriceTier,
    /// Forecast PV excess (kWh) over the look-ahead window
    pub solar_excess: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatteryDecision {
    pub state: BatteryState,
    pub reason: String,
}

pub fn evaluate(inputs: &BatteryInputs, config: &BatteryConfig) -> BatteryDecision {
    let BatteryInputs {
        soc,
        tier,
        solar_excess,
    } = *inputs;
    let (state, reason) = if tier == PriceTier::Low && soc < config.target_soc {
        (
            BatteryState::Charging,
            format!("low price and SoC {soc}% below target {}%", config.target_soc),
        )
    } else if soc > config.reserve_soc && tier == PriceTier::High {
        (
            BatteryState::Discharging,
            format!("high price and SoC {soc}% above reserve {}%", config.reserve_soc),
        )
    } else if soc > config.reserve_soc && tier != PriceTier::Low && solar_excess < 0.0 {
        (
            BatteryState::Discharging,
            format!("solar short by {:.2} kWh and SoC {soc}% above reserve", -solar_excess),
        )
    } else {
        (BatteryState::Idle, format!("{tier} price, SoC {soc}%"))
    };
    BatteryDecision { state, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(soc: f64, tier: PriceTier, solar_excess: f64) -> BatteryState {
        let inputs = BatteryInputs {
            soc,
            tier,
            solar_excess,
        };
        evaluate(&inputs, &BatteryConfig::default()).state
    }

    #[test]
    fn low_price_below_target_charges() {
        assert_eq!(run(40.0, PriceTier::Low, 0.0), BatteryState::Charging);
        assert_eq!(run(40.0, PriceTier::Low, -5.0), BatteryState::Charging);
    }

    #[test]
    fn low_price_at_target_idles() {
        assert_eq!(run(80.0, PriceTier::Low, 0.0), BatteryState::Idle);
        assert_eq!(run(95.0, PriceTier::Low, -5.0), BatteryState::Idle);
    }

    #[test]
    fn high_price_above_reserve_discharges() {
        assert_eq!(run(90.0, PriceTier::High, 10.0), BatteryState::Discharging);
        assert_eq!(run(20.0, PriceTier::High, 10.0), BatteryState::Idle);
    }

    #[test]
    fn normal_price_follows_solar() {
        assert_eq!(run(50.0, PriceTier::Normal, 2.0), BatteryState::Idle);
        assert_eq!(run(50.0, PriceTier::Normal, 0.0), BatteryState::Idle);
        assert_eq!(run(50.0, PriceTier::Normal, -0.1), BatteryState::Discharging);
        assert_eq!(run(15.0, PriceTier::Normal, -0.1), BatteryState::Idle);
    }

    #[test]
    fn never_charges_and_discharges() {
        for tier in [PriceTier::Low, PriceTier::Normal, PriceTier::High] {
            for soc in (0..=100).step_by(5) {
                for excess in [-10.0, -0.5, 0.0, 0.5, 10.0] {
                    let state = run(f64::from(soc), tier, excess);
                    assert!(!(state.charge() && state.discharge()));
                }
            }
        }
    }
}
