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

//! Electric vehicle charging
//!
//! Rules, in order of precedence:
//! 1. Stop once the required state of charge (capped by the smart charge
//!    limit, if enabled) is reached.
//! 2. If the next drive is close and charging at full power is the only way
//!    to be ready in time, charge at full power regardless of price.
//! 3. Charge at full power while the price is low.
//! 4. Charge from PV surplus, following the excess with the current and
//!    switching between one and three phases with hysteresis.
//! 5. While charging from PV with too little excess, reduce the current,
//!    then drop to one phase, then stop.
//! 6. Otherwise stay off.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::config::EvConfig;
use crate::price::PriceTier;

/// Extra margin (W) around the minimum three-phase power before switching
/// phases.
pub const PHASE_HYSTERESIS: f64 = 500.0;
/// Extra excess (W) required before starting to charge from PV.
pub const START_MARGIN: f64 = 1000.0;
/// Largest current change (A) in one evaluation while following PV.
pub const MAX_STEP: f64 = 4.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChargerSetpoint {
    pub enabled: bool,
    /// Current per phase (A)
    pub current: f64,
    pub phases: u32,
}

impl ChargerSetpoint {
    pub fn off(config: &EvConfig) -> Self {
        Self {
            enabled: false,
            current: config.min_current,
            phases: 1,
        }
    }

    fn on(phases: u32, current: f64) -> Self {
        Self {
            enabled: true,
            current,
            phases,
        }
    }

    /// Power drawn (W), or zero if disabled
    pub fn power(&self, config: &EvConfig) -> f64 {
        if self.enabled {
            f64::from(self.phases) * self.current * config.voltage
        } else {
            0.0
        }
    }
}

impl fmt::Display for ChargerSetpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.enabled {
            write!(f, "on, {} A x {} phase(s)", self.current, self.phases)
        } else {
            f.write_str("off")
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvInputs {
    pub now: DateTime<Utc>,
    /// State of charge (%)
    pub soc: f64,
    /// Required state of charge (%) for the next drive
    pub required_soc: f64,
    pub tier: PriceTier,
    pub next_drive: Option<DateTime<Utc>>,
    pub drive_ongoing: bool,
    pub smart_limit_enabled: bool,
    /// Power (W) currently exported to the grid, if known
    pub excess_power: Option<f64>,
    /// Export (W) to leave over when charging from PV
    pub excess_target: f64,
    /// What the charger is doing now
    pub charger: ChargerSetpoint,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvDecision {
    pub setpoint: ChargerSetpoint,
    pub smart_limit: f64,
    pub reason: String,
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

/// Charge limit (%) that keeps the battery below full when the next drive
/// is far away.
pub fn smart_charge_limit(
    now: DateTime<Utc>,
    next_drive: Option<DateTime<Utc>>,
    drive_ongoing: bool,
) -> f64 {
    if drive_ongoing {
        return 100.0;
    }
    let Some(start) = next_drive else {
        return 85.0;
    };
    let hours = hours_between(now, start).floor();
    if hours < 6.0 {
        100.0
    } else if hours < 20.0 {
        98.0
    } else if hours < 40.0 {
        95.0
    } else if hours < 60.0 {
        90.0
    } else {
        85.0
    }
}

/// Energy (kWh) needed to reach `required_soc`
pub fn energy_needed(required_soc: f64, soc: f64, config: &EvConfig) -> f64 {
    ((required_soc - soc) / 100.0 * config.capacity).max(0.0)
}

fn clamp_current(current: f64, config: &EvConfig) -> f64 {
    current.max(config.min_current).min(config.max_current)
}

/// Change in current (A) that moves the excess towards `target`, limited to
/// [`MAX_STEP`] and to the charger's range.
pub fn current_adjustment(
    excess: f64,
    target: f64,
    phases: u32,
    current: f64,
    config: &EvConfig,
) -> f64 {
    let watts_per_amp = config.voltage * f64::from(phases.max(1));
    let raw = ((excess - target) / watts_per_amp).round();
    let lower = (-MAX_STEP).max(config.min_current - current);
    let upper = MAX_STEP.min(config.max_current - current);
    raw.max(lower).min(upper)
}

/// Whole-amp current per phase that draws at most `power` (W) on `phases`,
/// within the charger's range.
pub fn current_for_power(power: f64, phases: u32, config: &EvConfig) -> f64 {
    clamp_current(
        (power / (f64::from(phases.max(1)) * config.voltage)).floor(),
        config,
    )
}

/// Phases and current for charging at `power` (W) from PV.
fn surplus_setpoint(power: f64, inputs: &EvInputs, config: &EvConfig) -> ChargerSetpoint {
    let charger = &inputs.charger;
    let min_three_phase = 3.0 * config.voltage * config.min_current;
    let threshold = if charger.enabled && charger.phases == 3 {
        min_three_phase - PHASE_HYSTERESIS
    } else {
        min_three_phase + PHASE_HYSTERESIS
    };
    let phases = if power >= threshold { 3 } else { 1 };
    ChargerSetpoint::on(phases, current_for_power(power, phases, config))
}

pub fn evaluate(inputs: &EvInputs, config: &EvConfig) -> EvDecision {
    let smart_limit = smart_charge_limit(inputs.now, inputs.next_drive, inputs.drive_ongoing);
    let decide = |setpoint: ChargerSetpoint, reason: String| EvDecision {
        setpoint: ChargerSetpoint {
            current: clamp_current(setpoint.current, config),
            ..setpoint
        },
        smart_limit,
        reason,
    };
    let off = ChargerSetpoint::off(config);
    let full = ChargerSetpoint::on(3, config.max_current);
    let soc = inputs.soc;
    let charger = inputs.charger;

    let required = if inputs.smart_limit_enabled {
        inputs.required_soc.min(smart_limit)
    } else {
        inputs.required_soc
    };
    let energy = energy_needed(required, soc, config);
    if energy <= 0.0 {
        return decide(off, format!("required SoC {required}% reached ({soc}%)"));
    }

    if let Some(start) = inputs.next_drive {
        let hours_left = hours_between(inputs.now, start);
        let full_power = 3.0 * config.voltage * (config.max_current - 1.0) / 1000.0;
        let hours_needed = energy / full_power;
        if (hours_left < 2.0 || hours_left < hours_needed) && soc < required - 1.0 {
            return decide(
                full,
                format!(
                    "drive in {hours_left:.1} h needs {hours_needed:.1} h of charging ({soc}% < {required}%)"
                ),
            );
        }
    }

    if inputs.tier == PriceTier::Low {
        return decide(full, "low electricity price".to_owned());
    }

    if let Some(excess) = inputs.excess_power {
        let target = if charger.enabled {
            inputs.excess_target
        } else {
            inputs.excess_target + START_MARGIN
        };
        if excess > target {
            let power = charger.power(config) + excess - target;
            let mut setpoint = surplus_setpoint(power, inputs, config);
            if charger.enabled && setpoint.phases == charger.phases {
                setpoint.current = charger.current
                    + current_adjustment(excess, target, charger.phases, charger.current, config);
            }
            return decide(
                setpoint,
                format!("PV excess {excess:.0} W above target {target:.0} W"),
            );
        }
        if charger.enabled && excess == target {
            return decide(charger, format!("PV excess {excess:.0} W at target"));
        }
        if charger.enabled && excess < target {
            let deficit = target - excess;
            if charger.current <= config.min_current {
                if charger.phases > 1 {
                    let power = charger.power(config) - deficit;
                    return decide(
                        ChargerSetpoint::on(1, current_for_power(power, 1, config)),
                        format!("reducing to one phase for deficit of {deficit:.0} W"),
                    );
                }
                return decide(
                    off,
                    format!("excess {excess:.0} W below target and current already at minimum"),
                );
            }
            let adjustment =
                current_adjustment(excess, target, charger.phases, charger.current, config);
            return decide(
                ChargerSetpoint::on(charger.phases, charger.current + adjustment),
                format!("reducing current for deficit of {deficit:.0} W"),
            );
        }
    }

    decide(off, format!("{} price and no PV excess", inputs.tier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0).unwrap()
    }

    fn inputs() -> EvInputs {
        EvInputs {
            now: now(),
            soc: 50.0,
            required_soc: 80.0,
            tier: PriceTier::Normal,
            next_drive: None,
            drive_ongoing: false,
            smart_limit_enabled: false,
            excess_power: None,
            excess_target: EvConfig::default().excess_target,
            charger: ChargerSetpoint::off(&EvConfig::default()),
        }
    }

    fn run(inputs: &EvInputs) -> ChargerSetpoint {
        evaluate(inputs, &EvConfig::default()).setpoint
    }

    fn charging(phases: u32, current: f64) -> ChargerSetpoint {
        ChargerSetpoint {
            enabled: true,
            current,
            phases,
        }
    }

    #[test]
    fn smart_limit_steps() {
        let at = |hours: i64| smart_charge_limit(now(), Some(now() + Duration::hours(hours)), false);
        assert_eq!(at(5), 100.0);
        assert_eq!(at(6), 98.0);
        assert_eq!(at(19), 98.0);
        assert_eq!(at(20), 95.0);
        assert_eq!(at(45), 90.0);
        assert_eq!(at(60), 85.0);
        assert_eq!(smart_charge_limit(now(), None, false), 85.0);
        assert_eq!(smart_charge_limit(now(), None, true), 100.0);
    }

    #[test]
    fn required_soc_reached() {
        let mut inputs = inputs();
        inputs.soc = 80.0;
        inputs.tier = PriceTier::Low;
        assert!(!run(&inputs).enabled);
    }

    #[test]
    fn smart_limit_caps_required_soc() {
        let mut inputs = inputs();
        inputs.soc = 86.0;
        inputs.required_soc = 100.0;
        inputs.tier = PriceTier::Low;
        assert!(run(&inputs).enabled);
        inputs.smart_limit_enabled = true;
        let decision = evaluate(&inputs, &EvConfig::default());
        assert_eq!(decision.smart_limit, 85.0);
        assert!(!decision.setpoint.enabled);
    }

    #[test]
    fn deadline_overrides_price() {
        let mut inputs = inputs();
        inputs.tier = PriceTier::High;
        inputs.next_drive = Some(now() + Duration::minutes(90));
        assert_eq!(run(&inputs), charging(3, 16.0));

        // 18 kWh at ~10.35 kW needs about 1.7 h
        inputs.soc = 50.0;
        inputs.next_drive = Some(now() + Duration::minutes(150));
        assert!(!run(&inputs).enabled);
        inputs.soc = 20.0;
        assert_eq!(run(&inputs), charging(3, 16.0));
    }

    #[test]
    fn low_price_without_drive() {
        let mut inputs = inputs();
        assert!(!run(&inputs).enabled);
        inputs.tier = PriceTier::Low;
        assert_eq!(run(&inputs), charging(3, 16.0));
        inputs.tier = PriceTier::High;
        assert!(!run(&inputs).enabled);
    }

    #[test]
    fn start_from_surplus() {
        let mut inputs = inputs();
        // Not enough above target plus start margin
        inputs.excess_power = Some(1200.0);
        assert!(!run(&inputs).enabled);
        // 3500 W available: one phase
        inputs.excess_power = Some(5000.0);
        assert_eq!(run(&inputs), charging(1, 15.0));
        // 6500 W available: three phases
        inputs.excess_power = Some(8000.0);
        assert_eq!(run(&inputs), charging(3, 9.0));
    }

    #[test]
    fn follow_surplus() {
        let mut inputs = inputs();
        inputs.charger = charging(3, 10.0);
        inputs.excess_power = Some(1190.0);
        assert_eq!(run(&inputs), charging(3, 11.0));
        // Large excess is followed in limited steps
        inputs.excess_power = Some(20000.0);
        assert_eq!(run(&inputs), charging(3, 14.0));
    }

    #[test]
    fn phase_hysteresis() {
        let mut inputs = inputs();
        // 3 x 6 A = 4140 W; a little excess keeps three phases
        inputs.charger = charging(3, 6.0);
        inputs.excess_power = Some(600.0);
        assert_eq!(run(&inputs).phases, 3);
        // On one phase the same total power does not switch up
        inputs.charger = charging(1, 16.0);
        inputs.excess_power = Some(1000.0);
        assert_eq!(run(&inputs), charging(1, 16.0));
    }

    #[test]
    fn excess_at_target_holds() {
        let mut inputs = inputs();
        inputs.charger = charging(3, 10.0);
        inputs.excess_power = Some(500.0);
        assert_eq!(run(&inputs), charging(3, 10.0));
        inputs.charger = charging(1, 6.0);
        assert_eq!(run(&inputs), charging(1, 6.0));
    }

    #[test]
    fn negative_excess_target_draws_beyond_export() {
        let mut inputs = inputs();
        inputs.excess_target = -1000.0;
        inputs.charger = charging(1, 10.0);
        inputs.excess_power = Some(0.0);
        assert_eq!(run(&inputs), charging(1, 14.0));
        // Starting still needs the margin on top of the target
        inputs.charger = ChargerSetpoint::off(&EvConfig::default());
        inputs.excess_power = Some(-500.0);
        assert!(!run(&inputs).enabled);
    }

    #[test]
    fn current_for_power_stays_in_range() {
        let config = EvConfig::default();
        assert_eq!(current_for_power(3450.0, 1, &config), 15.0);
        assert_eq!(current_for_power(3450.0, 3, &config), 6.0);
        assert_eq!(current_for_power(20000.0, 3, &config), 16.0);
    }

    #[test]
    fn reduce_on_deficit() {
        let mut inputs = inputs();
        inputs.charger = charging(3, 10.0);
        inputs.excess_power = Some(-1000.0);
        assert_eq!(run(&inputs), charging(3, 8.0));

        inputs.charger = charging(3, 6.0);
        inputs.excess_power = Some(0.0);
        assert_eq!(run(&inputs), charging(1, 15.0));

        inputs.charger = charging(1, 6.0);
        assert!(!run(&inputs).enabled);
    }
}
