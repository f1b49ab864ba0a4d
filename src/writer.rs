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
use log::{info, warn};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::{EvConfig, InverterConfig, InverterProduct};
use crate::entity::{Entity, Value};
use crate::error::Result;
use crate::evaluator::battery::BatteryState;
use crate::evaluator::ev::{current_for_power, ChargerSetpoint};
use crate::evaluator::inverter_mode::InverterMode;
use crate::state::StateAccessor;

/// Write each value that differs from the host's, continuing past failures.
///
/// Returns the first error. Writes that succeeded are not undone.
async fn write_all(accessor: &StateAccessor, writes: Vec<(Entity, Value)>) -> Result<()> {
    let mut first_err = None;
    for (entity, value) in writes {
        match accessor.set_if_changed(entity, value.clone()).await {
            Ok(true) => info!("Set {entity} to {value}"),
            Ok(false) => {}
            Err(err) => {
                warn!("Failed to set {entity} to {value}: {err}");
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Translates battery decisions into the entities of a particular inverter.
#[async_trait]
pub trait SetpointWriter: Send + Sync {
    async fn apply(
        &self,
        accessor: &StateAccessor,
        battery: BatteryState,
        mode: InverterMode,
    ) -> Result<()>;
}

fn mode_option(config: &InverterConfig, mode: InverterMode) -> Value {
    Value::Text(match mode {
        InverterMode::Standby => config.standby_option.clone(),
        InverterMode::Active => config.active_option.clone(),
    })
}

/// Victron ESS: a mode select, a force-charge switch and a discharge power
/// limit.
pub struct VictronWriter {
    config: InverterConfig,
}

impl VictronWriter {
    pub fn new(config: InverterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SetpointWriter for VictronWriter {
    async fn apply(
        &self,
        accessor: &StateAccessor,
        battery: BatteryState,
        mode: InverterMode,
    ) -> Result<()> {
        let limit = if battery.discharge() {
            self.config.discharge_limit
        } else {
            0.0
        };
        write_all(
            accessor,
            vec![
                (Entity::ForceChargeSwitch, Value::Bool(battery.charge())),
                (Entity::DischargeLimit, Value::Number(limit)),
                (Entity::InverterMode, mode_option(&self.config, mode)),
            ],
        )
        .await
    }
}

/// Inverters controlled through plain charge/discharge enable helpers.
pub struct GenericWriter {
    config: InverterConfig,
}

impl GenericWriter {
    pub fn new(config: InverterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SetpointWriter for GenericWriter {
    async fn apply(
        &self,
        accessor: &StateAccessor,
        battery: BatteryState,
        mode: InverterMode,
    ) -> Result<()> {
        write_all(
            accessor,
            vec![
                (Entity::ChargeEnable, Value::Bool(battery.charge())),
                (Entity::DischargeEnable, Value::Bool(battery.discharge())),
                (Entity::InverterMode, mode_option(&self.config, mode)),
            ],
        )
        .await
    }
}

pub fn new_setpoint_writer(config: &InverterConfig) -> Box<dyn SetpointWriter> {
    match config.product {
        InverterProduct::Victron => Box::new(VictronWriter::new(config.clone())),
        InverterProduct::Generic => Box::new(GenericWriter::new(config.clone())),
    }
}

/// EV charger: enable switch, current and number of phases.
///
/// Phase changes are rate-limited, and are made with the charger switched
/// off.
pub struct ChargerWriter {
    config: EvConfig,
    last_phase_change: Mutex<Option<Instant>>,
}

impl ChargerWriter {
    pub fn new(config: EvConfig) -> Self {
        Self {
            config,
            last_phase_change: Mutex::new(None),
        }
    }

    fn phase_change_allowed(&self) -> bool {
        match *self.last_phase_change.lock().unwrap() {
            Some(last) => last.elapsed() >= self.config.phase_cooldown,
            None => true,
        }
    }

    /// Apply `setpoint`, given the charger's current state.
    ///
    /// Returns the setpoint that was actually requested from the charger,
    /// which differs from `setpoint` if a phase change was held back.
    pub async fn apply(
        &self,
        accessor: &StateAccessor,
        setpoint: &ChargerSetpoint,
        current: &ChargerSetpoint,
    ) -> Result<ChargerSetpoint> {
        if !setpoint.enabled {
            if accessor
                .set_if_changed(Entity::ChargerSwitch, Value::Bool(false))
                .await?
            {
                info!("Switched EV charger off");
            }
            return Ok(ChargerSetpoint {
                enabled: false,
                ..*current
            });
        }

        let mut applied = *setpoint;
        if setpoint.phases != current.phases {
            if self.phase_change_allowed() {
                if current.enabled {
                    accessor.set(Entity::ChargerSwitch, Value::Bool(false)).await?;
                    tokio::time::sleep(self.config.phase_switch_delay).await;
                }
                accessor
                    .set(Entity::ChargerPhases, Value::Number(f64::from(setpoint.phases)))
                    .await?;
                *self.last_phase_change.lock().unwrap() = Some(Instant::now());
                info!("Switched EV charger to {} phase(s)", setpoint.phases);
            } else {
                // Keep the requested power on the phases we stay on
                applied.phases = current.phases;
                applied.current = current_for_power(
                    setpoint.power(&self.config),
                    applied.phases,
                    &self.config,
                );
                info!(
                    "Not switching EV charger to {} phase(s) yet (cooldown); using {} A",
                    setpoint.phases, applied.current
                );
            }
        }

        if (self.config.min_current..=self.config.max_current).contains(&applied.current) {
            accessor
                .set_if_changed(Entity::ChargerCurrent, Value::Number(applied.current))
                .await?;
        } else {
            warn!(
                "Requested EV charger current {} A is outside {}-{} A; not changing it",
                applied.current, self.config.min_current, self.config.max_current
            );
            applied.current = current.current;
        }

        accessor
            .set_if_changed(Entity::ChargerSwitch, Value::Bool(true))
            .await?;
        Ok(applied)
    }
}
