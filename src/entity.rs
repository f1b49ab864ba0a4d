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

//! Mapping from logical names to Home Assistant entities
//!
//! Every entity the controller touches is listed in [`Entity`] together
//! with the type of value it holds and whether the controller writes it.
//! The catalog is built once from the defaults below plus the overrides in
//! the `[entities]` section of the configuration file.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueType {
    Bool,
    Number,
    Text,
}

/// Host scalar value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret a raw host state string according to `value_type`.
    ///
    /// Returns None if the string does not fit the type.
    pub fn parse(raw: &str, value_type: ValueType) -> Option<Self> {
        match value_type {
            ValueType::Bool => match raw.to_ascii_lowercase().as_str() {
                "on" | "true" => Some(Value::Bool(true)),
                "off" | "false" => Some(Value::Bool(false)),
                _ => None,
            },
            ValueType::Number => raw.trim().parse().ok().map(Value::Number),
            ValueType::Text => Some(Value::Text(raw.to_owned())),
        }
    }

    /// Format the value the way the host stores states.
    pub fn to_state_string(&self) -> String {
        match self {
            Value::Bool(true) => "on".to_owned(),
            Value::Bool(false) => "off".to_owned(),
            Value::Number(x) => x.to_string(),
            Value::Text(s) => s.clone(),
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Number(_) => ValueType::Number,
            Value::Text(_) => ValueType::Text,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_state_string())
    }
}

/// Home Assistant domain of an entity
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntityKind {
    Sensor,
    BinarySensor,
    Switch,
    InputBoolean,
    Number,
    InputNumber,
    Select,
    InputSelect,
    Schedule,
}

impl EntityKind {
    pub fn from_domain(domain: &str) -> Option<Self> {
        Some(match domain {
            "sensor" => Self::Sensor,
            "binary_sensor" => Self::BinarySensor,
            "switch" => Self::Switch,
            "input_boolean" => Self::InputBoolean,
            "number" => Self::Number,
            "input_number" => Self::InputNumber,
            "select" => Self::Select,
            "input_select" => Self::InputSelect,
            "schedule" => Self::Schedule,
            _ => return None,
        })
    }

    /// Whether the host accepts external writes for this kind.
    ///
    /// Sensors are included because their state can be published through
    /// the REST API.
    pub fn writable(self) -> bool {
        self != Self::Schedule
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        match id.split_once('.') {
            Some((domain, name)) if !name.is_empty() => {
                if EntityKind::from_domain(domain).is_none() {
                    return Err(Error::Config(format!(
                        "entity {id} has unsupported domain {domain}"
                    )));
                }
                Ok(Self(id))
            }
            _ => Err(Error::Config(format!("{id:?} is not a valid entity ID"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        self.0.split_once('.').map_or("", |(domain, _)| domain)
    }

    pub fn kind(&self) -> EntityKind {
        // new() rejects unknown domains
        EntityKind::from_domain(self.domain()).unwrap_or(EntityKind::Sensor)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Entity {
    // Home battery
    BatterySoc,
    BatteryTargetSoc,
    BatteryReserveSoc,
    PvMeetsDemand,
    // Price (platform adapter, tariff publisher)
    CurrentPrice,
    LowPrice,
    HighPrice,
    // Electric vehicle and charger
    EvSoc,
    EvRequiredSoc,
    PlannedDrives,
    ExcessPower,
    AutoEvCharging,
    AutoChargeLimit,
    EvForceCharge,
    SmartChargeLimit,
    ChargerSwitch,
    ChargerCurrent,
    ChargerPhases,
    // Victron inverter
    InverterMode,
    ForceChargeSwitch,
    DischargeLimit,
    // Generic inverter
    ChargeEnable,
    DischargeEnable,
}

impl Entity {
    pub const ALL: [Entity; 23] = [
        Entity::BatterySoc,
        Entity::BatteryTargetSoc,
        Entity::BatteryReserveSoc,
        Entity::PvMeetsDemand,
        Entity::CurrentPrice,
        Entity::LowPrice,
        Entity::HighPrice,
        Entity::EvSoc,
        Entity::EvRequiredSoc,
        Entity::PlannedDrives,
        Entity::ExcessPower,
        Entity::AutoEvCharging,
        Entity::AutoChargeLimit,
        Entity::EvForceCharge,
        Entity::SmartChargeLimit,
        Entity::ChargerSwitch,
        Entity::ChargerCurrent,
        Entity::ChargerPhases,
        Entity::InverterMode,
        Entity::ForceChargeSwitch,
        Entity::DischargeLimit,
        Entity::ChargeEnable,
        Entity::DischargeEnable,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Entity::BatterySoc => "battery_soc",
            Entity::BatteryTargetSoc => "battery_target_soc",
            Entity::BatteryReserveSoc => "battery_reserve_soc",
            Entity::PvMeetsDemand => "pv_meets_demand",
            Entity::CurrentPrice => "current_price",
            Entity::LowPrice => "low_price",
            Entity::HighPrice => "high_price",
            Entity::EvSoc => "ev_soc",
            Entity::EvRequiredSoc => "ev_required_soc",
            Entity::PlannedDrives => "planned_drives",
            Entity::ExcessPower => "excess_power",
            Entity::AutoEvCharging => "auto_ev_charging",
            Entity::AutoChargeLimit => "auto_charge_limit",
            Entity::EvForceCharge => "ev_force_charge",
            Entity::SmartChargeLimit => "smart_charge_limit",
            Entity::ChargerSwitch => "charger_switch",
            Entity::ChargerCurrent => "charger_current",
            Entity::ChargerPhases => "charger_phases",
            Entity::InverterMode => "inverter_mode",
            Entity::ForceChargeSwitch => "force_charge_switch",
            Entity::DischargeLimit => "discharge_limit",
            Entity::ChargeEnable => "charge_enable",
            Entity::DischargeEnable => "discharge_enable",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|entity| entity.name() == name)
    }

    pub fn value_type(self) -> ValueType {
        match self {
            Entity::LowPrice
            | Entity::HighPrice
            | Entity::PlannedDrives
            | Entity::AutoEvCharging
            | Entity::AutoChargeLimit
            | Entity::EvForceCharge
            | Entity::ChargerSwitch
            | Entity::ForceChargeSwitch
            | Entity::ChargeEnable
            | Entity::DischargeEnable => ValueType::Bool,
            Entity::InverterMode | Entity::PvMeetsDemand => ValueType::Text,
            _ => ValueType::Number,
        }
    }

    /// Whether the controller writes this entity.
    pub fn written(self) -> bool {
        matches!(
            self,
            Entity::BatteryTargetSoc
                | Entity::BatteryReserveSoc
                | Entity::PvMeetsDemand
                | Entity::CurrentPrice
                | Entity::LowPrice
                | Entity::HighPrice
                | Entity::SmartChargeLimit
                | Entity::ChargerSwitch
                | Entity::ChargerCurrent
                | Entity::ChargerPhases
                | Entity::InverterMode
                | Entity::ForceChargeSwitch
                | Entity::DischargeLimit
                | Entity::ChargeEnable
                | Entity::DischargeEnable
        )
    }

    /// Entity ID used when the configuration does not override it.
    pub fn default_id(self) -> &'static str {
        match self {
            Entity::BatterySoc => "sensor.battery_soc",
            Entity::BatteryTargetSoc => "sensor.battery_target_soc",
            Entity::BatteryReserveSoc => "sensor.battery_reserve_soc",
            Entity::PvMeetsDemand => "sensor.pv_meets_demand",
            Entity::CurrentPrice => "sensor.electricity_price",
            Entity::LowPrice => "binary_sensor.low_electricity_price",
            Entity::HighPrice => "binary_sensor.high_electricity_price",
            Entity::EvSoc => "sensor.ev_battery_level",
            Entity::EvRequiredSoc => "input_number.ev_required_soc",
            Entity::PlannedDrives => "schedule.ev_planned_drives",
            Entity::ExcessPower => "sensor.excess_power",
            Entity::AutoEvCharging => "input_boolean.auto_ev_charging",
            Entity::AutoChargeLimit => "input_boolean.auto_charge_limit",
            Entity::EvForceCharge => "input_boolean.ev_force_charge",
            Entity::SmartChargeLimit => "sensor.ev_smart_charge_limit",
            Entity::ChargerSwitch => "switch.charger_charge_control",
            Entity::ChargerCurrent => "number.charger_maximum_current",
            Entity::ChargerPhases => "number.charger_phases",
            Entity::InverterMode => "input_select.victron_inverter_mode",
            Entity::ForceChargeSwitch => "switch.victron_force_charge",
            Entity::DischargeLimit => "input_number.victron_discharge_power_limit",
            Entity::ChargeEnable => "input_boolean.battery_charge_enable",
            Entity::DischargeEnable => "input_boolean.battery_discharge_enable",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct EntityCatalog {
    ids: HashMap<Entity, EntityId>,
}

impl EntityCatalog {
    /// Build the catalog from the defaults and configured overrides.
    ///
    /// Overrides are keyed by [`Entity::name`]. An override with an empty
    /// string unmaps the entity.
    pub fn new(overrides: &HashMap<String, String>) -> Result<Self> {
        if let Some(name) = overrides.keys().find(|name| Entity::from_name(name).is_none()) {
            return Err(Error::Config(format!("unknown entity name {name}")));
        }
        let mut ids = HashMap::new();
        for entity in Entity::ALL {
            let id = overrides
                .get(entity.name())
                .map(String::as_str)
                .unwrap_or(entity.default_id());
            if id.is_empty() {
                continue;
            }
            let id = EntityId::new(id)?;
            if entity.written() && !id.kind().writable() {
                return Err(Error::Config(format!(
                    "{entity} is written but {id} is read-only"
                )));
            }
            ids.insert(entity, id);
        }
        Ok(Self { ids })
    }

    pub fn id(&self, entity: Entity) -> Result<&EntityId> {
        self.ids
            .get(&entity)
            .ok_or_else(|| Error::lookup(entity.name(), "not mapped to an entity"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Entity, &EntityId)> {
        Entity::ALL
            .into_iter()
            .filter_map(|entity| self.ids.get(&entity).map(|id| (entity, id)))
    }

    /// Check that `value` has the type declared for `entity`.
    pub fn check_value(&self, entity: Entity, value: &Value) -> Result<()> {
        if value.value_type() == entity.value_type() {
            Ok(())
        } else {
            Err(Error::write(
                entity.name(),
                format!("expected {:?} value, got {value:?}", entity.value_type()),
            ))
        }
    }
}

impl Default for EntityCatalog {
    fn default() -> Self {
        Self {
            ids: Entity::ALL
                .into_iter()
                .map(|entity| (entity, EntityId(entity.default_id().to_owned())))
                .collect(),
        }
    }
}
