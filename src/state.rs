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
use chrono::{DateTime, Local, Utc};
use log::{info, warn};
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::entity::{Entity, EntityCatalog, EntityId, Value};
use crate::error::{Error, Result};
use crate::schedule::{PlannedDrive, WeeklySchedule};

pub type Attributes = Map<String, Json>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostState {
    pub state: String,
    pub attributes: Attributes,
}

/// Raw access to the home-automation platform's entity store.
#[async_trait]
pub trait Host: Send + Sync {
    /// Fails with [`Error::Lookup`] if the entity does not exist.
    async fn get_state(&self, id: &EntityId) -> Result<HostState>;

    /// Fails with [`Error::Write`] if the host rejects the value.
    async fn set_state(
        &self,
        id: &EntityId,
        value: &Value,
        attributes: Option<&Attributes>,
    ) -> Result<()>;

    async fn get_schedule(&self, id: &EntityId) -> Result<WeeklySchedule>;
}

#[async_trait]
impl<T: Host + ?Sized> Host for Arc<T> {
    async fn get_state(&self, id: &EntityId) -> Result<HostState> {
        (**self).get_state(id).await
    }

    async fn set_state(
        &self,
        id: &EntityId,
        value: &Value,
        attributes: Option<&Attributes>,
    ) -> Result<()> {
        (**self).set_state(id, value, attributes).await
    }

    async fn get_schedule(&self, id: &EntityId) -> Result<WeeklySchedule> {
        (**self).get_schedule(id).await
    }
}

/// Reads and writes entities by logical name.
///
/// Every call goes to the host; nothing is cached.
pub struct StateAccessor {
    catalog: EntityCatalog,
    host: Box<dyn Host>,
}

fn is_missing(state: &str) -> bool {
    matches!(state, "unknown" | "unavailable" | "")
}

impl StateAccessor {
    pub fn new(catalog: EntityCatalog, host: Box<dyn Host>) -> Self {
        Self { catalog, host }
    }

    async fn host_state(&self, entity: Entity) -> Result<HostState> {
        let id = self.catalog.id(entity)?;
        self.host.get_state(id).await
    }

    pub async fn get(&self, entity: Entity) -> Result<Value> {
        let state = self.host_state(entity).await?;
        if is_missing(&state.state) {
            return Err(Error::unavailable(entity.name()));
        }
        Value::parse(&state.state, entity.value_type()).ok_or_else(|| {
            Error::lookup(
                entity.name(),
                format!("cannot interpret {:?} as {:?}", state.state, entity.value_type()),
            )
        })
    }

    pub async fn get_bool(&self, entity: Entity) -> Result<bool> {
        self.get(entity)
            .await?
            .as_bool()
            .ok_or_else(|| Error::lookup(entity.name(), "not a boolean"))
    }

    pub async fn get_f64(&self, entity: Entity) -> Result<f64> {
        self.get(entity)
            .await?
            .as_f64()
            .ok_or_else(|| Error::lookup(entity.name(), "not a number"))
    }

    /// Read one attribute of an entity; missing attributes are `Json::Null`.
    pub async fn attribute(&self, entity: Entity, key: &str) -> Result<Json> {
        let mut state = self.host_state(entity).await?;
        Ok(state.attributes.remove(key).unwrap_or(Json::Null))
    }

    pub async fn set(&self, entity: Entity, value: Value) -> Result<()> {
        self.write(entity, value, None).await
    }

    /// Set a value together with state attributes (for published sensors).
    pub async fn publish(&self, entity: Entity, value: Value, attributes: Attributes) -> Result<()> {
        self.write(entity, value, Some(&attributes)).await
    }

    async fn write(
        &self,
        entity: Entity,
        value: Value,
        attributes: Option<&Attributes>,
    ) -> Result<()> {
        let id = self
            .catalog
            .id(entity)
            .map_err(|err| Error::write(entity.name(), err.to_string()))?;
        if !id.kind().writable() {
            return Err(Error::write(id.as_str(), "entity does not accept writes"));
        }
        self.catalog.check_value(entity, &value)?;
        self.host.set_state(id, &value, attributes).await
    }

    /// Write `value` unless the entity already holds it.
    ///
    /// Returns whether a write was issued.
    pub async fn set_if_changed(&self, entity: Entity, value: Value) -> Result<bool> {
        if let Ok(old) = self.get(entity).await {
            if old == value {
                return Ok(false);
            }
        }
        self.set(entity, value).await?;
        Ok(true)
    }

    /// Planned drives from the schedule helper, resolved relative to `now`.
    ///
    /// Schedule blocks are in local time.
    pub async fn planned_drives(&self, now: DateTime<Utc>) -> Result<Vec<PlannedDrive>> {
        let id = self.catalog.id(Entity::PlannedDrives)?;
        Ok(self.host.get_schedule(id).await?.resolve(&now.with_timezone(&Local)))
    }

    /// Check that every mapped entity exists on the host.
    ///
    /// Returns the entities that could not be found.
    pub async fn check(&self) -> Vec<(Entity, Error)> {
        let mut missing = Vec::new();
        for (entity, id) in self.catalog.iter() {
            match self.host.get_state(id).await {
                Ok(_) => info!("Found {entity} as {id}"),
                Err(err) => {
                    warn!("Helper entity {entity} ({id}) is missing: {err}");
                    missing.push((entity, err));
                }
            }
        }
        missing
    }
}

/// In-memory entity store
#[derive(Default)]
pub struct MemoryHost {
    states: Mutex<HashMap<String, HostState>>,
    schedules: Mutex<HashMap<String, WeeklySchedule>>,
    writes: Mutex<Vec<(String, String)>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an entity.
    pub fn insert(&self, id: &str, state: impl Into<String>) {
        self.insert_with_attributes(id, state, Attributes::new());
    }

    pub fn insert_with_attributes(&self, id: &str, state: impl Into<String>, attributes: Attributes) {
        let state = HostState {
            state: state.into(),
            attributes,
        };
        self.states.lock().unwrap().insert(id.to_owned(), state);
    }

    pub fn insert_schedule(&self, id: &str, schedule: WeeklySchedule) {
        self.insert(id, "off");
        self.schedules.lock().unwrap().insert(id.to_owned(), schedule);
    }

    pub fn state(&self, id: &str) -> Option<String> {
        self.states.lock().unwrap().get(id).map(|s| s.state.clone())
    }

    /// All writes made so far, as (entity ID, state) pairs.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Host for MemoryHost {
    async fn get_state(&self, id: &EntityId) -> Result<HostState> {
        self.states
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| Error::lookup(id.as_str(), "no such entity"))
    }

    async fn set_state(
        &self,
        id: &EntityId,
        value: &Value,
        attributes: Option<&Attributes>,
    ) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(id.as_str()) else {
            return Err(Error::write(id.as_str(), "no such entity"));
        };
        state.state = value.to_state_string();
        if let Some(attributes) = attributes {
            state.attributes = attributes.clone();
        }
        self.writes
            .lock()
            .unwrap()
            .push((id.as_str().to_owned(), state.state.clone()));
        Ok(())
    }

    async fn get_schedule(&self, id: &EntityId) -> Result<WeeklySchedule> {
        self.schedules
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| Error::lookup(id.as_str(), "no such schedule"))
    }
}

/// Passes reads through to another host, but only logs writes.
pub struct DryrunHost {
    base: Box<dyn Host>,
}

impl DryrunHost {
    pub fn new(base: Box<dyn Host>) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Host for DryrunHost {
    async fn get_state(&self, id: &EntityId) -> Result<HostState> {
        self.base.get_state(id).await
    }

    async fn set_state(
        &self,
        id: &EntityId,
        value: &Value,
        _attributes: Option<&Attributes>,
    ) -> Result<()> {
        info!("Dry run: not setting {id} to {value}");
        Ok(())
    }

    async fn get_schedule(&self, id: &EntityId) -> Result<WeeklySchedule> {
        self.base.get_schedule(id).await
    }
}
