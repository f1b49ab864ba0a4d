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
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use std::time::Duration;

use crate::entity::{EntityId, EntityKind, Value};
use crate::error::{Error, Result};
use crate::schedule::WeeklySchedule;
use crate::state::{Attributes, Host, HostState};

#[derive(Deserialize)]
struct StateResponse {
    state: String,
    #[serde(default)]
    attributes: Attributes,
}

/// Home Assistant REST API client
pub struct HomeAssistant {
    base_url: String,
    token: String,
    client: Client,
}

impl HomeAssistant {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url: String = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.into(),
            client: reqwest::ClientBuilder::new().timeout(timeout).build()?,
        })
    }

    async fn call_service(&self, id: &EntityId, service: &str, data: Json) -> Result<()> {
        let url = format!("{}/api/services/{}/{}", self.base_url, id.domain(), service);
        debug!("POST {url}: {data}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&data)
            .send()
            .await
            .map_err(|err| Error::write(id.as_str(), err.to_string()))?;
        check_write(id, response).await
    }

    async fn post_state(&self, id: &EntityId, value: &Value, attributes: Option<&Attributes>) -> Result<()> {
        let url = format!("{}/api/states/{}", self.base_url, id);
        let data = json!({
            "state": value.to_state_string(),
            "attributes": attributes.cloned().unwrap_or_default(),
        });
        debug!("POST {url}: {data}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&data)
            .send()
            .await
            .map_err(|err| Error::write(id.as_str(), err.to_string()))?;
        check_write(id, response).await
    }
}

async fn check_write(id: &EntityId, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(Error::write(id.as_str(), format!("HTTP {status}: {body}")))
    }
}

fn wrong_type(id: &EntityId, value: &Value) -> Error {
    Error::write(
        id.as_str(),
        format!("cannot write {value:?} to a {} entity", id.domain()),
    )
}

#[async_trait]
impl Host for HomeAssistant {
    async fn get_state(&self, id: &EntityId) -> Result<HostState> {
        let url = format!("{}/api/states/{}", self.base_url, id);
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::lookup(id.as_str(), "entity not found")),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(Error::lookup(id.as_str(), "access denied"))
            }
            _ => {
                let state: StateResponse = response.error_for_status()?.json().await?;
                debug!("{id} = {:?}", state.state);
                Ok(HostState {
                    state: state.state,
                    attributes: state.attributes,
                })
            }
        }
    }

    async fn set_state(
        &self,
        id: &EntityId,
        value: &Value,
        attributes: Option<&Attributes>,
    ) -> Result<()> {
        match id.kind() {
            EntityKind::Switch | EntityKind::InputBoolean => {
                let on = value.as_bool().ok_or_else(|| wrong_type(id, value))?;
                let service = if on { "turn_on" } else { "turn_off" };
                self.call_service(id, service, json!({"entity_id": id.as_str()}))
                    .await
            }
            EntityKind::Number | EntityKind::InputNumber => {
                let x = value.as_f64().ok_or_else(|| wrong_type(id, value))?;
                self.call_service(id, "set_value", json!({"entity_id": id.as_str(), "value": x}))
                    .await
            }
            EntityKind::Select | EntityKind::InputSelect => {
                let option = value.as_str().ok_or_else(|| wrong_type(id, value))?;
                self.call_service(
                    id,
                    "select_option",
                    json!({"entity_id": id.as_str(), "option": option}),
                )
                .await
            }
            EntityKind::Sensor | EntityKind::BinarySensor => {
                self.post_state(id, value, attributes).await
            }
            EntityKind::Schedule => Err(Error::write(id.as_str(), "schedules are read-only")),
        }
    }

    async fn get_schedule(&self, id: &EntityId) -> Result<WeeklySchedule> {
        let url = format!("{}/api/services/schedule/get_schedule", self.base_url);
        let mut response: Json = self
            .client
            .post(&url)
            .query(&[("return_response", "")])
            .bearer_auth(&self.token)
            .json(&json!({"entity_id": id.as_str()}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let schedule = response
            .get_mut("service_response")
            .and_then(|r| r.get_mut(id.as_str()))
            .map(Json::take)
            .ok_or_else(|| Error::lookup(id.as_str(), "no schedule in service response"))?;
        Ok(serde_json::from_value(schedule)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn client(server: &Server) -> HomeAssistant {
        HomeAssistant::new(server.url(), "test_token", Duration::from_secs(5)).unwrap()
    }

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    #[tokio::test]
    async fn get_state() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/states/sensor.battery_soc")
            .match_header("authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "entity_id": "sensor.battery_soc",
                    "state": "42.5",
                    "attributes": {"unit_of_measurement": "%"},
                    "last_changed": "2025-10-02T10:00:00Z",
                    "last_updated": "2025-10-02T10:00:00Z"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let state = client(&server)
            .get_state(&id("sensor.battery_soc"))
            .await
            .unwrap();
        assert_eq!(state.state, "42.5");
        assert_eq!(state.attributes["unit_of_measurement"], "%");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn missing_entity_is_lookup_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/states/sensor.nonexistent")
            .with_status(404)
            .create_async()
            .await;

        let result = client(&server).get_state(&id("sensor.nonexistent")).await;
        assert!(matches!(result, Err(Error::Lookup(..))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn switch_uses_turn_on() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/services/switch/turn_on")
            .match_header("authorization", "Bearer test_token")
            .match_body(Matcher::Json(json!({"entity_id": "switch.charger"})))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        client(&server)
            .set_state(&id("switch.charger"), &Value::Bool(true), None)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn number_and_select() {
        let mut server = Server::new_async().await;
        let number = server
            .mock("POST", "/api/services/input_number/set_value")
            .match_body(Matcher::Json(
                json!({"entity_id": "input_number.limit", "value": 2500.0}),
            ))
            .with_status(200)
            .create_async()
            .await;
        let select = server
            .mock("POST", "/api/services/input_select/select_option")
            .match_body(Matcher::Json(
                json!({"entity_id": "input_select.mode", "option": "Off"}),
            ))
            .with_status(200)
            .create_async()
            .await;

        let ha = client(&server);
        ha.set_state(&id("input_number.limit"), &Value::Number(2500.0), None)
            .await
            .unwrap();
        ha.set_state(&id("input_select.mode"), &Value::Text("Off".to_owned()), None)
            .await
            .unwrap();
        number.assert_async().await;
        select.assert_async().await;
    }

    #[tokio::test]
    async fn sensor_state_is_posted() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/states/binary_sensor.low_price")
            .match_body(Matcher::Json(
                json!({"state": "on", "attributes": {"friendly_name": "Low price"}}),
            ))
            .with_status(201)
            .create_async()
            .await;

        let mut attributes = Attributes::new();
        attributes.insert("friendly_name".to_owned(), json!("Low price"));
        client(&server)
            .set_state(&id("binary_sensor.low_price"), &Value::Bool(true), Some(&attributes))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_write() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/services/number/set_value")
            .with_status(400)
            .with_body("value out of range")
            .create_async()
            .await;

        let result = client(&server)
            .set_state(&id("number.current"), &Value::Number(99.0), None)
            .await;
        assert!(matches!(result, Err(Error::Write(..))));
        let result = client(&server)
            .set_state(&id("number.current"), &Value::Bool(true), None)
            .await;
        assert!(matches!(result, Err(Error::Write(..))));
    }

    #[tokio::test]
    async fn get_schedule() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/services/schedule/get_schedule")
            .match_query(Matcher::UrlEncoded("return_response".into(), "".into()))
            .with_status(200)
            .with_body(
                json!({
                    "changed_states": [],
                    "service_response": {
                        "schedule.drives": {
                            "monday": [
                                {"from": "07:00:00", "to": "08:00:00", "data": {"required": 80}}
                            ],
                            "tuesday": []
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let schedule = client(&server)
            .get_schedule(&id("schedule.drives"))
            .await
            .unwrap();
        assert_eq!(schedule.0["monday"][0].data.required, Some(80.0));
        assert!(schedule.0["tuesday"].is_empty());
        mock.assert_async().await;
    }
}
