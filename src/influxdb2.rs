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
use influxdb2::api::write::TimestampPrecision;
use influxdb2::models::health::Status;
use influxdb2::models::DataPoint;
use influxdb2::Client;
use log::{info, warn};
use std::error::Error;

use crate::config::Influxdb2Config;
use crate::monitoring::{BatteryUpdate, EvUpdate, Monitor};

pub struct Influxdb2Monitor {
    client: Client,
    bucket: String,
}

impl Influxdb2Monitor {
    pub async fn new(config: &Influxdb2Config) -> Self {
        let client = Client::new(&config.host, &config.org, &config.token);
        match client.health().await {
            Ok(health_check) => {
                if health_check.status == Status::Fail {
                    match health_check.message {
                        Some(ref message) => {
                            warn!("Influxdb server is unhealthy: {}", message);
                        }
                        None => {
                            warn!("Influxdb server is unhealthy");
                        }
                    }
                } else {
                    info!(
                        "Successfully connected to Influxdb server at {}",
                        &config.host
                    );
                }
            }
            Err(err) => {
                warn!("Could not connect to Influxdb server: {}", err);
            }
        }
        Self {
            client,
            bucket: config.bucket.to_owned(),
        }
    }

    async fn write(&self, point: DataPoint) -> Result<(), Box<dyn Error>> {
        let strm = futures::stream::once(async { point });
        self.client
            .write_with_precision(&self.bucket, strm, TimestampPrecision::Seconds)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Monitor for Influxdb2Monitor {
    async fn battery_update(&mut self, update: BatteryUpdate) -> Result<(), Box<dyn Error>> {
        let point = DataPoint::builder("powerplan-battery")
            .timestamp(update.time.timestamp())
            .tag("price_tier", update.price_tier)
            .field("soc", update.soc)
            .field("price_stale", update.price_stale)
            .field("solar_excess", update.solar_excess)
            .field("target_soc", update.target_soc)
            .field("reserve_soc", update.reserve_soc)
            .field("charge", update.charge)
            .field("discharge", update.discharge)
            .field("active", update.active)
            .build()?;
        self.write(point).await
    }

    async fn ev_update(&mut self, update: EvUpdate) -> Result<(), Box<dyn Error>> {
        let mut builder = DataPoint::builder("powerplan-ev")
            .timestamp(update.time.timestamp())
            .field("soc", update.soc)
            .field("required_soc", update.required_soc)
            .field("smart_limit", update.smart_limit)
            .field("excess_target", update.excess_target)
            .field("enabled", update.enabled)
            .field("current", update.current)
            .field("phases", i64::from(update.phases));
        if let Some(excess_power) = update.excess_power {
            builder = builder.field("excess_power", excess_power);
        }
        if let Some(next_drive) = update.next_drive {
            builder = builder.field(
                "next_drive_seconds",
                (next_drive - update.time).num_milliseconds() as f64 * 1e-3,
            );
        }
        self.write(builder.build()?).await
    }
}
