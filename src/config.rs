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

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::price::tariff::TimeOfUseTariff;
use crate::price::Thresholds;

fn timeout_default() -> Duration {
    Duration::from_secs(10)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default = "url_default")]
    pub url: String,
    pub token: String,
    #[serde(default = "timeout_default", with = "humantime_serde")]
    pub timeout: Duration,
}

fn url_default() -> String {
    "http://localhost:8123".to_owned()
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PriceSourceKind {
    Tibber,
    Platform,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TibberConfig {
    pub token: String,
    pub home_id: Option<String>,
    #[serde(default = "tibber_interval_default", with = "humantime_serde")]
    pub interval: Duration,
    /// Prices fetched longer ago than this are reported as stale
    #[serde(default = "tibber_max_age_default", with = "humantime_serde")]
    pub max_age: Duration,
    #[serde(default = "timeout_default", with = "humantime_serde")]
    pub timeout: Duration,
}

fn tibber_interval_default() -> Duration {
    Duration::from_secs(3600)
}

fn tibber_max_age_default() -> Duration {
    Duration::from_secs(4 * 3600)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriceConfig {
    pub source: PriceSourceKind,
    #[serde(default)]
    pub thresholds: Thresholds,
    pub tibber: Option<TibberConfig>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForecastConfig {
    pub api_key: String,
    pub resource_id: String,
    #[serde(default = "forecast_hours_default")]
    pub hours: u32,
    #[serde(default = "forecast_interval_default", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default = "forecast_max_age_default", with = "humantime_serde")]
    pub max_age: Duration,
    /// Average household demand (kW) subtracted from the PV forecast
    #[serde(default = "baseline_default")]
    pub baseline_consumption: f64,
    #[serde(default = "timeout_default", with = "humantime_serde")]
    pub timeout: Duration,
}

fn forecast_hours_default() -> u32 {
    48
}

fn forecast_interval_default() -> Duration {
    Duration::from_secs(3 * 3600)
}

fn forecast_max_age_default() -> Duration {
    Duration::from_secs(12 * 3600)
}

fn baseline_default() -> f64 {
    0.5
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatteryConfig {
    /// Grid charging stops at this state of charge (%)
    #[serde(default = "target_soc_default")]
    pub target_soc: f64,
    /// Discharging stops at this state of charge (%)
    #[serde(default = "reserve_soc_default")]
    pub reserve_soc: f64,
    /// Window over which the solar excess is compared against zero
    #[serde(default = "lookahead_default", with = "humantime_serde")]
    pub lookahead: Duration,
    /// Derive the target and reserve from the forecast and the season
    /// instead of using the fixed values above
    #[serde(default)]
    pub dynamic: Option<DynamicTargetConfig>,
}

fn target_soc_default() -> f64 {
    80.0
}

fn reserve_soc_default() -> f64 {
    20.0
}

fn lookahead_default() -> Duration {
    Duration::from_secs(3 * 3600)
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            target_soc: target_soc_default(),
            reserve_soc: reserve_soc_default(),
            lookahead: lookahead_default(),
            dynamic: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicTargetConfig {
    /// Usable capacity (kWh) of the home battery
    pub capacity: f64,
    /// Reserve (%) in midsummer
    #[serde(default = "min_reserve_default")]
    pub min_reserve: f64,
    /// Reserve (%) in midwinter
    #[serde(default = "max_reserve_default")]
    pub max_reserve: f64,
    #[serde(default = "max_target_default")]
    pub max_target: f64,
}

fn min_reserve_default() -> f64 {
    5.0
}

fn max_reserve_default() -> f64 {
    30.0
}

fn max_target_default() -> f64 {
    100.0
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvConfig {
    /// Usable battery capacity (kWh)
    #[serde(default = "capacity_default")]
    pub capacity: f64,
    #[serde(default = "min_current_default")]
    pub min_current: f64,
    #[serde(default = "max_current_default")]
    pub max_current: f64,
    #[serde(default = "voltage_default")]
    pub voltage: f64,
    /// Grid export (W) to leave over when charging from PV surplus
    #[serde(default = "excess_target_default")]
    pub excess_target: f64,
    /// Steer the excess target by how far the home battery is from its
    /// target, leaving PV power for the battery when it is low
    #[serde(default)]
    pub auto_excess_target: bool,
    /// Largest automatic excess target (W), in either direction
    #[serde(default = "max_excess_target_default")]
    pub max_excess_target: f64,
    /// Minimum time between phase changes
    #[serde(default = "phase_cooldown_default", with = "humantime_serde")]
    pub phase_cooldown: Duration,
    /// Pause with the charger off while switching phases
    #[serde(default = "phase_switch_delay_default", with = "humantime_serde")]
    pub phase_switch_delay: Duration,
}

fn capacity_default() -> f64 {
    60.0
}

fn min_current_default() -> f64 {
    6.0
}

fn max_current_default() -> f64 {
    16.0
}

fn voltage_default() -> f64 {
    230.0
}

fn excess_target_default() -> f64 {
    500.0
}

fn max_excess_target_default() -> f64 {
    2500.0
}

fn phase_cooldown_default() -> Duration {
    Duration::from_secs(15 * 60)
}

fn phase_switch_delay_default() -> Duration {
    Duration::from_secs(20)
}

impl Default for EvConfig {
    fn default() -> Self {
        Self {
            capacity: capacity_default(),
            min_current: min_current_default(),
            max_current: max_current_default(),
            voltage: voltage_default(),
            excess_target: excess_target_default(),
            auto_excess_target: false,
            max_excess_target: max_excess_target_default(),
            phase_cooldown: phase_cooldown_default(),
            phase_switch_delay: phase_switch_delay_default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum InverterProduct {
    Victron,
    Generic,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InverterConfig {
    pub product: InverterProduct,
    /// Discharge power limit (W) written while discharging
    #[serde(default = "discharge_limit_default")]
    pub discharge_limit: f64,
    /// Mode option selected when the battery is idle
    #[serde(default = "standby_option_default")]
    pub standby_option: String,
    /// Mode option selected when charging or discharging
    #[serde(default = "active_option_default")]
    pub active_option: String,
}

fn discharge_limit_default() -> f64 {
    2500.0
}

fn standby_option_default() -> String {
    "Off".to_owned()
}

fn active_option_default() -> String {
    "On".to_owned()
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntervalConfig {
    #[serde(default = "battery_interval_default", with = "humantime_serde")]
    pub battery: Duration,
    #[serde(default = "ev_interval_default", with = "humantime_serde")]
    pub ev: Duration,
    /// How often watched entities are polled for changes
    #[serde(default = "watch_interval_default", with = "humantime_serde")]
    pub watch: Duration,
}

fn battery_interval_default() -> Duration {
    Duration::from_secs(300)
}

fn ev_interval_default() -> Duration {
    Duration::from_secs(60)
}

fn watch_interval_default() -> Duration {
    Duration::from_secs(10)
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            battery: battery_interval_default(),
            ev: ev_interval_default(),
            watch: watch_interval_default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Influxdb2Config {
    pub host: String,
    pub org: String,
    pub token: String,
    pub bucket: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub host: HostConfig,
    /// Overrides of entity IDs, keyed by logical name
    #[serde(default)]
    pub entities: HashMap<String, String>,
    pub price: PriceConfig,
    pub tariff: Option<TimeOfUseTariff>,
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    pub ev: Option<EvConfig>,
    pub inverter: InverterConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    pub influxdb2: Option<Influxdb2Config>,
}

fn check_soc(name: &str, soc: f64) -> Result<()> {
    if (0.0..=100.0).contains(&soc) {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be between 0 and 100")))
    }
}

fn check_nonzero(name: &str, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        Err(Error::Config(format!("{name} must be greater than zero")))
    } else {
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.price.thresholds.validate()?;
        check_nonzero("intervals.battery", self.intervals.battery)?;
        check_nonzero("intervals.ev", self.intervals.ev)?;
        check_nonzero("intervals.watch", self.intervals.watch)?;
        check_nonzero("forecast.interval", self.forecast.interval)?;
        if let Some(tibber) = &self.price.tibber {
            check_nonzero("price.tibber.interval", tibber.interval)?;
        }
        if let Some(tariff) = &self.tariff {
            check_nonzero("tariff.interval", tariff.interval)?;
            check_nonzero("tariff.slot", tariff.slot)?;
        }
        if self.price.source == PriceSourceKind::Tibber && self.price.tibber.is_none() {
            return Err(Error::Config(
                "price source is tibber but [price.tibber] is missing".to_owned(),
            ));
        }
        check_soc("battery.target_soc", self.battery.target_soc)?;
        check_soc("battery.reserve_soc", self.battery.reserve_soc)?;
        if self.battery.reserve_soc >= self.battery.target_soc {
            return Err(Error::Config(
                "battery.reserve_soc must be below battery.target_soc".to_owned(),
            ));
        }
        if let Some(dynamic) = &self.battery.dynamic {
            if dynamic.capacity <= 0.0 {
                return Err(Error::Config(
                    "battery.dynamic.capacity must be positive".to_owned(),
                ));
            }
            check_soc("battery.dynamic.min_reserve", dynamic.min_reserve)?;
            check_soc("battery.dynamic.max_reserve", dynamic.max_reserve)?;
            check_soc("battery.dynamic.max_target", dynamic.max_target)?;
            if dynamic.min_reserve > dynamic.max_reserve || dynamic.max_reserve >= dynamic.max_target {
                return Err(Error::Config(
                    "battery.dynamic needs min_reserve <= max_reserve < max_target".to_owned(),
                ));
            }
        }
        if let Some(ev) = &self.ev {
            if ev.max_excess_target < 0.0 {
                return Err(Error::Config(
                    "ev.max_excess_target must not be negative".to_owned(),
                ));
            }
            if !(0.0 < ev.min_current && ev.min_current <= ev.max_current) {
                return Err(Error::Config(
                    "ev.min_current must be positive and at most ev.max_current".to_owned(),
                ));
            }
            if ev.capacity <= 0.0 || ev.voltage <= 0.0 {
                return Err(Error::Config(
                    "ev.capacity and ev.voltage must be positive".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [host]
        token = "secret"

        [price]
        source = "platform"

        [forecast]
        api_key = "key"
        resource_id = "abcd-1234"

        [inverter]
        product = "victron"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.host.url, "http://localhost:8123");
        assert_eq!(config.host.timeout, Duration::from_secs(10));
        assert_eq!(config.price.thresholds, Thresholds::default());
        assert_eq!(config.forecast.interval, Duration::from_secs(3 * 3600));
        assert_eq!(config.battery.target_soc, 80.0);
        assert_eq!(config.battery.reserve_soc, 20.0);
        assert!(config.ev.is_none());
        assert!(config.tariff.is_none());
        assert_eq!(config.inverter.standby_option, "Off");
        assert_eq!(config.intervals.ev, Duration::from_secs(60));
    }

    #[test]
    fn full_config() {
        let config: Config = toml::from_str(
            r#"
            [host]
            url = "http://homeassistant.local:8123"
            token = "secret"
            timeout = "5s"

            [entities]
            battery_soc = "sensor.victron_battery_soc"
            excess_power = ""

            [price]
            source = "tibber"
            thresholds = { low = 0.15, high = 0.3 }

            [price.tibber]
            token = "tibber-token"
            home_id = "1cfebe9b"
            interval = "30m"

            [tariff]
            default_price = 0.255
            windows = [{ start = "23:30:00", end = "05:30:00", price = 0.175 }]

            [forecast]
            api_key = "key"
            resource_id = "abcd-1234"
            baseline_consumption = 0.4

            [battery]
            target_soc = 90
            reserve_soc = 25
            lookahead = "6h"

            [ev]
            capacity = 77
            max_current = 32
            phase_cooldown = "10m"

            [inverter]
            product = "generic"
            discharge_limit = 3000

            [intervals]
            battery = "2m"

            [influxdb2]
            host = "http://localhost:8086"
            org = "home"
            token = "influx"
            bucket = "powerplan"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.host.timeout, Duration::from_secs(5));
        assert_eq!(config.entities["excess_power"], "");
        assert_eq!(config.price.source, PriceSourceKind::Tibber);
        assert_eq!(config.price.tibber.as_ref().unwrap().interval, Duration::from_secs(1800));
        assert_eq!(config.tariff.as_ref().unwrap().windows.len(), 1);
        assert_eq!(config.battery.lookahead, Duration::from_secs(6 * 3600));
        let ev = config.ev.as_ref().unwrap();
        assert_eq!(ev.max_current, 32.0);
        assert_eq!(ev.min_current, 6.0);
        assert_eq!(ev.phase_cooldown, Duration::from_secs(600));
        assert_eq!(config.inverter.product, InverterProduct::Generic);
        assert_eq!(config.intervals.battery, Duration::from_secs(120));
        assert_eq!(config.influxdb2.as_ref().unwrap().bucket, "powerplan");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let text = format!("{MINIMAL}\nbogus = 1\n");
        assert!(toml::from_str::<Config>(&text).is_err());
    }

    #[test]
    fn validation() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.battery.reserve_soc = 85.0;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.price.source = PriceSourceKind::Tibber;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.ev = Some(EvConfig {
            min_current: 20.0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let check = |extra: &str| {
            let config: Config = toml::from_str(&format!("{MINIMAL}\n{extra}")).unwrap();
            config.validate()
        };
        assert!(check("").is_ok());
        for extra in [
            "[intervals]\nbattery = \"0s\"",
            "[intervals]\nev = \"0s\"",
            "[intervals]\nwatch = \"0s\"",
            "[tariff]\ndefault_price = 0.2\ninterval = \"0s\"",
            "[tariff]\ndefault_price = 0.2\nslot = \"0s\"",
        ] {
            assert!(
                matches!(check(extra), Err(Error::Config(_))),
                "accepted {extra:?}"
            );
        }

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.forecast.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        config.price.source = PriceSourceKind::Tibber;
        config.price.tibber = Some(
            toml::from_str::<TibberConfig>("token = \"t\"\ninterval = \"0s\"").unwrap(),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn dynamic_targets_are_opt_in() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert!(config.battery.dynamic.is_none());

        let check = |extra: &str| {
            let config: Config = toml::from_str(&format!("{MINIMAL}\n{extra}")).unwrap();
            config.validate().map(|()| config)
        };
        let config = check("[battery.dynamic]\ncapacity = 10.0\n[ev]\nauto_excess_target = true")
            .unwrap();
        let dynamic = config.battery.dynamic.unwrap();
        assert_eq!(dynamic.capacity, 10.0);
        assert_eq!(dynamic.min_reserve, 5.0);
        assert_eq!(dynamic.max_reserve, 30.0);
        assert_eq!(dynamic.max_target, 100.0);
        let ev = config.ev.unwrap();
        assert!(ev.auto_excess_target);
        assert_eq!(ev.max_excess_target, 2500.0);

        for extra in [
            "[battery.dynamic]\ncapacity = 0.0",
            "[battery.dynamic]\ncapacity = 10.0\nmin_reserve = 40.0",
            "[battery.dynamic]\ncapacity = 10.0\nmax_target = 30.0",
            "[ev]\nmax_excess_target = -1.0",
        ] {
            assert!(
                matches!(check(extra), Err(Error::Config(_))),
                "accepted {extra:?}"
            );
        }
    }
}
