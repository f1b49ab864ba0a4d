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

use chrono::{DateTime, Duration, Local, Utc};
use log::{info, warn};
use std::sync::Arc;

use crate::config::{BatteryConfig, EvConfig};
use crate::dispatch::Trigger;
use crate::entity::{Entity, Value};
use crate::error::Result;
use crate::evaluator::battery::{self, BatteryDecision, BatteryInputs};
use crate::evaluator::ev::{self, ChargerSetpoint, EvDecision, EvInputs};
use crate::evaluator::inverter_mode;
use crate::evaluator::target::{self, BatteryTargets, ExcessInputs, TargetInputs};
use crate::forecast::{DemandMet, SolarForecast};
use crate::monitoring::{BatteryUpdate, EvUpdate, Monitor};
use crate::price::PriceSource;
use crate::schedule::{next_drive, ongoing_drive};
use crate::state::StateAccessor;
use crate::writer::{ChargerWriter, SetpointWriter};

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

/// Demand (kWh) at `baseline` kW until PV covers it, less the PV energy
/// produced before then.
pub fn energy_gap(now: DateTime<Utc>, baseline: f64, met: &DemandMet) -> f64 {
    baseline * hours_between(now, met.time) - met.energy_before
}

/// EV charging, with the writer that applies its decisions
pub struct EvControl {
    pub config: EvConfig,
    pub writer: ChargerWriter,
}

impl EvControl {
    pub fn new(config: EvConfig) -> Self {
        let writer = ChargerWriter::new(config.clone());
        Self { config, writer }
    }
}

/// Gathers inputs, runs the evaluators and writes their decisions.
///
/// Any failure skips the rest of the evaluation; whatever the host was
/// doing before is left as is until the next trigger.
pub struct Controller {
    accessor: Arc<StateAccessor>,
    prices: Arc<dyn PriceSource>,
    forecast: Arc<SolarForecast>,
    battery: BatteryConfig,
    setpoints: Box<dyn SetpointWriter>,
    ev: Option<EvControl>,
    monitor: Box<dyn Monitor>,
}

impl Controller {
    pub fn new(
        accessor: Arc<StateAccessor>,
        prices: Arc<dyn PriceSource>,
        forecast: Arc<SolarForecast>,
        battery: BatteryConfig,
        setpoints: Box<dyn SetpointWriter>,
        ev: Option<EvControl>,
        monitor: Box<dyn Monitor>,
    ) -> Self {
        Self {
            accessor,
            prices,
            forecast,
            battery,
            setpoints,
            ev,
            monitor,
        }
    }

    pub async fn handle(&mut self, trigger: Trigger) {
        let now = Utc::now();
        let result = match trigger {
            Trigger::Battery => self.update_battery(now).await.map(|_| ()),
            Trigger::Ev => self.update_ev(now).await.map(|_| ()),
        };
        if let Err(err) = result {
            warn!("Skipping {trigger} update: {err}");
        }
    }

    async fn battery_inputs(&self, now: DateTime<Utc>) -> Result<(BatteryInputs, bool)> {
        let soc = self.accessor.get_f64(Entity::BatterySoc).await?;
        let tier = self.prices.current_tier(now).await?;
        if tier.stale {
            warn!("Using stale price information ({})", tier.value);
        }
        let lookahead = Duration::from_std(self.battery.lookahead).unwrap_or(Duration::hours(3));
        let excess = self.forecast.excess_energy(now, now + lookahead, now)?;
        if excess.stale {
            warn!("Using stale solar forecast");
        }
        let inputs = BatteryInputs {
            soc,
            tier: tier.value,
            solar_excess: excess.value,
        };
        Ok((inputs, tier.stale))
    }

    /// Target and reserve for the home battery, derived from the forecast
    /// if dynamic targets are configured.
    fn battery_targets(
        &self,
        now: DateTime<Utc>,
        inputs: &BatteryInputs,
        ev_charging: bool,
    ) -> Result<BatteryTargets> {
        let Some(dynamic) = &self.battery.dynamic else {
            return Ok(BatteryTargets {
                target_soc: self.battery.target_soc,
                reserve_soc: self.battery.reserve_soc,
            });
        };
        let baseline = self.forecast.baseline_consumption();
        let met = self.forecast.next_meets_demand(now, baseline)?.value;
        let inputs = TargetInputs {
            date: now.with_timezone(&Local).date_naive(),
            soc: inputs.soc,
            energy_gap: met.map(|met| energy_gap(now, baseline, &met)),
            ev_charging,
            solar_excess: inputs.solar_excess,
        };
        Ok(target::evaluate(&inputs, dynamic))
    }

    async fn publish(&self, entity: Entity, value: Value) {
        if let Err(err) = self.accessor.set_if_changed(entity, value).await {
            warn!("Failed to publish {entity}: {err}");
        }
    }

    /// Publish when PV is next expected to cover the baseline demand.
    async fn publish_demand_met(&self, now: DateTime<Utc>) -> Result<()> {
        let baseline = self.forecast.baseline_consumption();
        let met = self.forecast.next_meets_demand(now, baseline)?.value;
        let state = met.map_or_else(|| "unknown".to_owned(), |met| met.time.to_rfc3339());
        self.publish(Entity::PvMeetsDemand, Value::Text(state)).await;
        Ok(())
    }

    pub async fn update_battery(&mut self, now: DateTime<Utc>) -> Result<BatteryDecision> {
        let (inputs, price_stale) = self.battery_inputs(now).await?;
        self.publish_demand_met(now).await?;
        let ev_charging = self.ev.is_some()
            && self
                .accessor
                .get_bool(Entity::ChargerSwitch)
                .await
                .unwrap_or(false);
        let targets = self.battery_targets(now, &inputs, ev_charging)?;
        if self.battery.dynamic.is_some() {
            info!(
                "Battery target {:.0}%, reserve {:.0}%",
                targets.target_soc, targets.reserve_soc
            );
            self.publish(Entity::BatteryTargetSoc, Value::Number(targets.target_soc.round()))
                .await;
            self.publish(Entity::BatteryReserveSoc, Value::Number(targets.reserve_soc.round()))
                .await;
        }
        let config = BatteryConfig {
            target_soc: targets.target_soc,
            reserve_soc: targets.reserve_soc,
            ..self.battery.clone()
        };
        let decision = battery::evaluate(&inputs, &config);
        let mode = inverter_mode::evaluate(&inputs, &config);
        info!("Battery: {} ({}), inverter {mode}", decision.state, decision.reason);
        self.setpoints
            .apply(&self.accessor, decision.state, mode)
            .await?;

        let update = BatteryUpdate {
            time: now,
            soc: inputs.soc,
            price_tier: inputs.tier.to_string(),
            price_stale,
            solar_excess: inputs.solar_excess,
            target_soc: targets.target_soc,
            reserve_soc: targets.reserve_soc,
            charge: decision.state.charge(),
            discharge: decision.state.discharge(),
            active: mode == inverter_mode::InverterMode::Active,
        };
        if let Err(err) = self.monitor.battery_update(update).await {
            warn!("Failed to update monitor: {err}");
        }
        Ok(decision)
    }

    async fn charger_state(&self, config: &EvConfig) -> ChargerSetpoint {
        let accessor = &self.accessor;
        ChargerSetpoint {
            enabled: accessor.get_bool(Entity::ChargerSwitch).await.unwrap_or(false),
            current: accessor
                .get_f64(Entity::ChargerCurrent)
                .await
                .unwrap_or(config.min_current),
            phases: accessor
                .get_f64(Entity::ChargerPhases)
                .await
                .map_or(1, |phases| if phases >= 2.0 { 3 } else { 1 }),
        }
    }

    /// Excess target (W) steered by the home battery's distance from its
    /// target.
    async fn auto_excess_target(
        &self,
        now: DateTime<Utc>,
        config: &EvConfig,
        charger: &ChargerSetpoint,
        drive_within_day: bool,
        ev_satisfied: bool,
    ) -> Result<f64> {
        let (battery, _) = self.battery_inputs(now).await?;
        let targets = self.battery_targets(now, &battery, charger.enabled)?;
        let inputs = ExcessInputs {
            home_soc: battery.soc,
            home_target: targets.target_soc,
            pv_power: self.forecast.pv_power(now)?.value.map(|kw| kw * 1000.0),
            ev_charging: charger.enabled,
            drive_within_day,
            ev_satisfied,
        };
        Ok(target::ev_excess_target(&inputs, config))
    }

    /// Returns None if automatic EV charging is disabled or overridden.
    pub async fn update_ev(&mut self, now: DateTime<Utc>) -> Result<Option<EvDecision>> {
        let Some(ev) = &self.ev else {
            return Ok(None);
        };
        let accessor = &self.accessor;
        if !accessor.get_bool(Entity::AutoEvCharging).await? {
            info!("Automatic EV charging is disabled");
            return Ok(None);
        }
        if accessor.get_bool(Entity::EvForceCharge).await.unwrap_or(false) {
            info!("EV force charge is on; leaving the charger alone");
            return Ok(None);
        }

        let soc = accessor.get_f64(Entity::EvSoc).await?;
        let mut required_soc = accessor.get_f64(Entity::EvRequiredSoc).await?;
        let tier = self.prices.current_tier(now).await?;
        if tier.stale {
            warn!("Using stale price information ({})", tier.value);
        }
        let drives = match accessor.planned_drives(now).await {
            Ok(drives) => drives,
            Err(err) => {
                warn!("Could not read planned drives, assuming none: {err}");
                vec![]
            }
        };
        // While a drive is under way there is nothing to charge for yet
        let ongoing = ongoing_drive(&drives, now).is_some();
        let next = if ongoing { None } else { next_drive(&drives, now) };
        if let Some(required) = next.and_then(|drive| drive.required_soc) {
            required_soc = required;
        }
        let charger = self.charger_state(&ev.config).await;
        let excess_target = if ev.config.auto_excess_target {
            let drive_within_day =
                ongoing || next.is_some_and(|drive| drive.start - now < Duration::days(1));
            let ev_satisfied = soc >= required_soc;
            self.auto_excess_target(now, &ev.config, &charger, drive_within_day, ev_satisfied)
                .await
                .unwrap_or_else(|err| {
                    warn!("Using fixed excess target: {err}");
                    ev.config.excess_target
                })
        } else {
            ev.config.excess_target
        };
        let inputs = EvInputs {
            now,
            soc,
            required_soc,
            tier: tier.value,
            next_drive: next.map(|drive| drive.start),
            drive_ongoing: ongoing,
            smart_limit_enabled: accessor
                .get_bool(Entity::AutoChargeLimit)
                .await
                .unwrap_or(false),
            excess_power: accessor.get_f64(Entity::ExcessPower).await.ok(),
            excess_target,
            charger,
        };

        let decision = ev::evaluate(&inputs, &ev.config);
        info!("EV charger: {} ({})", decision.setpoint, decision.reason);
        self.publish(Entity::SmartChargeLimit, Value::Number(decision.smart_limit))
            .await;
        let applied = ev
            .writer
            .apply(accessor, &decision.setpoint, &inputs.charger)
            .await?;

        let update = EvUpdate {
            time: now,
            soc,
            required_soc,
            smart_limit: decision.smart_limit,
            excess_power: inputs.excess_power,
            excess_target,
            enabled: applied.enabled,
            current: applied.current,
            phases: applied.phases,
            next_drive: inputs.next_drive,
        };
        if let Err(err) = self.monitor.ev_update(update).await {
            warn!("Failed to update monitor: {err}");
        }
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DynamicTargetConfig, InverterConfig, InverterProduct};
    use crate::entity::EntityCatalog;
    use crate::evaluator::battery::BatteryState;
    use crate::forecast::SolcastPeriod;
    use crate::monitoring::NullMonitor;
    use crate::price::tibber::HttpPriceSource;
    use crate::price::Thresholds;
    use crate::schedule::{BlockData, ScheduleBlock, WeeklySchedule};
    use crate::state::MemoryHost;
    use crate::writer::new_setpoint_writer;
    use chrono::{Local, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0).unwrap()
    }

    struct Fixture {
        host: Arc<MemoryHost>,
        prices: Arc<HttpPriceSource>,
        forecast: Arc<SolarForecast>,
        controller: Controller,
    }

    fn fixture() -> Fixture {
        fixture_with(
            BatteryConfig::default(),
            EvConfig {
                phase_switch_delay: std::time::Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn fixture_with(battery: BatteryConfig, ev: EvConfig) -> Fixture {
        let host = Arc::new(MemoryHost::new());
        for (entity, state) in [
            (Entity::BatterySoc, "50"),
            (Entity::ForceChargeSwitch, "off"),
            (Entity::DischargeLimit, "0"),
            (Entity::InverterMode, "Off"),
            (Entity::SmartChargeLimit, "85"),
            (Entity::EvSoc, "50"),
            (Entity::EvRequiredSoc, "80"),
            (Entity::AutoEvCharging, "on"),
            (Entity::EvForceCharge, "off"),
            (Entity::AutoChargeLimit, "off"),
            (Entity::ChargerSwitch, "off"),
            (Entity::ChargerCurrent, "6"),
            (Entity::ChargerPhases, "1"),
        ] {
            host.insert(entity.default_id(), state);
        }
        let accessor = Arc::new(StateAccessor::new(
            EntityCatalog::default(),
            Box::new(host.clone()),
        ));
        let prices = Arc::new(HttpPriceSource::new(Thresholds::default(), Duration::hours(4)));
        let forecast = Arc::new(SolarForecast::new(0.5, Duration::hours(12)));
        let inverter = InverterConfig {
            product: InverterProduct::Victron,
            discharge_limit: 2500.0,
            standby_option: "Off".to_owned(),
            active_option: "On".to_owned(),
        };
        let controller = Controller::new(
            accessor,
            prices.clone(),
            forecast.clone(),
            battery,
            new_setpoint_writer(&inverter),
            Some(EvControl::new(ev)),
            Box::new(NullMonitor),
        );
        Fixture {
            host,
            prices,
            forecast,
            controller,
        }
    }

    fn flat_prices(price: f64) -> Vec<(DateTime<Utc>, f64)> {
        (0..24)
            .map(|h| (Utc.with_ymd_and_hms(2025, 6, 4, h, 0, 0).unwrap(), price))
            .collect()
    }

    fn flat_forecast(pv_estimate: f64) -> Vec<SolcastPeriod> {
        (0..48)
            .map(|i| SolcastPeriod {
                pv_estimate,
                period_end: now() + Duration::minutes(30 * i),
                period: "PT30M".to_owned(),
            })
            .collect()
    }

    /// Weekly schedule with one block per (start, end, required SoC), in
    /// local time.
    fn schedule(drives: &[(DateTime<Utc>, DateTime<Utc>, Option<f64>)]) -> WeeklySchedule {
        let mut schedule = WeeklySchedule::default();
        for &(start, end, required) in drives {
            let start = start.with_timezone(&Local);
            let end = end.with_timezone(&Local);
            let block = ScheduleBlock {
                from: start.time(),
                to: end.time(),
                data: BlockData {
                    required,
                    distance: None,
                },
            };
            schedule
                .0
                .entry(start.format("%A").to_string().to_lowercase())
                .or_default()
                .push(block);
        }
        schedule
    }

    fn state(host: &MemoryHost, entity: Entity) -> String {
        host.state(entity.default_id()).unwrap()
    }

    #[tokio::test]
    async fn no_prices_means_no_writes() {
        let mut f = fixture();
        f.forecast.update(Ok(flat_forecast(1.0)), now());
        f.controller.handle(Trigger::Battery).await;
        f.controller.handle(Trigger::Ev).await;
        let result = f.controller.update_battery(now()).await;
        assert!(result.unwrap_err().is_unavailable());
        assert!(f.controller.update_ev(now()).await.is_err());
        assert!(f.host.writes().is_empty());
    }

    #[tokio::test]
    async fn missing_soc_means_no_writes() {
        let f = fixture();
        let mut controller = f.controller;
        f.prices.update(Ok(flat_prices(0.1)), now());
        f.forecast.update(Ok(flat_forecast(1.0)), now());
        f.host.insert(Entity::BatterySoc.default_id(), "unavailable");
        assert!(controller.update_battery(now()).await.is_err());
        assert!(f.host.writes().is_empty());
    }

    #[tokio::test]
    async fn cheap_power_charges_battery() {
        let mut f = fixture();
        f.prices.update(Ok(flat_prices(0.1)), now());
        f.forecast.update(Ok(flat_forecast(1.0)), now());
        f.host.insert(Entity::BatterySoc.default_id(), "40");
        let decision = f.controller.update_battery(now()).await.unwrap();
        assert_eq!(decision.state, BatteryState::Charging);
        assert_eq!(state(&f.host, Entity::ForceChargeSwitch), "on");
        assert_eq!(state(&f.host, Entity::InverterMode), "On");
        assert_eq!(state(&f.host, Entity::DischargeLimit), "0");
    }

    #[tokio::test]
    async fn expensive_power_discharges_battery() {
        let mut f = fixture();
        f.prices.update(Ok(flat_prices(0.4)), now());
        f.forecast.update(Ok(flat_forecast(1.0)), now());
        f.host.insert(Entity::BatterySoc.default_id(), "90");
        let decision = f.controller.update_battery(now()).await.unwrap();
        assert_eq!(decision.state, BatteryState::Discharging);
        assert_eq!(state(&f.host, Entity::ForceChargeSwitch), "off");
        assert_eq!(state(&f.host, Entity::DischargeLimit), "2500");
        assert_eq!(state(&f.host, Entity::InverterMode), "On");
    }

    #[tokio::test]
    async fn normal_price_with_sun_idles() {
        let mut f = fixture();
        f.prices.update(Ok(flat_prices(0.22)), now());
        f.forecast.update(Ok(flat_forecast(1.0)), now());
        let decision = f.controller.update_battery(now()).await.unwrap();
        assert_eq!(decision.state, BatteryState::Idle);
        assert!(f.host.writes().is_empty());
    }

    #[test]
    fn gap_until_pv_takes_over() {
        let met = DemandMet {
            time: now() + Duration::hours(10),
            energy_before: 1.5,
        };
        assert_eq!(energy_gap(now(), 0.5, &met), 3.5);
    }

    #[tokio::test]
    async fn dynamic_targets_follow_forecast() {
        let battery = BatteryConfig {
            dynamic: Some(DynamicTargetConfig {
                capacity: 10.0,
                min_reserve: 5.0,
                max_reserve: 30.0,
                max_target: 100.0,
            }),
            ..Default::default()
        };
        let mut f = fixture_with(battery, EvConfig::default());
        for (entity, state) in [
            (Entity::BatteryTargetSoc, "0"),
            (Entity::BatteryReserveSoc, "0"),
            (Entity::PvMeetsDemand, "unknown"),
        ] {
            f.host.insert(entity.default_id(), state);
        }
        f.prices.update(Ok(flat_prices(0.1)), now());
        f.host.insert(Entity::BatterySoc.default_id(), "40");

        // PV covers the house from 12:30, so 3 kWh plus the summer reserve will do
        f.forecast.update(Ok(flat_forecast(1.0)), now());
        let decision = f.controller.update_battery(now()).await.unwrap();
        assert_eq!(decision.state, BatteryState::Idle);
        assert_eq!(state(&f.host, Entity::BatteryTargetSoc), "35");
        assert_eq!(state(&f.host, Entity::BatteryReserveSoc), "5");
        assert_eq!(
            state(&f.host, Entity::PvMeetsDemand),
            "2025-06-04T12:30:00+00:00"
        );

        // No sun in sight: fill up while power is cheap
        f.forecast.update(Ok(flat_forecast(0.0)), now());
        let decision = f.controller.update_battery(now()).await.unwrap();
        assert_eq!(decision.state, BatteryState::Charging);
        assert_eq!(state(&f.host, Entity::BatteryTargetSoc), "100");
        assert_eq!(state(&f.host, Entity::PvMeetsDemand), "unknown");
    }

    #[tokio::test]
    async fn ev_excess_target_follows_home_battery() {
        let ev = EvConfig {
            auto_excess_target: true,
            phase_switch_delay: std::time::Duration::ZERO,
            ..Default::default()
        };
        let mut f = fixture_with(BatteryConfig::default(), ev);
        f.prices.update(Ok(flat_prices(0.22)), now());
        f.forecast.update(Ok(flat_forecast(1.0)), now());
        f.host.insert(Entity::ExcessPower.default_id(), "3000");

        // Home battery well below its target gets the PV first
        let decision = f.controller.update_ev(now()).await.unwrap().unwrap();
        assert!(!decision.setpoint.enabled);

        f.host.insert(Entity::BatterySoc.default_id(), "80");
        let decision = f.controller.update_ev(now()).await.unwrap().unwrap();
        assert!(decision.setpoint.enabled);
        assert_eq!(decision.setpoint.phases, 1);
        assert_eq!(decision.setpoint.current, 8.0);
    }

    #[tokio::test]
    async fn ev_charges_for_upcoming_drive() {
        let mut f = fixture();
        f.prices.update(Ok(flat_prices(0.4)), now());
        let decision = f.controller.update_ev(now()).await.unwrap().unwrap();
        assert!(!decision.setpoint.enabled);

        // Drive in an hour: charge despite the price
        let start = now() + Duration::hours(1);
        f.host.insert_schedule(
            Entity::PlannedDrives.default_id(),
            schedule(&[(start, start + Duration::hours(1), None)]),
        );
        let decision = f.controller.update_ev(now()).await.unwrap().unwrap();
        assert!(decision.setpoint.enabled);
        assert_eq!(decision.smart_limit, 100.0);
        assert_eq!(state(&f.host, Entity::ChargerSwitch), "on");
        assert_eq!(state(&f.host, Entity::ChargerPhases), "3");
        assert_eq!(state(&f.host, Entity::ChargerCurrent), "16");
        assert_eq!(state(&f.host, Entity::SmartChargeLimit), "100");
    }

    #[tokio::test]
    async fn ev_ongoing_drive_hides_the_next_one() {
        let mut f = fixture();
        f.prices.update(Ok(flat_prices(0.4)), now());
        // On the road now, and leaving again in two hours wanting a full battery
        let later = now() + Duration::hours(2);
        f.host.insert_schedule(
            Entity::PlannedDrives.default_id(),
            schedule(&[
                (now() - Duration::minutes(30), now() + Duration::minutes(30), None),
                (later, later + Duration::hours(1), Some(100.0)),
            ]),
        );
        let decision = f.controller.update_ev(now()).await.unwrap().unwrap();
        assert_eq!(decision.smart_limit, 100.0);
        assert!(!decision.setpoint.enabled);
        assert_eq!(state(&f.host, Entity::ChargerSwitch), "off");
    }

    #[tokio::test]
    async fn ev_respects_manual_override() {
        let mut f = fixture();
        f.prices.update(Ok(flat_prices(0.1)), now());
        f.host.insert(Entity::EvForceCharge.default_id(), "on");
        assert!(f.controller.update_ev(now()).await.unwrap().is_none());
        f.host.insert(Entity::EvForceCharge.default_id(), "off");
        f.host.insert(Entity::AutoEvCharging.default_id(), "off");
        assert!(f.controller.update_ev(now()).await.unwrap().is_none());
        assert!(f.host.writes().is_empty());
    }
}
