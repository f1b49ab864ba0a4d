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

use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use powerplan::config::{Config, PriceSourceKind};
use powerplan::control::{Controller, EvControl};
use powerplan::dispatch::{self, Trigger};
use powerplan::entity::EntityCatalog;
use powerplan::forecast::{self, SolarForecast};
use powerplan::homeassistant::HomeAssistant;
use powerplan::influxdb2::Influxdb2Monitor;
use powerplan::monitoring::{Monitor, NullMonitor};
use powerplan::price::platform::PlatformPriceSource;
use powerplan::price::tariff;
use powerplan::price::tibber::{self, HttpPriceSource};
use powerplan::price::PriceSource;
use powerplan::state::{DryrunHost, Host, StateAccessor};
use powerplan::writer::new_setpoint_writer;

#[derive(Parser)]
#[clap(author, version)]
struct Args {
    #[clap()]
    config_file: PathBuf,
    /// Log writes instead of making them
    #[clap(long)]
    dry_run: bool,
    /// Check that all helper entities exist, then exit
    #[clap(long)]
    check: bool,
    /// Fetch data and evaluate each rule once, then exit
    #[clap(long)]
    once: bool,
}

#[cfg(unix)]
async fn wait_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    };
    Ok(())
}

#[cfg(not(unix))]
async fn wait_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let config: Config = toml::from_str(&std::fs::read_to_string(args.config_file)?)?;
    config.validate()?;

    let catalog = EntityCatalog::new(&config.entities)?;
    let ha = HomeAssistant::new(&config.host.url, &config.host.token, config.host.timeout)?;
    let host: Box<dyn Host> = if args.dry_run {
        Box::new(DryrunHost::new(Box::new(ha)))
    } else {
        Box::new(ha)
    };
    let accessor = Arc::new(StateAccessor::new(catalog, host));

    let missing = accessor.check().await;
    if args.check {
        if missing.is_empty() {
            info!("All helper entities are present");
            return Ok(());
        }
        return Err(format!("{} helper entities are missing", missing.len()).into());
    }

    let token = CancellationToken::new();
    let mut handles = Vec::new();
    let thresholds = config.price.thresholds;

    let prices: Arc<dyn PriceSource> = match config.price.source {
        PriceSourceKind::Tibber => {
            let tibber_config = config
                .price
                .tibber
                .as_ref()
                .ok_or("price source is tibber but [price.tibber] is missing")?;
            let source = Arc::new(HttpPriceSource::new(
                thresholds,
                chrono::Duration::from_std(tibber_config.max_age)?,
            ));
            let api = tibber::API::new(
                tibber_config.token.clone(),
                tibber_config.home_id.clone(),
                tibber_config.timeout,
            )?;
            if args.once {
                source.update(api.price_info().await.map(|info| info.prices()), Utc::now());
            } else {
                let source = source.clone();
                let interval = tibber_config.interval;
                let token = token.clone();
                handles.push(tokio::spawn(async move {
                    tibber::poll_prices(&api, &source, interval, token).await;
                }));
            }
            source
        }
        PriceSourceKind::Platform => {
            Arc::new(PlatformPriceSource::new(accessor.clone(), thresholds))
        }
    };

    if let Some(tariff) = config.tariff.clone() {
        if args.once {
            if let Err(err) = tariff.publish(&accessor, &thresholds, &chrono::Local::now()).await {
                warn!("Failed to publish tariff: {err}");
            }
        } else {
            let accessor = accessor.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                tariff::publish_tariff(&tariff, &accessor, &thresholds, token).await;
            }));
        }
    }

    let forecast = Arc::new(SolarForecast::new(
        config.forecast.baseline_consumption,
        chrono::Duration::from_std(config.forecast.max_age)?,
    ));
    let forecast_api = forecast::API::new(
        config.forecast.api_key.clone(),
        config.forecast.resource_id.clone(),
        config.forecast.hours,
        config.forecast.timeout,
    )?;
    if args.once {
        forecast.update(forecast_api.forecasts().await, Utc::now());
    } else {
        let forecast = forecast.clone();
        let interval = config.forecast.interval;
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            forecast::poll_forecast(&forecast_api, &forecast, interval, token).await;
        }));
    }

    let monitor: Box<dyn Monitor> = match &config.influxdb2 {
        Some(conf) => Box::new(Influxdb2Monitor::new(conf).await),
        None => Box::new(NullMonitor),
    };
    let with_ev = config.ev.is_some();
    let mut controller = Controller::new(
        accessor.clone(),
        prices,
        forecast,
        config.battery.clone(),
        new_setpoint_writer(&config.inverter),
        config.ev.clone().map(EvControl::new),
        monitor,
    );

    if args.once {
        controller.handle(Trigger::Battery).await;
        if with_ev {
            controller.handle(Trigger::Ev).await;
        }
        return Ok(());
    }

    let (sender, receiver) = dispatch::channel();
    let control_token = token.clone();
    handles.push(tokio::spawn(async move {
        // Give the pollers some time to load the first set of information
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        dispatch::run(&mut controller, receiver, control_token).await;
    }));
    let mut timers = vec![(Trigger::Battery, config.intervals.battery)];
    if with_ev {
        timers.push((Trigger::Ev, config.intervals.ev));
    }
    for (trigger, period) in timers {
        handles.push(tokio::spawn(dispatch::timer(
            sender.clone(),
            trigger,
            period,
            token.clone(),
        )));
    }
    let watch_token = token.clone();
    let watch_period = config.intervals.watch;
    handles.push(tokio::spawn(async move {
        let watched = dispatch::watched_entities(with_ev);
        dispatch::watch(&accessor, watched, watch_period, sender, watch_token).await;
    }));

    wait_shutdown().await?;
    token.cancel();
    for handle in handles {
        handle.await?;
    }
    Ok(())
}
