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

//! Trigger queue between event sources and the controller
//!
//! Timers and the state watcher push [`Trigger`]s onto one channel. A single
//! consumer drains it, so evaluations never overlap, and triggers that pile
//! up while an evaluation is running collapse into one.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::control::Controller;
use crate::entity::{Entity, Value};
use crate::state::StateAccessor;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Trigger {
    Battery,
    Ev,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Battery => "battery",
            Trigger::Ev => "EV",
        })
    }
}

pub type TriggerSender = UnboundedSender<Trigger>;
pub type TriggerReceiver = UnboundedReceiver<Trigger>;

pub fn channel() -> (TriggerSender, TriggerReceiver) {
    mpsc::unbounded_channel()
}

/// Entities whose changes should cause a re-evaluation
pub fn watched_entities(with_ev: bool) -> Vec<(Entity, Trigger)> {
    let mut watched = vec![
        (Entity::LowPrice, Trigger::Battery),
        (Entity::HighPrice, Trigger::Battery),
    ];
    if with_ev {
        watched.extend([
            (Entity::LowPrice, Trigger::Ev),
            (Entity::HighPrice, Trigger::Ev),
            (Entity::AutoEvCharging, Trigger::Ev),
            (Entity::EvForceCharge, Trigger::Ev),
            (Entity::AutoChargeLimit, Trigger::Ev),
            (Entity::EvRequiredSoc, Trigger::Ev),
        ]);
    }
    watched
}

/// Send `trigger` every `period`, starting immediately.
pub async fn timer(
    sender: TriggerSender,
    trigger: Trigger,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = token.cancelled() => break,
        }
        if sender.send(trigger).is_err() {
            break; // consumer has gone away
        }
    }
}

/// Check watched entities for changes and send the matching triggers.
///
/// The first observation of each entity only records its value. Returns
/// false once the consumer has gone away.
pub async fn check_changes(
    accessor: &StateAccessor,
    watched: &[(Entity, Trigger)],
    last: &mut HashMap<Entity, Value>,
    sender: &TriggerSender,
) -> bool {
    let mut seen = Vec::new();
    let mut changed = Vec::new();
    for &(entity, _) in watched {
        if seen.contains(&entity) {
            continue;
        }
        seen.push(entity);
        match accessor.get(entity).await {
            Ok(value) => {
                if let Some(old) = last.insert(entity, value.clone()) {
                    if old != value {
                        info!("{entity} changed from {old} to {value}");
                        changed.push(entity);
                    }
                }
            }
            Err(err) => debug!("Not watching {entity}: {err}"),
        }
    }
    for &(entity, trigger) in watched {
        if changed.contains(&entity) && sender.send(trigger).is_err() {
            warn!("Dropping {trigger} trigger: dispatcher has stopped");
            return false;
        }
    }
    true
}

pub async fn watch(
    accessor: &StateAccessor,
    watched: Vec<(Entity, Trigger)>,
    period: Duration,
    sender: TriggerSender,
    token: CancellationToken,
) {
    let mut last = HashMap::new();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = token.cancelled() => break,
        }
        if !check_changes(accessor, &watched, &mut last, &sender).await {
            break;
        }
    }
}

/// Take `first` and everything else already queued, without duplicates.
pub fn coalesce(first: Trigger, receiver: &mut TriggerReceiver) -> Vec<Trigger> {
    let mut pending = vec![first];
    while let Ok(trigger) = receiver.try_recv() {
        if !pending.contains(&trigger) {
            pending.push(trigger);
        }
    }
    pending
}

/// Consume triggers until cancelled or all senders are dropped.
pub async fn run(controller: &mut Controller, mut receiver: TriggerReceiver, token: CancellationToken) {
    loop {
        let first = tokio::select! {
            trigger = receiver.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
            _ = token.cancelled() => break,
        };
        for trigger in coalesce(first, &mut receiver) {
            controller.handle(trigger).await;
        }
    }
}
