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

//! Charging decisions
//!
//! Every evaluator is a pure function of a snapshot of its inputs and the
//! configuration. Nothing is remembered between evaluations; the current
//! state of the charger or battery is part of the snapshot when it matters.

pub mod battery;
pub mod ev;
pub mod inverter_mode;
pub mod target;
