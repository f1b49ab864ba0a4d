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

pub mod config;
pub mod control;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod evaluator;
pub mod forecast;
pub mod homeassistant;
pub mod influxdb2;
pub mod monitoring;
pub mod price;
pub mod schedule;
pub mod state;
pub mod writer;
