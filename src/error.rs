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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The logical name is not mapped, or the host does not know the entity.
    #[error("lookup of {0} failed: {1}")]
    Lookup(String, String),

    /// The host rejected a write, or the entity does not accept writes.
    #[error("write to {0} failed: {1}")]
    Write(String, String),

    /// No usable data, and nothing cached to fall back to.
    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error("request to {0} timed out")]
    FetchTimeout(String),

    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Data from a remote service is inconsistent.
    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn lookup(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lookup(what.into(), reason.into())
    }

    pub fn write(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Write(what.into(), reason.into())
    }

    pub fn unavailable(what: impl Into<String>) -> Self {
        Self::Unavailable(what.into())
    }

    /// Whether this is a (possibly transient) lack of data rather than a
    /// configuration or host problem.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::FetchTimeout(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            let url = err
                .url()
                .map(|url| url.to_string())
                .unwrap_or_else(|| "remote service".to_owned());
            Self::FetchTimeout(url)
        } else {
            Self::Http(err)
        }
    }
}
