/*
 * config.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portcullis, an IMAP/POP3 login front-end.
 *
 * Portcullis is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portcullis is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portcullis.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Login process configuration, read from an XML file with quick_xml:
//!
//! ```xml
//! <login>
//!   <socket-dir>/var/run/portcullis/login</socket-dir>
//!   <login-uid>97</login-uid>
//!   <max-inbuf-size>51200</max-inbuf-size>
//!   <reconnect-interval-ms>1000</reconnect-interval-ms>
//!   <log-level>info</log-level>
//!   <save-crlf>false</save-crlf>
//! </login>
//! ```
//!
//! Every element is optional. Unknown elements are ignored.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::auth::wire::MAX_INBUF_SIZE;

/// Environment variable forcing CRLF line endings in saved mail.
pub const SAVE_CRLF_ENV: &str = "PORTCULLIS_SAVE_CRLF";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid value {value:?} for <{element}>")]
    Invalid { element: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginConfig {
    /// Directory holding the auth worker sockets. Relative to the process cwd,
    /// which is normally the chroot.
    pub socket_dir: PathBuf,
    /// Sent to each worker in the handshake.
    pub login_uid: u32,
    pub max_inbuf_size: usize,
    pub reconnect_interval: Duration,
    /// Default tracing filter when RUST_LOG is unset.
    pub log_level: String,
    /// Store saved mail with CRLF line endings instead of LF.
    pub save_crlf: bool,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("."),
            login_uid: current_uid(),
            max_inbuf_size: MAX_INBUF_SIZE,
            reconnect_interval: Duration::from_millis(1000),
            log_level: "info".to_string(),
            save_crlf: false,
        }
    }
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

fn parse_bool(element: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(element, value)),
    }
}

fn invalid(element: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        element: element.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(element: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(element, value))
}

impl LoginConfig {
    /// Load from `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_xml(&content)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_xml(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut depth = 0usize;
        let mut element = String::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Eof => break,
                Event::Start(e) => {
                    depth += 1;
                    element.clear();
                    if depth == 2 {
                        element.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                    }
                }
                Event::Text(e) => {
                    if element.is_empty() {
                        buf.clear();
                        continue;
                    }
                    let text = e.unescape()?.trim().to_string();
                    config.set(&element, &text)?;
                    element.clear();
                }
                Event::End(_) => {
                    depth = depth.saturating_sub(1);
                    element.clear();
                }
                _ => {}
            }
            buf.clear();
        }
        Ok(config)
    }

    fn set(&mut self, element: &str, value: &str) -> Result<(), ConfigError> {
        match element {
            "socket-dir" => self.socket_dir = PathBuf::from(value),
            "login-uid" => self.login_uid = parse_number(element, value)?,
            "max-inbuf-size" => {
                let size: usize = parse_number(element, value)?;
                // Must hold at least a reply header.
                if size < 64 {
                    return Err(invalid(element, value));
                }
                self.max_inbuf_size = size;
            }
            "reconnect-interval-ms" => {
                let ms: u64 = parse_number(element, value)?;
                if ms == 0 {
                    return Err(invalid(element, value));
                }
                self.reconnect_interval = Duration::from_millis(ms);
            }
            "log-level" => self.log_level = value.to_string(),
            "save-crlf" => self.save_crlf = parse_bool(element, value)?,
            _ => {}
        }
        Ok(())
    }

    /// Apply overrides from the environment. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(SAVE_CRLF_ENV) {
            // Presence alone enables it, as long as it is not an explicit "no".
            self.save_crlf = value.is_empty() || parse_bool(SAVE_CRLF_ENV, &value)?;
        }
        Ok(())
    }
}
