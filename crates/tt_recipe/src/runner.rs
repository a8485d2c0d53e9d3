// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

/// A named execution context for task commands
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Runner {
    Shell(ShellRunner),
    Container(ContainerRunner),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellRunner {
    pub shell: PathBuf,
    #[serde(default)]
    pub preamble: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerRunner {
    pub dockerfile: PathBuf,
    #[serde(default = "default_context")]
    pub context: PathBuf,
    #[serde(default)]
    pub volumes: Vec<Bind>,
    #[serde(default)]
    pub ports: Vec<PortMap>,
    #[serde(default)]
    pub build_args: IndexMap<String, String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub run_as_root: bool,
}

fn default_context() -> PathBuf {
    ".".into()
}

/// A bind mount, declared as `host:guest` with an optional `:ro` suffix
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Bind {
    pub host: PathBuf,
    pub guest: PathBuf,
    pub read_only: bool,
}

impl TryFrom<String> for Bind {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let mut parts = s.split(':');

        let (host, guest) = match (parts.next(), parts.next()) {
            (Some(host), Some(guest)) if !host.is_empty() && !guest.is_empty() => (host, guest),
            _ => return Err(ParseError::Bind(s.clone())),
        };

        let read_only = match parts.next() {
            None => false,
            Some("ro") => true,
            Some("rw") => false,
            Some(_) => return Err(ParseError::Bind(s.clone())),
        };

        if parts.next().is_some() {
            return Err(ParseError::Bind(s));
        }

        Ok(Bind {
            host: host.into(),
            guest: guest.into(),
            read_only,
        })
    }
}

/// A port mapping, declared as `host:guest` or a single shared port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortMap {
    pub host: u16,
    pub guest: u16,
}

impl TryFrom<String> for PortMap {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let invalid = || ParseError::Port(s.clone());

        match s.split_once(':') {
            Some((host, guest)) => Ok(PortMap {
                host: host.parse().map_err(|_| invalid())?,
                guest: guest.parse().map_err(|_| invalid())?,
            }),
            None => {
                let port = s.parse().map_err(|_| invalid())?;
                Ok(PortMap { host: port, guest: port })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid bind `{0}`, expected host:guest[:ro]")]
    Bind(String),
    #[error("invalid port mapping `{0}`, expected host:guest")]
    Port(String),
}
