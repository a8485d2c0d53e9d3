// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use fs_err as fs;
use log::warn;
use serde::de::DeserializeOwned;

const EXTENSION: &str = "yaml";

/// A configuration domain that can be layered across scopes.
/// `merge` combines two layers, the `other` side being the higher
/// priority one.
pub trait Config: DeserializeOwned {
    fn domain() -> String;

    fn merge(self, other: Self) -> Self;
}

/// Resolves configuration files across the project, user and machine
/// scopes, in decreasing priority
#[derive(Debug, Clone)]
pub struct Manager {
    program: String,
    scopes: Vec<Scope>,
}

impl Manager {
    pub fn new(program: impl ToString, project_root: Option<&Path>) -> Self {
        let mut scopes = vec![];

        if let Some(root) = project_root {
            scopes.push(Scope::Project(root.to_path_buf()));
        }
        if let Some(dir) = dirs::config_dir() {
            scopes.push(Scope::User(dir));
        }
        scopes.push(Scope::Machine(PathBuf::from("/etc")));

        Self {
            program: program.to_string(),
            scopes,
        }
    }

    /// Load and merge all present layers of `T`. Files that fail to
    /// parse are skipped with a warning, never an error.
    pub fn load<T: Config>(&self) -> Option<T> {
        let domain = T::domain();

        // Lowest priority first so the reduce lets higher scopes win
        self.scopes
            .iter()
            .rev()
            .filter_map(|scope| read_config(scope.file(&self.program, &domain)))
            .reduce(|low: T, high| low.merge(high))
    }
}

fn read_config<T: Config>(path: PathBuf) -> Option<T> {
    if !path.exists() {
        return None;
    }

    let bytes = fs::read(&path).ok()?;

    match serde_yaml::from_slice(&bytes) {
        Ok(config) => Some(config),
        Err(error) => {
            warn!("ignoring unparseable config file {path:?}: {error}");
            None
        }
    }
}

#[derive(Debug, Clone)]
enum Scope {
    Project(PathBuf),
    User(PathBuf),
    Machine(PathBuf),
}

impl Scope {
    fn file(&self, program: &str, domain: &str) -> PathBuf {
        match self {
            Scope::Project(root) => root.join(format!(".{program}")),
            Scope::User(dir) => dir.join(program),
            Scope::Machine(dir) => dir.join(program),
        }
        .join(format!("{domain}.{EXTENSION}"))
    }
}
