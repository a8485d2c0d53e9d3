// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sys::FileSystem;

/// File name of the execution record, living in the project root
pub const STATE_FILE_NAME: &str = ".tasktree-state";

/// One record per executed `(definition, argument binding)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub def_hash: String,
    pub arg_hash: String,
    pub last_run_unix: i64,
    /// Expanded input path to its mtime in nanoseconds, in glob order
    pub inputs: IndexMap<String, u64>,
    /// Fields written by a newer schema are carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub entries: Vec<Entry>,
}

impl State {
    /// Load the state file. A missing or empty file is an empty state,
    /// anything unparseable is a hard error rather than silently
    /// discarded history.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self, Error> {
        if !fs.exists(path) {
            return Ok(Self::default());
        }

        let text = fs
            .read_to_string(path)
            .map_err(|source| Error::Read(path.to_path_buf(), source))?;

        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let entries =
            serde_json::from_str(&text).map_err(|source| Error::Corrupt(path.to_path_buf(), source))?;

        Ok(Self { entries })
    }

    /// Atomically rewrite the state file. The temp file is parsed back
    /// before the rename so a partial write can never become the
    /// canonical state.
    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), Error> {
        let serialized = serde_json::to_string_pretty(&self.entries)
            .map_err(|source| Error::Corrupt(path.to_path_buf(), source))?;

        let temp = temp_sibling(path);

        let write = |source| Error::Write(path.to_path_buf(), source);

        fs.write(&temp, &serialized).map_err(write)?;

        let verify = fs.read_to_string(&temp).map_err(write)?;
        if serde_json::from_str::<Vec<Entry>>(&verify).is_err() {
            let _ = fs.remove_file(&temp);
            return Err(Error::Write(
                path.to_path_buf(),
                io::Error::new(io::ErrorKind::InvalidData, "temp state failed verification"),
            ));
        }

        fs.rename(&temp, path).map_err(write)?;

        Ok(())
    }

    pub fn get(&self, def_hash: &str, arg_hash: &str) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|entry| entry.def_hash == def_hash && entry.arg_hash == arg_hash)
    }

    pub fn upsert(&mut self, entry: Entry) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.def_hash == entry.def_hash && existing.arg_hash == entry.arg_hash)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Drop entries whose definition no longer exists in the recipe.
    /// Returns how many were removed.
    pub fn prune(&mut self, live_definitions: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| live_definitions.contains(&entry.def_hash));
        before - self.entries.len()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(STATE_FILE_NAME);

    path.with_file_name(format!("{name}.tmp.{}", std::process::id()))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("state file {0:?} is corrupt, remove it to start over")]
    Corrupt(PathBuf, #[source] serde_json::Error),
    #[error("read state file {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("write state file {0:?}")]
    Write(PathBuf, #[source] io::Error),
}
