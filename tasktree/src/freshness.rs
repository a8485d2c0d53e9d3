// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Definition hashing and the fresh/stale classification. The
//! definition hash covers what a task *does*: its command, outputs,
//! argument specs, working directory and resolved runner, all after
//! variable expansion. Renames, descriptions, deps and declared
//! inputs deliberately leave it untouched.

use std::{collections::BTreeMap, fmt, path::Path};

use indexmap::IndexMap;
use log::warn;
use sha2::{Digest, Sha256};
use tt_recipe::{IoEntry, Scalar};

use crate::{
    recipe::{Recipe, Task},
    runner,
    state::Entry,
    sys::FileSystem,
    template::{self, Scope},
};

/// Stable fingerprint of a task's contract, the primary state-file key
pub fn definition_hash(
    task: &Task,
    resolved_runner: &runner::Resolved,
    recipe: &Recipe,
) -> Result<String, template::Error> {
    let context = format!("task `{}`", task.name);
    let scope = Scope::new(&context)
        .with_vars(&recipe.variables)
        .with_namespace(task.namespace.as_deref());

    let cmd = template::substitute_vars(&task.cmd, &scope)?;

    let outputs = task
        .outputs
        .iter()
        .map(|entry| {
            let glob = template::substitute_vars(&entry.glob, &scope)?;
            Ok(serde_json::json!([entry.name, glob]))
        })
        .collect::<Result<Vec<_>, template::Error>>()?;

    let args = task
        .args
        .iter()
        .map(|arg| {
            serde_json::json!({
                "name": arg.spec.name,
                "type": arg.kind.to_string(),
                "default": arg.spec.default.as_ref().map(Scalar::canonical),
                "choices": arg
                    .spec
                    .choices
                    .as_ref()
                    .map(|choices| choices.iter().map(Scalar::canonical).collect::<Vec<_>>()),
                "min": arg.spec.min.as_ref().map(Scalar::canonical),
                "max": arg.spec.max.as_ref().map(Scalar::canonical),
            })
        })
        .collect::<Vec<_>>();

    let working_dir = task
        .working_dir
        .as_ref()
        .map(|dir| template::substitute_vars(dir, &scope))
        .transpose()?;

    let canonical = serde_json::json!({
        "cmd": cmd,
        "outputs": outputs,
        "args": args,
        "working_dir": working_dir,
        "runner": sha256(runner::canonical(resolved_runner).to_string().as_bytes()),
    });

    Ok(sha256(canonical.to_string().as_bytes()))
}

/// Fingerprint of one bound argument set; pairs are already sorted by
/// the `BTreeMap`
pub fn arg_binding_hash(args: &BTreeMap<String, String>) -> String {
    let pairs = args
        .iter()
        .map(|(name, value)| serde_json::json!([name, value]))
        .collect::<Vec<_>>();

    sha256(serde_json::Value::Array(pairs).to_string().as_bytes())
}

fn sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Expand effective input globs against the filesystem, collecting
/// each match's mtime. Globs that match nothing are permitted but
/// noted; paths that vanish mid-walk are skipped the same way.
pub fn expand_inputs(
    entries: &[IoEntry],
    scope: &Scope<'_>,
    base: &Path,
    fs: &dyn FileSystem,
) -> Result<IndexMap<String, u64>, template::Error> {
    let mut inputs = IndexMap::new();

    for entry in entries {
        let glob_text = template::substitute(&entry.glob, scope)?;

        let pattern = if Path::new(&glob_text).is_absolute() {
            glob_text.clone()
        } else {
            base.join(&glob_text).display().to_string()
        };

        let mut matches = match fs.glob(&pattern) {
            Ok(matches) => matches,
            Err(error) => {
                warn!("{}: invalid input glob `{glob_text}`: {error}", scope.context);
                continue;
            }
        };
        matches.sort();

        if matches.is_empty() {
            warn!("{}: input glob `{glob_text}` matched no files", scope.context);
        }

        for path in matches {
            match fs.mtime_ns(&path) {
                Ok(mtime) => {
                    inputs.insert(path.display().to_string(), mtime);
                }
                Err(error) => {
                    warn!("{}: cannot stat input {path:?}: {error}", scope.context);
                }
            }
        }
    }

    Ok(inputs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(Reason),
}

impl Freshness {
    pub fn stale(&self) -> bool {
        matches!(self, Freshness::Stale(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Forced,
    NoArtefacts,
    NeverRun,
    DepExecuted,
    InputSetChanged,
    InputsNewer,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Forced => "forced".fmt(f),
            Reason::NoArtefacts => "declares no inputs or outputs".fmt(f),
            Reason::NeverRun => "not run with this definition before".fmt(f),
            Reason::DepExecuted => "a dependency executed".fmt(f),
            Reason::InputSetChanged => "the set of inputs changed".fmt(f),
            Reason::InputsNewer => "inputs are newer than the last run".fmt(f),
        }
    }
}

/// Pure classification of one node. The caller supplies the state
/// entry under the node's key, the freshly expanded inputs, and
/// whether any direct dependency actually executed this invocation.
pub fn classify(
    entry: Option<&Entry>,
    current_inputs: &IndexMap<String, u64>,
    has_artefacts: bool,
    dep_executed: bool,
    forced: bool,
) -> Freshness {
    if forced {
        return Freshness::Stale(Reason::Forced);
    }

    if !has_artefacts {
        return Freshness::Stale(Reason::NoArtefacts);
    }

    if dep_executed {
        return Freshness::Stale(Reason::DepExecuted);
    }

    let Some(entry) = entry else {
        return Freshness::Stale(Reason::NeverRun);
    };

    if entry.inputs.len() != current_inputs.len()
        || !current_inputs.keys().all(|path| entry.inputs.contains_key(path))
    {
        return Freshness::Stale(Reason::InputSetChanged);
    }

    let newer = current_inputs
        .iter()
        .any(|(path, mtime)| entry.inputs.get(path).is_some_and(|stored| mtime > stored));

    if newer {
        return Freshness::Stale(Reason::InputsNewer);
    }

    Freshness::Fresh
}
