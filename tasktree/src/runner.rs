// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{cell::RefCell, collections::HashMap, io, path::Path, path::PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tt_recipe::{ContainerRunner, Runner as Definition};

use crate::{
    recipe::{Recipe, Task},
    sys::{SpawnRequest, StdioPolicy, Sys},
};

/// Where the state file is visible inside every container runner.
/// Nested `tt` invocations in the container depend on this path.
pub const CONTAINER_STATE_PATH: &str = "/.tasktree-state";

/// Where the materialised command script is mounted in a container
pub const CONTAINER_SCRIPT_PATH: &str = "/.tasktree-script";

/// A runner definition resolved for one node
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub name: String,
    pub definition: Definition,
}

impl Resolved {
    pub fn container(&self) -> Option<&ContainerRunner> {
        match &self.definition {
            Definition::Container(container) => Some(container),
            Definition::Shell(_) => None,
        }
    }
}

/// The layered configuration contribution: a default runner definition
/// from the project, user or machine scope
#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub runner: Option<Definition>,
}

impl config::Config for Defaults {
    fn domain() -> String {
        "defaults".into()
    }

    fn merge(self, other: Self) -> Self {
        Self {
            runner: other.runner.or(self.runner),
        }
    }
}

/// The fallback when nothing else names a runner
pub fn platform_default() -> Resolved {
    #[cfg(unix)]
    let definition = Definition::Shell(tt_recipe::ShellRunner {
        shell: "/bin/bash".into(),
        preamble: String::new(),
    });
    #[cfg(windows)]
    let definition = Definition::Shell(tt_recipe::ShellRunner {
        shell: "cmd".into(),
        preamble: String::new(),
    });

    Resolved {
        name: "platform".into(),
        definition,
    }
}

/// Pick the runner for one node, highest priority source first:
/// CLI override, pinned task runner, import-site `run_in`, task
/// runner, the recipe's `default` runner, layered configuration, then
/// the platform shell.
pub fn resolve(
    cli_override: Option<&str>,
    task: &Task,
    recipe: &Recipe,
    config_default: Option<&Defaults>,
) -> Result<Resolved, Error> {
    let lookup = |name: &str| {
        recipe
            .runners
            .get(name)
            .map(|definition| Resolved {
                name: name.to_owned(),
                definition: definition.clone(),
            })
            .ok_or_else(|| Error::UnknownRunner(name.to_owned()))
    };

    if let Some(name) = cli_override {
        return lookup(name);
    }

    if task.pin_runner {
        if let Some(name) = &task.runner {
            return lookup(name);
        }
    }

    if let Some(name) = &task.run_in {
        return lookup(name);
    }

    if let Some(name) = &task.runner {
        return lookup(name);
    }

    if recipe.runners.contains_key("default") {
        return lookup("default");
    }

    if let Some(definition) = config_default.and_then(|defaults| defaults.runner.as_ref()) {
        return Ok(Resolved {
            name: "default".into(),
            definition: definition.clone(),
        });
    }

    Ok(platform_default())
}

/// Canonical form of a runner definition, feeding the task definition
/// hash. Maps are emitted as sorted pairs so the hash is stable.
pub fn canonical(resolved: &Resolved) -> serde_json::Value {
    let sorted = |map: &indexmap::IndexMap<String, String>| {
        let mut pairs = map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(k, v)| serde_json::json!([k, v]))
            .collect::<Vec<_>>()
    };

    match &resolved.definition {
        Definition::Shell(shell) => serde_json::json!({
            "shell": shell.shell.display().to_string(),
            "preamble": shell.preamble,
        }),
        Definition::Container(container) => serde_json::json!({
            "dockerfile": container.dockerfile.display().to_string(),
            "context": container.context.display().to_string(),
            "volumes": container
                .volumes
                .iter()
                .map(|bind| format!("{}:{}:{}", bind.host.display(), bind.guest.display(), bind.read_only))
                .collect::<Vec<_>>(),
            "ports": container
                .ports
                .iter()
                .map(|port| format!("{}:{}", port.host, port.guest))
                .collect::<Vec<_>>(),
            "build_args": sorted(&container.build_args),
            "env": sorted(&container.env),
            "working_dir": container.working_dir.as_ref().map(|dir| dir.display().to_string()),
            "run_as_root": container.run_as_root,
        }),
    }
}

/// Images built within this invocation, keyed by the digest of the
/// Dockerfile contents and build arguments. Volumes and env are run
/// settings and take no part in the key.
#[derive(Default)]
pub struct ImageCache {
    built: RefCell<HashMap<String, String>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_built(
        &self,
        runner_name: &str,
        container: &ContainerRunner,
        recipe_dir: &Path,
        sys: Sys<'_>,
    ) -> Result<String, Error> {
        let dockerfile = absolute(&container.dockerfile, recipe_dir);

        let contents = sys
            .fs
            .read_to_string(&dockerfile)
            .map_err(|source| Error::DockerfileRead {
                path: dockerfile.clone(),
                source,
            })?;

        let digest = image_digest(&contents, container);

        if let Some(tag) = self.built.borrow().get(&digest) {
            return Ok(tag.clone());
        }

        let tag = format!("tasktree/{}", &digest[..12]);

        let mut args = vec![
            "build".to_owned(),
            "-f".to_owned(),
            dockerfile.display().to_string(),
            "-t".to_owned(),
            tag.clone(),
        ];

        for (key, value) in &container.build_args {
            args.push("--build-arg".to_owned());
            args.push(format!("{key}={value}"));
        }

        args.push(absolute(&container.context, recipe_dir).display().to_string());

        let request = SpawnRequest {
            program: "docker".into(),
            args,
            current_dir: Some(recipe_dir.to_path_buf()),
            env: sys.env.vars(),
            stdout: StdioPolicy::Stream,
            stderr: StdioPolicy::Stream,
        };

        let output = sys.spawner.spawn(&request).map_err(Error::Spawn)?;

        if !output.success() {
            return Err(Error::BuildFailed {
                runner: runner_name.to_owned(),
                code: output.code,
            });
        }

        self.built.borrow_mut().insert(digest, tag.clone());

        Ok(tag)
    }
}

fn image_digest(dockerfile_contents: &str, container: &ContainerRunner) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dockerfile_contents.as_bytes());

    let mut build_args = container
        .build_args
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>();
    build_args.sort();

    for arg in build_args {
        hasher.update([0]);
        hasher.update(arg.as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Everything needed to spawn one task command inside a container
pub struct ContainerLaunch<'a> {
    pub runner_name: &'a str,
    pub container: &'a ContainerRunner,
    pub image: String,
    pub state_file: &'a Path,
    pub project_root: &'a Path,
    pub script: &'a Path,
    pub working_dir: &'a Path,
    /// `TT_*` variables and exported arguments; the definition's own
    /// `env` is applied first
    pub env: Vec<(String, String)>,
}

/// Assemble the `docker run` request for a container node. The state
/// file is bind-mounted read-write at its reserved path and the
/// project root is mounted at the same absolute path it has on the
/// host so relative task paths keep working.
pub fn container_request(launch: &ContainerLaunch<'_>, sys: Sys<'_>) -> Result<SpawnRequest, Error> {
    let reserved = [Path::new(CONTAINER_STATE_PATH), Path::new(CONTAINER_SCRIPT_PATH)];

    for bind in &launch.container.volumes {
        if reserved.contains(&bind.guest.as_path()) {
            return Err(Error::ReservedVolumePath {
                runner: launch.runner_name.to_owned(),
                path: bind.guest.clone(),
            });
        }
    }

    let mut args = vec!["run".to_owned(), "--rm".to_owned()];

    let mut bind = |host: &Path, guest: &str, read_only: bool| {
        let suffix = if read_only { ":ro" } else { "" };
        args.push("-v".to_owned());
        args.push(format!("{}:{guest}{suffix}", host.display()));
    };

    bind(launch.state_file, CONTAINER_STATE_PATH, false);
    bind(launch.script, CONTAINER_SCRIPT_PATH, true);
    bind(launch.project_root, &launch.project_root.display().to_string(), false);

    for volume in &launch.container.volumes {
        let suffix = if volume.read_only { ":ro" } else { "" };
        args.push("-v".to_owned());
        args.push(format!(
            "{}:{}{suffix}",
            volume.host.display(),
            volume.guest.display()
        ));
    }

    for port in &launch.container.ports {
        args.push("-p".to_owned());
        args.push(format!("{}:{}", port.host, port.guest));
    }

    for (key, value) in &launch.container.env {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }

    for (key, value) in &launch.env {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }

    args.push("-w".to_owned());
    args.push(launch.working_dir.display().to_string());

    #[cfg(unix)]
    if !launch.container.run_as_root {
        let (uid, gid) = crate::util::host_user();
        args.push("--user".to_owned());
        args.push(format!("{uid}:{gid}"));
    }

    args.push(launch.image.clone());
    args.push("/bin/sh".to_owned());
    args.push(CONTAINER_SCRIPT_PATH.to_owned());

    Ok(SpawnRequest {
        program: "docker".into(),
        args,
        current_dir: Some(launch.project_root.to_path_buf()),
        env: sys.env.vars(),
        stdout: StdioPolicy::Stream,
        stderr: StdioPolicy::Stream,
    })
}

fn absolute(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown runner `{0}`, declare it under `runners`")]
    UnknownRunner(String),
    #[error("read dockerfile {path:?}")]
    DockerfileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("image build for runner `{runner}` failed with {code:?}")]
    BuildFailed { runner: String, code: Option<i32> },
    #[error("runner `{runner}` binds the reserved path {path:?}, pick another mount point")]
    ReservedVolumePath { runner: String, path: PathBuf },
    #[error("spawn docker")]
    Spawn(#[source] io::Error),
}
