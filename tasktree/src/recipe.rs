// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use indexmap::IndexMap;
use itertools::Itertools;
use thiserror::Error;
use tt_recipe::{arg, ArgKind, ArgSpec, DepInvocation, IoEntry, OutputPolicy, Runner};

use crate::{
    sys::Sys,
    template::{self, Builtins},
};

mod variables;

/// Recipe file names searched for, in priority order, in the working
/// directory and each ancestor
const CANDIDATES: [&str; 3] = ["tasktree.yaml", "tasktree.yml", "tt.yaml"];

/// A fully resolved recipe: imports executed, variables evaluated,
/// argument specs normalised. Immutable for the rest of the invocation.
#[derive(Debug)]
pub struct Recipe {
    pub tasks: IndexMap<String, Task>,
    pub runners: IndexMap<String, Runner>,
    pub variables: IndexMap<String, String>,
    pub path: PathBuf,
    pub project_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    /// Import namespace the task arrived through, if any
    pub namespace: Option<String>,
    /// Directory of the document that declared the task; relative
    /// paths and `tt.recipe_dir` resolve against it
    pub recipe_dir: PathBuf,
    pub description: Option<String>,
    pub deps: Vec<DepInvocation>,
    pub inputs: Vec<IoEntry>,
    pub outputs: Vec<IoEntry>,
    pub working_dir: Option<String>,
    pub runner: Option<String>,
    pub pin_runner: bool,
    /// Import-site `run_in` override, ignored for pinned tasks
    pub run_in: Option<String>,
    pub args: Vec<Arg>,
    pub cmd: String,
    pub private: bool,
    pub task_output: OutputPolicy,
}

/// An argument spec with its effective type resolved
#[derive(Debug, Clone)]
pub struct Arg {
    pub spec: ArgSpec,
    pub kind: ArgKind,
}

impl Recipe {
    pub fn load(path: &Path, sys: Sys<'_>) -> Result<Self, Error> {
        let path = normalize(path);
        let project_root = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::NotFound { start: path.clone() })?;

        let mut loader = Loader {
            sys,
            project_root: project_root.clone(),
            stack: vec![],
        };

        let loaded = loader.load_document(&path)?;

        let recipe = Self {
            tasks: loaded.tasks,
            runners: loaded.runners,
            variables: loaded.variables,
            path,
            project_root,
        };

        recipe.check_runner_references()?;

        Ok(recipe)
    }

    fn check_runner_references(&self) -> Result<(), Error> {
        for task in self.tasks.values() {
            for name in [task.runner.as_deref(), task.run_in.as_deref()]
                .into_iter()
                .flatten()
            {
                if !self.runners.contains_key(name) {
                    return Err(Error::UnknownRunner {
                        name: name.to_owned(),
                        task: task.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Locate the recipe governing `start`, walking up through its
/// ancestors. `*.tasks` files are a fallback and it is an error for a
/// directory to contain more than one.
pub fn discover(start: &Path, sys: Sys<'_>) -> Result<PathBuf, Error> {
    for dir in start.ancestors() {
        for name in CANDIDATES {
            let candidate = dir.join(name);
            if sys.fs.exists(&candidate) {
                return Ok(candidate);
            }
        }

        let pattern = format!("{}/*.tasks", glob::Pattern::escape(&dir.to_string_lossy()));
        let mut matches = sys.fs.glob(&pattern).unwrap_or_default();
        matches.sort();

        match matches.len() {
            0 => {}
            1 => return Ok(matches.remove(0)),
            _ => {
                return Err(Error::Ambiguous {
                    dir: dir.to_path_buf(),
                    matches,
                })
            }
        }
    }

    Err(Error::NotFound {
        start: start.to_path_buf(),
    })
}

struct Loader<'a> {
    sys: Sys<'a>,
    project_root: PathBuf,
    stack: Vec<PathBuf>,
}

#[derive(Default)]
struct Loaded {
    tasks: IndexMap<String, Task>,
    runners: IndexMap<String, Runner>,
    variables: IndexMap<String, String>,
}

impl Loader<'_> {
    fn load_document(&mut self, path: &Path) -> Result<Loaded, Error> {
        let path = normalize(path);

        if self.stack.contains(&path) {
            let mut trace = self
                .stack
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>();
            trace.push(path.display().to_string());

            return Err(Error::ImportCycle { trace });
        }

        self.stack.push(path.clone());

        let source = self
            .sys
            .fs
            .read_to_string(&path)
            .map_err(|source| Error::Load {
                path: path.clone(),
                source,
            })?;

        let document = tt_recipe::from_str(&source).map_err(|source| Error::Parse {
            path: path.clone(),
            source,
        })?;

        let dir = path.parent().expect("recipe file has a parent").to_path_buf();

        let mut loaded = Loaded::default();

        // Imports first so their namespaced variables and runners are
        // in scope for this document
        for import in document.imports {
            validate_name(&import.namespace).map_err(|name| Error::InvalidNamespace {
                name,
                path: path.clone(),
            })?;

            let child = self.load_document(&dir.join(&import.file))?;
            merge_namespaced(&mut loaded, child, &import.namespace, import.run_in.as_deref());
        }

        let builtins = Builtins::capture(
            self.project_root.display(),
            dir.display(),
            self.sys.clock,
            self.sys.env,
        );

        // Top to bottom; each declaration sees only what came before it
        for (name, decl) in document.variables {
            let value =
                variables::resolve(&name, &decl, &loaded.variables, &dir, &builtins, self.sys)?;
            loaded.variables.insert(name, value);
        }

        for (name, runner) in document.runners {
            loaded.runners.insert(name, runner);
        }

        for (name, task) in document.tasks {
            validate_name(&name).map_err(|name| Error::InvalidTaskName {
                name,
                path: path.clone(),
            })?;

            let args = task
                .args
                .into_iter()
                .map(|spec| {
                    let kind = spec.resolve_kind().map_err(|source| Error::InvalidArgSpec {
                        task: name.clone(),
                        arg: spec.name.clone(),
                        source,
                    })?;
                    Ok(Arg { spec, kind })
                })
                .collect::<Result<Vec<_>, Error>>()?;

            loaded.tasks.insert(
                name.clone(),
                Task {
                    name,
                    namespace: None,
                    recipe_dir: dir.clone(),
                    description: task.description,
                    deps: task.deps,
                    inputs: task.inputs,
                    outputs: task.outputs,
                    working_dir: task.working_dir,
                    runner: task.runner,
                    pin_runner: task.pin_runner,
                    run_in: None,
                    args,
                    cmd: task.cmd,
                    private: task.private,
                    task_output: task.task_output,
                },
            );
        }

        self.stack.pop();

        Ok(loaded)
    }
}

/// Fold an imported document into its parent under `ns.`. Dependency
/// and runner references inside the import move with it; a `run_in`
/// given at the import site applies to every task that doesn't already
/// carry a deeper one.
fn merge_namespaced(parent: &mut Loaded, child: Loaded, ns: &str, run_in: Option<&str>) {
    for (name, mut task) in child.tasks {
        let qualified = format!("{ns}.{name}");

        task.name = qualified.clone();
        task.namespace = Some(match task.namespace.take() {
            Some(inner) => format!("{ns}.{inner}"),
            None => ns.to_owned(),
        });

        for dep in &mut task.deps {
            dep.task = format!("{ns}.{}", dep.task);
        }

        if let Some(runner) = &mut task.runner {
            *runner = format!("{ns}.{runner}");
        }

        match &mut task.run_in {
            // A deeper import site already decided; requalify its
            // runner into our scope
            Some(existing) => *existing = format!("{ns}.{existing}"),
            None => task.run_in = run_in.map(str::to_owned),
        }

        parent.tasks.insert(qualified, task);
    }

    for (name, runner) in child.runners {
        parent.runners.insert(format!("{ns}.{name}"), runner);
    }

    for (name, value) in child.variables {
        parent.variables.insert(format!("{ns}.{name}"), value);
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(name.to_owned())
    }
}

/// Lexical normalisation, good enough to catch import cycles without
/// touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir);
                }
            }
            other => normalized.push(other),
        }
    }

    normalized
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "no recipe found from {start:?} upward, create one of tasktree.yaml, tasktree.yml or tt.yaml"
    )]
    NotFound { start: PathBuf },
    #[error(
        "multiple task files in {dir:?} ({}), keep exactly one",
        matches.iter().map(|m| m.display()).join(", ")
    )]
    Ambiguous { dir: PathBuf, matches: Vec<PathBuf> },
    #[error("load recipe {path:?}")]
    Load {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse recipe {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("import cycle: {}, break the ring by removing one import", trace.join(" → "))]
    ImportCycle { trace: Vec<String> },
    #[error("invalid task name `{name}` in {path:?}, use letters, digits, `_` or `-`")]
    InvalidTaskName { name: String, path: PathBuf },
    #[error("invalid import namespace `{name}` in {path:?}, use letters, digits, `_` or `-`")]
    InvalidNamespace { name: String, path: PathBuf },
    #[error("task `{task}`, argument `{arg}`: {source}")]
    InvalidArgSpec {
        task: String,
        arg: String,
        #[source]
        source: arg::Error,
    },
    #[error("task `{task}` references unknown runner `{name}`, declare it under `runners`")]
    UnknownRunner { name: String, task: String },
    #[error("variable `{name}`: environment variable `{env}` is not set and has no default")]
    VariableNotSet { name: String, env: String },
    #[error("variable `{name}`: read {path:?}")]
    VariableReadFailed {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("variable `{name}`: `{command}` failed ({detail})")]
    VariableEvalFailed {
        name: String,
        command: String,
        detail: String,
    },
    #[error(transparent)]
    Template(#[from] template::Error),
}

#[cfg(test)]
mod test {
    use crate::sys::testing::{FakeClock, FakeEnvironment, FakeFileSystem, FakeSpawner};
    use crate::sys::SpawnOutput;

    use super::*;

    struct Fixture {
        clock: FakeClock,
        env: FakeEnvironment,
        fs: FakeFileSystem,
        spawner: FakeSpawner,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                clock: FakeClock::at(1_700_000_000),
                env: FakeEnvironment::with([("HOME", "/home/ikey"), ("USER", "ikey")]),
                fs: FakeFileSystem::new(),
                spawner: FakeSpawner::ok(),
            }
        }

        fn sys(&self) -> Sys<'_> {
            Sys {
                clock: &self.clock,
                env: &self.env,
                fs: &self.fs,
                spawner: &self.spawner,
            }
        }
    }

    #[test]
    fn discovery_walks_ancestors_in_priority_order() {
        let fixture = Fixture::new();
        fixture.fs.add("/work/proj/tasktree.yaml", "tasks: {}", 0);
        fixture.fs.add("/work/proj/sub/tt.yaml", "tasks: {}", 0);

        // The nested recipe wins from inside its own directory
        assert_eq!(
            discover(Path::new("/work/proj/sub"), fixture.sys()).unwrap(),
            PathBuf::from("/work/proj/sub/tt.yaml")
        );
        // Above it, the project one is found
        assert_eq!(
            discover(Path::new("/work/proj"), fixture.sys()).unwrap(),
            PathBuf::from("/work/proj/tasktree.yaml")
        );
    }

    #[test]
    fn discovery_rejects_ambiguous_fallbacks() {
        let fixture = Fixture::new();
        fixture.fs.add("/work/a.tasks", "tasks: {}", 0);
        fixture.fs.add("/work/b.tasks", "tasks: {}", 0);

        assert!(matches!(
            discover(Path::new("/work"), fixture.sys()),
            Err(Error::Ambiguous { .. })
        ));
    }

    #[test]
    fn discovery_accepts_single_fallback() {
        let fixture = Fixture::new();
        fixture.fs.add("/work/build.tasks", "tasks: {}", 0);

        assert_eq!(
            discover(Path::new("/work"), fixture.sys()).unwrap(),
            PathBuf::from("/work/build.tasks")
        );
    }

    #[test]
    fn imports_are_namespaced() {
        let fixture = Fixture::new();
        fixture.fs.add(
            "/proj/tasktree.yaml",
            r#"
imports:
  - file: common/tasks.yaml
    as: common
runners:
  sandbox: {shell: /bin/bash}
tasks:
  build:
    deps: [common.lint]
    cmd: make
"#,
            0,
        );
        fixture.fs.add(
            "/proj/common/tasks.yaml",
            r#"
variables:
  strictness: high
runners:
  checker: {shell: /bin/sh}
tasks:
  lint:
    runner: checker
    cmd: lint --level {{ var.strictness }}
"#,
            0,
        );

        let recipe = Recipe::load(Path::new("/proj/tasktree.yaml"), fixture.sys()).unwrap();

        let lint = recipe.tasks.get("common.lint").unwrap();
        assert_eq!(lint.namespace.as_deref(), Some("common"));
        assert_eq!(lint.runner.as_deref(), Some("common.checker"));
        assert_eq!(lint.recipe_dir, PathBuf::from("/proj/common"));

        assert!(recipe.runners.contains_key("common.checker"));
        assert_eq!(recipe.variables.get("common.strictness").map(String::as_str), Some("high"));
        assert_eq!(recipe.tasks.get("build").unwrap().deps[0].task, "common.lint");
    }

    #[test]
    fn run_in_applies_to_unpinned_imports() {
        let fixture = Fixture::new();
        fixture.fs.add(
            "/proj/tasktree.yaml",
            r#"
imports:
  - file: common.yaml
    as: common
    run_in: sandbox
runners:
  sandbox: {shell: /bin/bash}
tasks: {}
"#,
            0,
        );
        fixture.fs.add(
            "/proj/common.yaml",
            r#"
runners:
  own: {shell: /bin/sh}
tasks:
  lint:
    runner: own
    cmd: lint
  fixed:
    runner: own
    pin_runner: true
    cmd: check
"#,
            0,
        );

        let recipe = Recipe::load(Path::new("/proj/tasktree.yaml"), fixture.sys()).unwrap();

        assert_eq!(recipe.tasks["common.lint"].run_in.as_deref(), Some("sandbox"));
        // Pinned tasks carry the override too; resolution ignores it
        assert!(recipe.tasks["common.fixed"].pin_runner);
    }

    #[test]
    fn import_cycles_are_traced() {
        let fixture = Fixture::new();
        fixture.fs.add(
            "/proj/tasktree.yaml",
            "imports:\n  - {file: other.yaml, as: other}\ntasks: {}\n",
            0,
        );
        fixture.fs.add(
            "/proj/other.yaml",
            "imports:\n  - {file: tasktree.yaml, as: root}\ntasks: {}\n",
            0,
        );

        let Err(Error::ImportCycle { trace }) =
            Recipe::load(Path::new("/proj/tasktree.yaml"), fixture.sys())
        else {
            panic!("expected import cycle");
        };

        assert_eq!(trace.first(), trace.last());
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn variables_resolve_in_order() {
        let fixture = Fixture::new();
        fixture.env.set("GIT_SHA", "abc123");
        fixture.fs.add("/proj/NOTES", "release notes\n", 0);
        fixture.fs.add(
            "/proj/tasktree.yaml",
            r#"
variables:
  version: "2.0"
  revision: {env: GIT_SHA, default: unknown}
  notes: {read: NOTES}
  tag: "v{{ var.version }}-{{ var.revision }}"
tasks: {}
"#,
            0,
        );

        let recipe = Recipe::load(Path::new("/proj/tasktree.yaml"), fixture.sys()).unwrap();

        assert_eq!(recipe.variables["revision"], "abc123");
        assert_eq!(recipe.variables["notes"], "release notes");
        assert_eq!(recipe.variables["tag"], "v2.0-abc123");
    }

    #[test]
    fn forward_variable_reference_fails() {
        let fixture = Fixture::new();
        fixture.fs.add(
            "/proj/tasktree.yaml",
            "variables:\n  a: \"{{ var.b }}\"\n  b: two\ntasks: {}\n",
            0,
        );

        assert!(matches!(
            Recipe::load(Path::new("/proj/tasktree.yaml"), fixture.sys()),
            Err(Error::Template(template::Error::UndefinedVariable { .. }))
        ));
    }

    #[test]
    fn eval_variable_runs_on_host_in_recipe_dir() {
        let fixture = Fixture::new();
        let spawner = FakeSpawner::with(|request| {
            assert_eq!(request.current_dir.as_deref(), Some(Path::new("/proj")));
            Ok(SpawnOutput {
                code: Some(0),
                stdout: b"main\n".to_vec(),
                ..Default::default()
            })
        });
        fixture.fs.add(
            "/proj/tasktree.yaml",
            "variables:\n  branch: {eval: git rev-parse --abbrev-ref HEAD}\ntasks: {}\n",
            0,
        );

        let sys = Sys {
            clock: &fixture.clock,
            env: &fixture.env,
            fs: &fixture.fs,
            spawner: &spawner,
        };

        let recipe = Recipe::load(Path::new("/proj/tasktree.yaml"), sys).unwrap();
        assert_eq!(recipe.variables["branch"], "main");
    }

    #[test]
    fn failing_eval_variable_is_fatal() {
        let fixture = Fixture::new();
        let spawner = FakeSpawner::with(|_| {
            Ok(SpawnOutput {
                code: Some(128),
                stderr: b"fatal: not a git repository\n".to_vec(),
                ..Default::default()
            })
        });
        fixture.fs.add(
            "/proj/tasktree.yaml",
            "variables:\n  branch: {eval: git rev-parse HEAD}\ntasks: {}\n",
            0,
        );

        let sys = Sys {
            clock: &fixture.clock,
            env: &fixture.env,
            fs: &fixture.fs,
            spawner: &spawner,
        };

        assert!(matches!(
            Recipe::load(Path::new("/proj/tasktree.yaml"), sys),
            Err(Error::VariableEvalFailed { .. })
        ));
    }

    #[test]
    fn missing_env_variable_is_fatal() {
        let fixture = Fixture::new();
        fixture.fs.add(
            "/proj/tasktree.yaml",
            "variables:\n  sha: {env: DEFINITELY_NOT_SET}\ntasks: {}\n",
            0,
        );

        assert!(matches!(
            Recipe::load(Path::new("/proj/tasktree.yaml"), fixture.sys()),
            Err(Error::VariableNotSet { .. })
        ));
    }

    #[test]
    fn dotted_task_names_rejected() {
        let fixture = Fixture::new();
        fixture.fs.add(
            "/proj/tasktree.yaml",
            "tasks:\n  bad.name:\n    cmd: true\n",
            0,
        );

        assert!(matches!(
            Recipe::load(Path::new("/proj/tasktree.yaml"), fixture.sys()),
            Err(Error::InvalidTaskName { .. })
        ));
    }

    #[test]
    fn unknown_runner_reference_rejected() {
        let fixture = Fixture::new();
        fixture.fs.add(
            "/proj/tasktree.yaml",
            "tasks:\n  build:\n    runner: nope\n    cmd: true\n",
            0,
        );

        assert!(matches!(
            Recipe::load(Path::new("/proj/tasktree.yaml"), fixture.sys()),
            Err(Error::UnknownRunner { .. })
        ));
    }
}
