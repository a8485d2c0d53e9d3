// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Drives stale nodes in topological order, one at a time: runner
//! resolution, recursion guarding, script materialisation, spawn,
//! then the read-modify-write of the state file.

use std::{
    cell::Cell,
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use log::{debug, info};
use thiserror::Error;
use tt_recipe::{ContainerRunner, IoEntry, OutputPolicy, Runner as Definition, ShellRunner};

use crate::{
    freshness,
    graph::{Node, Plan, PlanNode},
    recipe::{Recipe, Task},
    runner::{self, ContainerLaunch, ImageCache, CONTAINER_STATE_PATH},
    state::{Entry, State},
    sys::{SpawnRequest, StdioPolicy, Sys},
    template::{self, Builtins, Scope},
};

/// Name of the variable carrying the names of every node currently
/// executing across nested `tt` processes
pub const CALL_CHAIN_ENV: &str = "TT_CALL_CHAIN";

/// Set inside a container runner to the runner's name
pub const CONTAINERIZED_ENV: &str = "TT_CONTAINERIZED_RUNNER";

/// Where the current process should read and write execution state
pub const STATE_FILE_ENV: &str = "TT_STATE_FILE_PATH";

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub force: bool,
    pub runner: Option<String>,
    pub task_output: Option<OutputPolicy>,
}

/// What an invocation did, for the final summary line
#[derive(Debug, Default)]
pub struct Outcome {
    pub executed: Vec<String>,
    pub fresh: usize,
}

pub struct Driver<'a> {
    recipe: &'a Recipe,
    plan: &'a Plan,
    sys: Sys<'a>,
    options: Options,
    state_path: PathBuf,
    config_defaults: Option<runner::Defaults>,
    images: ImageCache,
    script_seq: Cell<u64>,
}

impl<'a> Driver<'a> {
    pub fn new(
        recipe: &'a Recipe,
        plan: &'a Plan,
        sys: Sys<'a>,
        options: Options,
        state_path: PathBuf,
        config_defaults: Option<runner::Defaults>,
    ) -> Self {
        Self {
            recipe,
            plan,
            sys,
            options,
            state_path,
            config_defaults,
            images: ImageCache::new(),
            script_seq: Cell::new(0),
        }
    }

    pub fn run(&self) -> Result<Outcome, Error> {
        let mut state = State::load(self.sys.fs, &self.state_path)?;

        // Definitions that left the recipe take their history with them
        let pruned = state.prune(&self.live_definitions());
        if pruned > 0 {
            debug!("pruned {pruned} state entries with no matching definition");
            state.save(self.sys.fs, &self.state_path)?;
        }

        let outer_chain = self
            .sys
            .env
            .get(CALL_CHAIN_ENV)
            .map(|value| value.split(',').map(str::to_owned).collect::<Vec<_>>())
            .unwrap_or_default();

        let mut executed = HashSet::new();
        let mut outcome = Outcome::default();

        // Resolve runners and hash every scheduled node first, so a
        // broken definition is reported before anything runs
        let keys = self
            .plan
            .nodes
            .iter()
            .map(|plan_node| {
                let task = &self.recipe.tasks[&plan_node.node.task];

                let resolved = runner::resolve(
                    self.options.runner.as_deref(),
                    task,
                    self.recipe,
                    self.config_defaults.as_ref(),
                )?;

                let def_hash = freshness::definition_hash(task, &resolved, self.recipe)?;
                let arg_hash = freshness::arg_binding_hash(&plan_node.node.args);

                Ok((resolved, def_hash, arg_hash))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        for (plan_node, (resolved, def_hash, arg_hash)) in self.plan.nodes.iter().zip(keys) {
            let node = &plan_node.node;
            let task = &self.recipe.tasks[&node.task];

            let context = format!("task `{}`", task.name);
            let working_dir = self.resolve_working_dir(task, node, &context)?;
            let builtins = self.node_builtins(task).for_task(&task.name, working_dir.display());

            let input_scope = Scope::new(&context)
                .with_vars(&self.recipe.variables)
                .with_namespace(task.namespace.as_deref())
                .with_args(&node.args)
                .with_env(self.sys.env)
                .with_builtins(&builtins);

            let current_inputs = freshness::expand_inputs(
                &plan_node.effective_inputs,
                &input_scope,
                &working_dir,
                self.sys.fs,
            )?;

            let has_artefacts = !plan_node.effective_inputs.is_empty() || !task.outputs.is_empty();
            let dep_executed = plan_node.deps.iter().any(|dep| executed.contains(dep));

            let freshness = freshness::classify(
                state.get(&def_hash, &arg_hash),
                &current_inputs,
                has_artefacts,
                dep_executed,
                self.options.force,
            );

            let label = node.label();

            match freshness {
                freshness::Freshness::Fresh => {
                    info!("{label}: fresh, skipping");
                    outcome.fresh += 1;
                    continue;
                }
                freshness::Freshness::Stale(reason) => {
                    info!("{label}: running ({reason})");
                }
            }

            self.execute(plan_node, task, &resolved, &outer_chain, &builtins, &working_dir)?;

            // The state file may have been rewritten by a nested
            // invocation while our command ran; fold our update into
            // whatever is on disk now
            state = State::load(self.sys.fs, &self.state_path)?;

            let inputs_after = freshness::expand_inputs(
                &plan_node.effective_inputs,
                &input_scope,
                &working_dir,
                self.sys.fs,
            )?;

            state.upsert(Entry {
                def_hash,
                arg_hash,
                last_run_unix: self.sys.clock.now_unix(),
                inputs: inputs_after,
                extra: Default::default(),
            });
            state.save(self.sys.fs, &self.state_path)?;

            executed.insert(node.clone());
            outcome.executed.push(label);
        }

        Ok(outcome)
    }

    /// Definition hashes of every task in the recipe, resolved without
    /// the CLI runner override so a one-off override doesn't evict
    /// regular history
    fn live_definitions(&self) -> HashSet<String> {
        self.recipe
            .tasks
            .values()
            .filter_map(|task| {
                let resolved =
                    runner::resolve(None, task, self.recipe, self.config_defaults.as_ref()).ok()?;
                freshness::definition_hash(task, &resolved, self.recipe).ok()
            })
            .collect()
    }

    fn node_builtins(&self, task: &Task) -> Builtins {
        Builtins {
            recipe_dir: task.recipe_dir.display().to_string(),
            ..Builtins::capture(
                self.recipe.project_root.display(),
                task.recipe_dir.display(),
                self.sys.clock,
                self.sys.env,
            )
        }
    }

    fn resolve_working_dir(&self, task: &Task, node: &Node, context: &str) -> Result<PathBuf, Error> {
        let Some(working_dir) = &task.working_dir else {
            return Ok(task.recipe_dir.clone());
        };

        let builtins = self.node_builtins(task).for_task(&task.name, task.recipe_dir.display());
        let scope = Scope::new(context)
            .with_vars(&self.recipe.variables)
            .with_namespace(task.namespace.as_deref())
            .with_args(&node.args)
            .with_env(self.sys.env)
            .with_builtins(&builtins);

        let expanded = template::substitute(working_dir, &scope)?;
        let path = PathBuf::from(expanded);

        Ok(if path.is_absolute() {
            path
        } else {
            task.recipe_dir.join(path)
        })
    }

    fn execute(
        &self,
        plan_node: &PlanNode,
        task: &Task,
        resolved: &runner::Resolved,
        outer_chain: &[String],
        builtins: &Builtins,
        working_dir: &Path,
    ) -> Result<(), Error> {
        // The guard happens before this node joins the chain
        if outer_chain.iter().any(|name| name == &task.name) {
            let mut chain = outer_chain.to_vec();
            chain.push(task.name.clone());
            return Err(Error::RecursionDetected { chain });
        }

        let chain_value = outer_chain
            .iter()
            .map(String::as_str)
            .chain([task.name.as_str()])
            .join(",");

        let mode = self.pick_mode(task, resolved)?;

        // Globs referenced through `self.*` see variables resolved;
        // any arg/env/tt tokens left inside them resolve in the final
        // substitution pass
        let context = format!("task `{}`", task.name);
        let var_scope = Scope::new(&context)
            .with_vars(&self.recipe.variables)
            .with_namespace(task.namespace.as_deref());

        let self_inputs = expand_entry_vars(&task.inputs, &var_scope)?;
        let self_outputs = expand_entry_vars(&task.outputs, &var_scope)?;

        let scope = Scope::new(&context)
            .with_vars(&self.recipe.variables)
            .with_namespace(task.namespace.as_deref())
            .with_args(&plan_node.node.args)
            .with_env(self.sys.env)
            .with_builtins(builtins)
            .with_deps(&plan_node.dep_outputs)
            .with_io(&self_inputs, &self_outputs);

        let cmd = template::substitute(&task.cmd, &scope)?;

        let script = self.materialise_script(task, &mode, &cmd)?;
        let _guard = ScriptGuard {
            fs: self.sys.fs,
            path: script.clone(),
        };

        let exported = task
            .args
            .iter()
            .filter(|arg| arg.spec.exported())
            .map(|arg| {
                (
                    arg.spec.key().to_owned(),
                    plan_node.node.args[&arg.spec.name].clone(),
                )
            })
            .collect::<Vec<_>>();

        let policy = self.options.task_output.unwrap_or(task.task_output);
        let (stdout, stderr) = match policy {
            OutputPolicy::All => (StdioPolicy::Stream, StdioPolicy::Stream),
            OutputPolicy::Out => (StdioPolicy::Stream, StdioPolicy::Discard),
            OutputPolicy::Err => (StdioPolicy::Discard, StdioPolicy::Stream),
            OutputPolicy::OnErr => (StdioPolicy::Discard, StdioPolicy::Capture),
            OutputPolicy::None => (StdioPolicy::Discard, StdioPolicy::Discard),
        };

        let mut request = match &mode {
            Mode::Local { shell, env, .. } => {
                let mut child_env = self.sys.env.vars();
                child_env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
                child_env.extend(exported);
                child_env.push((CALL_CHAIN_ENV.to_owned(), chain_value.clone()));
                child_env.push((
                    STATE_FILE_ENV.to_owned(),
                    self.state_path.display().to_string(),
                ));

                SpawnRequest {
                    program: shell.clone(),
                    args: vec![script.display().to_string()],
                    current_dir: Some(working_dir.to_path_buf()),
                    env: child_env,
                    stdout,
                    stderr,
                }
            }
            Mode::Container(container) => {
                let image = self.images.ensure_built(
                    &resolved.name,
                    container,
                    &task.recipe_dir,
                    self.sys,
                )?;

                let mut container_env = vec![
                    (CALL_CHAIN_ENV.to_owned(), chain_value.clone()),
                    (CONTAINERIZED_ENV.to_owned(), resolved.name.clone()),
                    (STATE_FILE_ENV.to_owned(), CONTAINER_STATE_PATH.to_owned()),
                ];
                container_env.extend(exported);

                let container_working_dir = container
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| working_dir.to_path_buf());

                let mut request = runner::container_request(
                    &ContainerLaunch {
                        runner_name: &resolved.name,
                        container,
                        image,
                        state_file: &self.state_path,
                        project_root: &self.recipe.project_root,
                        script: &script,
                        working_dir: &container_working_dir,
                        env: container_env,
                    },
                    self.sys,
                )?;

                request.stdout = stdout;
                request.stderr = stderr;
                request
            }
        };

        // Later additions override the inherited environment
        let env = request.env.drain(..).collect::<std::collections::BTreeMap<_, _>>();
        request.env = env.into_iter().collect();

        let output = self
            .sys
            .spawner
            .spawn(&request)
            .map_err(|source| Error::SpawnFailed {
                task: task.name.clone(),
                source,
            })?;

        if !output.success() {
            if policy == OutputPolicy::OnErr && !output.stderr.is_empty() {
                eprint!("{}", String::from_utf8_lossy(&output.stderr));
            }

            return Err(Error::TaskFailed {
                task: task.name.clone(),
                code: output.code,
            });
        }

        Ok(())
    }

    /// Apply the nested-runner policy: inside a container, the same
    /// container runner degrades to a direct shell, a different one is
    /// refused, and shell runners run as-is.
    fn pick_mode(&self, task: &Task, resolved: &runner::Resolved) -> Result<Mode, Error> {
        let inside = self.sys.env.get(CONTAINERIZED_ENV);

        match (&resolved.definition, inside) {
            (Definition::Shell(ShellRunner { shell, preamble }), _) => Ok(Mode::Local {
                shell: shell.clone(),
                preamble: preamble.clone(),
                env: vec![],
            }),
            (Definition::Container(container), Some(current)) => {
                if current == resolved.name {
                    // Already in this very container, run directly
                    Ok(Mode::Local {
                        shell: "/bin/sh".into(),
                        preamble: String::new(),
                        env: container
                            .env
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    })
                } else {
                    Err(Error::NestedContainerSwitch {
                        task: task.name.clone(),
                        current,
                        requested: resolved.name.clone(),
                    })
                }
            }
            (Definition::Container(container), None) => Ok(Mode::Container(container.clone())),
        }
    }

    fn materialise_script(&self, task: &Task, mode: &Mode, cmd: &str) -> Result<PathBuf, Error> {
        let extension = match mode {
            Mode::Local { shell, .. } => script_extension(shell),
            Mode::Container(_) => "sh",
        };

        let preamble = match mode {
            Mode::Local { preamble, .. } => preamble.clone(),
            Mode::Container(_) => String::new(),
        };

        let seq = self.script_seq.get();
        self.script_seq.set(seq + 1);

        let path = self.sys.fs.temp_dir().join(format!(
            "tt-{}-{seq}.{extension}",
            std::process::id()
        ));

        let mut contents = String::new();
        if !preamble.is_empty() {
            contents.push_str(&preamble);
            contents.push('\n');
        }
        contents.push_str(cmd);
        contents.push('\n');

        self.sys
            .fs
            .write(&path, &contents)
            .and_then(|()| self.sys.fs.make_executable(&path))
            .map_err(|source| Error::ScriptWrite {
                task: task.name.clone(),
                path: path.clone(),
                source,
            })?;

        Ok(path)
    }
}

enum Mode {
    Local {
        shell: PathBuf,
        preamble: String,
        /// Extra environment from the runner definition
        env: Vec<(String, String)>,
    },
    Container(ContainerRunner),
}

fn script_extension(shell: &Path) -> &'static str {
    let name = shell
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();

    match name {
        "cmd" => "bat",
        "powershell" | "pwsh" => "ps1",
        _ => "sh",
    }
}

fn expand_entry_vars(entries: &[IoEntry], scope: &Scope<'_>) -> Result<Vec<IoEntry>, template::Error> {
    entries
        .iter()
        .map(|entry| {
            Ok(IoEntry {
                name: entry.name.clone(),
                glob: template::substitute_vars(&entry.glob, scope)?,
            })
        })
        .collect()
}

struct ScriptGuard<'a> {
    fs: &'a dyn crate::sys::FileSystem,
    path: PathBuf,
}

impl Drop for ScriptGuard<'_> {
    fn drop(&mut self) {
        let _ = self.fs.remove_file(&self.path);
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    State(#[from] crate::state::Error),
    #[error(transparent)]
    Runner(#[from] runner::Error),
    #[error(transparent)]
    Template(#[from] template::Error),
    #[error("task `{task}`: write command script {path:?}")]
    ScriptWrite {
        task: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("task `{task}`: failed to spawn command")]
    SpawnFailed {
        task: String,
        #[source]
        source: io::Error,
    },
    #[error("task `{task}` failed{}", code.map(|c| format!(" with exit code {c}")).unwrap_or_else(|| " on a signal".into()))]
    TaskFailed { task: String, code: Option<i32> },
    #[error("recursion detected: {}, a task may not invoke itself through nested tt calls", chain.join(" → "))]
    RecursionDetected { chain: Vec<String> },
    #[error("task `{task}`: running inside container runner `{current}`, refusing to switch to container runner `{requested}`")]
    NestedContainerSwitch {
        task: String,
        current: String,
        requested: String,
    },
}

impl Error {
    /// The process exit code this failure maps to
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::TaskFailed { code: Some(code), .. } => *code,
            Error::State(_) => 5,
            _ => 4,
        }
    }
}

#[cfg(test)]
mod test {

    use tt_recipe::DepArgs;

    use crate::graph;
    use crate::sys::testing::{FakeClock, FakeEnvironment, FakeFileSystem, FakeSpawner};
    use crate::sys::{FileSystem, SpawnOutput};

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

        fn recipe(&self, source: &str) -> Recipe {
            self.fs.add("/proj/tasktree.yaml", source, 0);
            Recipe::load(std::path::Path::new("/proj/tasktree.yaml"), self.sys()).unwrap()
        }

        fn run(&self, recipe: &Recipe, task: &str) -> Result<Outcome, Error> {
            self.run_with(recipe, task, Options::default())
        }

        fn run_with(&self, recipe: &Recipe, task: &str, options: Options) -> Result<Outcome, Error> {
            let plan = graph::build(recipe, task, &DepArgs::Defaults, self.sys(), false).unwrap();
            let driver = Driver::new(
                recipe,
                &plan,
                self.sys(),
                options,
                PathBuf::from("/proj/.tasktree-state"),
                None,
            );
            driver.run()
        }
    }



    #[test]
    fn incrementality_and_cascade() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/test.txt", "data", 50);
        let recipe = fixture.recipe(
            r#"
tasks:
  build: {cmd: echo hi}
  test:
    deps: [build]
    inputs: [test.txt]
    cmd: ./run
"#,
        );

        // First run executes both
        let outcome = fixture.run(&recipe, "test").unwrap();
        assert_eq!(outcome.executed, vec!["build", "test"]);

        // Nothing touched: build is always stale (no artefacts) and
        // test re-runs because its dependency executed
        let outcome = fixture.run(&recipe, "test").unwrap();
        assert_eq!(outcome.executed, vec!["build", "test"]);
        assert_eq!(fixture.spawner.requests.borrow().len(), 4);
    }

    #[test]
    fn unchanged_inputs_stay_fresh() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/src/main.c", "int main(){}", 50);
        let recipe = fixture.recipe(
            r#"
tasks:
  compile:
    inputs: [src/*.c]
    outputs: [out/app]
    cmd: cc src/main.c
"#,
        );

        assert_eq!(fixture.run(&recipe, "compile").unwrap().executed.len(), 1);

        let second = fixture.run(&recipe, "compile").unwrap();
        assert!(second.executed.is_empty());
        assert_eq!(second.fresh, 1);

        // Touching an input re-runs
        fixture.fs.touch("/proj/src/main.c", 60);
        assert_eq!(fixture.run(&recipe, "compile").unwrap().executed.len(), 1);
    }

    #[test]
    fn renaming_a_task_keeps_its_state() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/data.txt", "x", 10);

        let recipe = fixture.recipe(
            "tasks:\n  test:\n    inputs: [data.txt]\n    outputs: [report]\n    cmd: ./check\n",
        );
        assert_eq!(fixture.run(&recipe, "test").unwrap().executed.len(), 1);

        // Same definition under a new name reads the same entry
        let renamed = fixture.recipe(
            "tasks:\n  check:\n    inputs: [data.txt]\n    outputs: [report]\n    cmd: ./check\n",
        );
        let outcome = fixture.run(&renamed, "check").unwrap();
        assert!(outcome.executed.is_empty());
        assert_eq!(outcome.fresh, 1);
    }

    #[test]
    fn parameterised_nodes_have_separate_state() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/src.c", "x", 10);
        let recipe = fixture.recipe(
            r#"
tasks:
  compile:
    args: [{name: target, choices: [x86, arm], default: x86}]
    inputs: [src.c]
    outputs: ["out-{{ arg.target }}"]
    cmd: cc -target {{ arg.target }}
  all:
    deps:
      - compile: [x86]
      - compile: [arm]
    cmd: "true"
"#,
        );

        let first = fixture.run(&recipe, "all").unwrap();
        assert_eq!(first.executed.len(), 3);

        // One definition, one entry per binding, plus the aggregate
        let state = State::load(&fixture.fs, Path::new("/proj/.tasktree-state")).unwrap();
        assert_eq!(state.entries.len(), 3);
        assert_eq!(
            state.entries.iter().map(|e| &e.def_hash).unique().count(),
            2
        );

        // Nothing changed: no re-execution anywhere. The aggregate
        // inherited its dependencies' outputs as inputs, so it is not
        // trivially stale either.
        let second = fixture.run(&recipe, "all").unwrap();
        assert!(second.executed.is_empty());
        assert_eq!(second.fresh, 3);
    }

    #[test]
    fn self_references_reach_the_script() {
        use std::{cell::RefCell, rc::Rc};

        let clock = FakeClock::at(1_700_000_000);
        let env = FakeEnvironment::with([("HOME", "/home/ikey"), ("USER", "ikey")]);
        let fs = Rc::new(FakeFileSystem::new());
        fs.add(
            "/proj/tasktree.yaml",
            r#"
runners:
  default: {shell: /bin/bash, preamble: set -eu}
tasks:
  copy:
    inputs: [{src: in.txt}]
    outputs: [{dst: out.txt}]
    cmd: cp {{ self.inputs.src }} {{ self.outputs.dst }}
"#,
            0,
        );
        fs.add("/proj/in.txt", "payload", 10);

        // Read the script while it still exists, from inside the spawn
        let script = Rc::new(RefCell::new(String::new()));
        let spawner = {
            let fs = fs.clone();
            let script = script.clone();
            FakeSpawner::with(move |request| {
                let path = PathBuf::from(&request.args[0]);
                *script.borrow_mut() = fs.contents(&path).unwrap_or_default();
                Ok(SpawnOutput {
                    code: Some(0),
                    ..Default::default()
                })
            })
        };

        let sys = Sys {
            clock: &clock,
            env: &env,
            fs: &*fs,
            spawner: &spawner,
        };

        let recipe = Recipe::load(Path::new("/proj/tasktree.yaml"), sys).unwrap();
        let plan = graph::build(&recipe, "copy", &DepArgs::Defaults, sys, false).unwrap();
        let driver = Driver::new(
            &recipe,
            &plan,
            sys,
            Options::default(),
            PathBuf::from("/proj/.tasktree-state"),
            None,
        );

        driver.run().unwrap();

        let script = script.borrow();
        assert!(script.starts_with("set -eu\n"), "{script}");
        assert!(script.contains("cp in.txt out.txt"), "{script}");

        let requests = spawner.requests.borrow();
        assert_eq!(requests[0].program, PathBuf::from("/bin/bash"));
        assert_eq!(requests[0].current_dir.as_deref(), Some(Path::new("/proj")));
        assert!(requests[0].args[0].ends_with(".sh"));
        // The guard removed the script after the run
        assert!(!fs.exists(Path::new(&requests[0].args[0])));
    }

    #[test]
    fn recursion_is_detected_from_the_call_chain() {
        let fixture = Fixture::new();
        fixture.env.set(CALL_CHAIN_ENV, "a,b,c");
        let recipe = fixture.recipe("tasks:\n  a: {cmd: tt b}\n");

        let Err(Error::RecursionDetected { chain }) = fixture.run(&recipe, "a") else {
            panic!("expected recursion failure");
        };

        assert_eq!(chain, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn call_chain_is_extended_for_children() {
        let fixture = Fixture::new();
        fixture.env.set(CALL_CHAIN_ENV, "outer");
        let recipe = fixture.recipe("tasks:\n  inner: {cmd: echo hi}\n");

        fixture.run(&recipe, "inner").unwrap();

        let requests = fixture.spawner.requests.borrow();
        let chain = requests[0]
            .env
            .iter()
            .find(|(k, _)| k == CALL_CHAIN_ENV)
            .map(|(_, v)| v.clone());

        assert_eq!(chain.as_deref(), Some("outer,inner"));

        let state_path = requests[0]
            .env
            .iter()
            .find(|(k, _)| k == STATE_FILE_ENV)
            .map(|(_, v)| v.clone());
        assert_eq!(state_path.as_deref(), Some("/proj/.tasktree-state"));
    }

    #[test]
    fn different_container_runner_inside_container_is_refused() {
        let fixture = Fixture::new();
        fixture.env.set(CONTAINERIZED_ENV, "img1");
        fixture.fs.add("/proj/Dockerfile.other", "FROM debian", 0);
        let recipe = fixture.recipe(
            r#"
runners:
  img2: {dockerfile: Dockerfile.other}
tasks:
  child:
    runner: img2
    cmd: make
"#,
        );

        assert!(matches!(
            fixture.run(&recipe, "child"),
            Err(Error::NestedContainerSwitch { current, requested, .. })
                if current == "img1" && requested == "img2"
        ));
    }

    #[test]
    fn same_container_runner_inside_container_runs_directly() {
        let fixture = Fixture::new();
        fixture.env.set(CONTAINERIZED_ENV, "img1");
        fixture.fs.add("/proj/Dockerfile", "FROM alpine", 0);
        let recipe = fixture.recipe(
            r#"
runners:
  img1:
    dockerfile: Dockerfile
    env: {IN_CONTAINER: "1"}
tasks:
  child:
    runner: img1
    cmd: make
"#,
        );

        fixture.run(&recipe, "child").unwrap();

        let requests = fixture.spawner.requests.borrow();
        // No docker anywhere: straight /bin/sh on the (container) host
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].program, PathBuf::from("/bin/sh"));
        assert!(requests[0].env.iter().any(|(k, v)| k == "IN_CONTAINER" && v == "1"));
    }

    #[test]
    fn container_runner_builds_then_runs_docker() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/Dockerfile", "FROM alpine", 0);
        let recipe = fixture.recipe(
            r#"
runners:
  builder: {dockerfile: Dockerfile}
tasks:
  build:
    runner: builder
    cmd: make
"#,
        );

        fixture.run(&recipe, "build").unwrap();

        let requests = fixture.spawner.requests.borrow();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].program, PathBuf::from("docker"));
        assert_eq!(requests[0].args[0], "build");
        assert_eq!(requests[1].args[0], "run");

        let run_args = requests[1].args.join(" ");
        assert!(run_args.contains(&format!("/proj/.tasktree-state:{CONTAINER_STATE_PATH}")));
        assert!(run_args.contains(&format!("TT_STATE_FILE_PATH={CONTAINER_STATE_PATH}")));
        assert!(run_args.contains("TT_CONTAINERIZED_RUNNER=builder"));
    }

    #[test]
    fn failure_stops_scheduling_and_preserves_state() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/in.txt", "x", 10);

        let spawner = FakeSpawner::with(|_| {
            Ok(SpawnOutput {
                code: Some(3),
                stderr: b"boom\n".to_vec(),
                ..Default::default()
            })
        });

        let sys = Sys {
            clock: &fixture.clock,
            env: &fixture.env,
            fs: &fixture.fs,
            spawner: &spawner,
        };

        let recipe = fixture.recipe(
            r#"
tasks:
  bad:
    inputs: [in.txt]
    outputs: [out.txt]
    cmd: explode
  after:
    deps: [bad]
    cmd: "true"
"#,
        );

        let plan = graph::build(&recipe, "after", &DepArgs::Defaults, sys, false).unwrap();
        let driver = Driver::new(
            &recipe,
            &plan,
            sys,
            Options::default(),
            PathBuf::from("/proj/.tasktree-state"),
            None,
        );

        let error = driver.run().unwrap_err();
        assert!(matches!(error, Error::TaskFailed { code: Some(3), .. }));
        assert_eq!(error.exit_code(), 3);

        // Only the failing node spawned, and no state was recorded
        assert_eq!(spawner.requests.borrow().len(), 1);
        let state = State::load(&fixture.fs, Path::new("/proj/.tasktree-state")).unwrap();
        assert!(state.entries.is_empty());
    }

    #[test]
    fn state_entries_record_clock_and_inputs() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/in.txt", "x", 77);
        let recipe = fixture.recipe(
            "tasks:\n  t:\n    inputs: [in.txt]\n    outputs: [o]\n    cmd: build\n",
        );

        fixture.run(&recipe, "t").unwrap();

        let state = State::load(&fixture.fs, Path::new("/proj/.tasktree-state")).unwrap();
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].last_run_unix, 1_700_000_000);
        assert_eq!(state.entries[0].inputs["/proj/in.txt"], 77);
    }

    #[test]
    fn stale_definitions_are_pruned() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/in.txt", "x", 10);
        let recipe = fixture.recipe(
            "tasks:\n  t:\n    inputs: [in.txt]\n    outputs: [o]\n    cmd: one\n",
        );
        fixture.run(&recipe, "t").unwrap();

        // Change the command: new definition, old entry pruned
        let changed = fixture.recipe(
            "tasks:\n  t:\n    inputs: [in.txt]\n    outputs: [o]\n    cmd: two\n",
        );
        fixture.run(&changed, "t").unwrap();

        let state = State::load(&fixture.fs, Path::new("/proj/.tasktree-state")).unwrap();
        assert_eq!(state.entries.len(), 1);
    }

    #[test]
    fn force_reruns_fresh_nodes() {
        let fixture = Fixture::new();
        fixture.fs.add("/proj/in.txt", "x", 10);
        let recipe = fixture.recipe(
            "tasks:\n  t:\n    inputs: [in.txt]\n    outputs: [o]\n    cmd: build\n",
        );

        fixture.run(&recipe, "t").unwrap();

        let forced = fixture
            .run_with(
                &recipe,
                "t",
                Options {
                    force: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(forced.executed.len(), 1);
    }

    #[test]
    fn on_err_policy_buffers_stderr() {
        let fixture = Fixture::new();
        let recipe = fixture.recipe(
            "tasks:\n  quiet:\n    task_output: on-err\n    cmd: noisy\n",
        );

        fixture.run(&recipe, "quiet").unwrap();

        let requests = fixture.spawner.requests.borrow();
        assert_eq!(requests[0].stdout, StdioPolicy::Discard);
        assert_eq!(requests[0].stderr, StdioPolicy::Capture);
    }
}
