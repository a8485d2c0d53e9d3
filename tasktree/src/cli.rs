// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf, str::FromStr};

use clap::{CommandFactory, Parser};
use clap_complete::{
    generate_to,
    shells::{Bash, Fish, Zsh},
};
use fs_err as fs;
use itertools::Itertools;
use log::LevelFilter;
use thiserror::Error;
use tt_recipe::{DepArgs, OutputPolicy};

use crate::{
    env::Env,
    exec::{self, Driver},
    graph,
    recipe::Recipe,
    runner,
    sys::{OsEnvironment, OsSpawner, RealFileSystem, Sys, SystemClock},
};

mod init;

#[derive(Debug, Parser)]
#[command(
    name = "tt",
    version,
    about = "Incremental task runner with a durable freshness cache"
)]
pub struct Command {
    #[arg(
        short = 'f',
        long = "file",
        value_name = "RECIPE",
        help = "Use this recipe file instead of discovering one"
    )]
    pub file: Option<PathBuf>,
    #[arg(short = 'l', long, help = "List the recipe's tasks")]
    pub list: bool,
    #[arg(long, value_name = "TASK", help = "Show one task's definition")]
    pub show: Option<String>,
    #[arg(long, help = "Show the dependency tree of TASK instead of running it")]
    pub tree: bool,
    #[arg(long, help = "Run even when everything is fresh")]
    pub force: bool,
    #[arg(long, help = "Run only TASK itself, skipping dependencies; implies --force")]
    pub only: bool,
    #[arg(long, value_name = "NAME", help = "Override the runner for every scheduled task")]
    pub runner: Option<String>,
    #[arg(
        long,
        value_name = "POLICY",
        value_parser = parse_output_policy,
        help = "Override output handling: all, out, err, on-err or none"
    )]
    pub task_output: Option<OutputPolicy>,
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "warn",
        help = "Log verbosity: error, warn, info, debug or trace"
    )]
    pub log_level: String,
    #[arg(long, help = "Write a starter recipe into the current directory")]
    pub init: bool,
    #[arg(long, help = "Delete the state file so every task re-runs")]
    pub clear_state: bool,
    #[arg(long, global = true, hide = true)]
    pub generate_completions: Option<PathBuf>,
    #[arg(value_name = "TASK")]
    pub task: Option<String>,
    #[arg(
        value_name = "ARGS",
        trailing_var_arg = true,
        help = "Task arguments, positional or name=value"
    )]
    pub args: Vec<String>,
}

fn parse_output_policy(value: &str) -> Result<OutputPolicy, String> {
    OutputPolicy::from_str(value)
        .map_err(|_| format!("`{value}` is not one of all, out, err, on-err, none"))
}

pub fn process() -> Result<(), Error> {
    let command = Command::parse();

    env_logger::Builder::new()
        .filter_level(LevelFilter::from_str(&command.log_level).unwrap_or(LevelFilter::Warn))
        .format_timestamp(None)
        .init();

    if let Some(dir) = &command.generate_completions {
        fs::create_dir_all(dir)?;
        let mut cmd = Command::command();
        generate_to(Bash, &mut cmd, "tt", dir)?;
        generate_to(Fish, &mut cmd, "tt", dir)?;
        generate_to(Zsh, &mut cmd, "tt", dir)?;
        return Ok(());
    }

    let clock = SystemClock;
    let environment = OsEnvironment;
    let filesystem = RealFileSystem;
    let spawner = OsSpawner;

    let sys = Sys {
        clock: &clock,
        env: &environment,
        fs: &filesystem,
        spawner: &spawner,
    };

    let cwd = std::env::current_dir()?;

    if command.init {
        return Ok(init::run(&cwd, sys.fs)?);
    }

    let env = Env::new(command.file.as_deref(), &cwd, sys)?;

    if command.clear_state {
        if sys.fs.exists(&env.state_path) {
            fs::remove_file(&env.state_path)?;
            println!("removed {}", env.state_path.display());
        }
        return Ok(());
    }

    let recipe = Recipe::load(&env.recipe_path, sys)?;

    if command.list {
        list(&recipe);
        return Ok(());
    }

    if let Some(name) = &command.show {
        return show(&recipe, name);
    }

    let Some(task) = &command.task else {
        // No task requested: the listing is the most useful answer
        list(&recipe);
        return Ok(());
    };

    let request_args = graph::parse_request_args(task, &command.args)?;
    let plan = graph::build(&recipe, task, &request_args, sys, command.only)?;

    if command.tree {
        tree(&plan);
        return Ok(());
    }

    let options = exec::Options {
        force: command.force || command.only,
        runner: command.runner.clone(),
        task_output: command.task_output,
    };

    let defaults = env.config.load::<runner::Defaults>();
    let driver = Driver::new(&recipe, &plan, sys, options, env.state_path, defaults);

    let outcome = driver.run()?;

    println!(
        "{} task(s) executed, {} fresh",
        outcome.executed.len(),
        outcome.fresh
    );

    Ok(())
}

fn list(recipe: &Recipe) {
    let visible = recipe.tasks.values().filter(|task| !task.private).collect::<Vec<_>>();

    let width = visible.iter().map(|task| task.name.len()).max().unwrap_or(0);

    for task in visible {
        match &task.description {
            Some(description) => println!("{:width$}  {description}", task.name),
            None => println!("{}", task.name),
        }
    }
}

fn show(recipe: &Recipe, name: &str) -> Result<(), Error> {
    let task = recipe.tasks.get(name).ok_or_else(|| {
        Error::Graph(graph::Error::UnknownTask {
            name: name.to_owned(),
            referrer: None,
        })
    })?;

    println!("task: {}", task.name);

    if let Some(description) = &task.description {
        println!("description: {description}");
    }

    if !task.deps.is_empty() {
        println!("deps: {}", task.deps.iter().map(format_dep).join(", "));
    }

    for (label, entries) in [("inputs", &task.inputs), ("outputs", &task.outputs)] {
        if !entries.is_empty() {
            println!("{label}: {}", entries.iter().join(", "));
        }
    }

    if !task.args.is_empty() {
        let args = task
            .args
            .iter()
            .map(|arg| match &arg.spec.default {
                Some(default) => format!("{}: {} = {default}", arg.spec.name, arg.kind),
                None => format!("{}: {}", arg.spec.name, arg.kind),
            })
            .join(", ");
        println!("args: {args}");
    }

    if let Some(runner) = &task.runner {
        println!("runner: {runner}{}", task.pin_runner.then_some(" (pinned)").unwrap_or_default());
    }

    if let Some(working_dir) = &task.working_dir {
        println!("working_dir: {working_dir}");
    }

    println!("cmd: {}", task.cmd);

    Ok(())
}

fn format_dep(dep: &tt_recipe::DepInvocation) -> String {
    match &dep.args {
        DepArgs::Defaults => dep.task.clone(),
        DepArgs::Positional(values) => format!("{}({})", dep.task, values.iter().join(", ")),
        DepArgs::Named(values) => format!(
            "{}({})",
            dep.task,
            values.iter().map(|(k, v)| format!("{k}={v}")).join(", ")
        ),
    }
}

/// Indented dependency tree, root last as it executes
fn tree(plan: &graph::Plan) {
    let Some(root) = plan.nodes.last() else {
        return;
    };

    fn print_node(plan: &graph::Plan, node: &graph::Node, depth: usize) {
        println!("{}{}", "  ".repeat(depth), node.label());

        if let Some(plan_node) = plan.get(node) {
            for dep in &plan_node.deps {
                print_node(plan, dep, depth + 1);
            }
        }
    }

    print_node(plan, &root.node, 0);
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("recipe")]
    Recipe(#[from] crate::recipe::Error),
    #[error("graph")]
    Graph(#[from] graph::Error),
    #[error("execution")]
    Exec(#[from] exec::Error),
    #[error("init")]
    Init(#[from] init::Error),
    #[error("io error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Exit codes are stable per error family: 2 for recipe problems,
    /// 3 for graph problems, the task's own code (or 4, state damage
    /// 5) for execution failures
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Recipe(_) => 2,
            Error::Graph(_) => 3,
            Error::Exec(error) => error.exit_code(),
            Error::Init(_) | Error::Io(_) => 1,
        }
    }
}
