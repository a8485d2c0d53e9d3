// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use dag::Dag;
use indexmap::IndexMap;
use itertools::Itertools;
use thiserror::Error;
use tt_recipe::{ArgKind, DepArgs, IoEntry, Scalar};

use crate::{
    recipe::{Arg, Recipe, Task},
    sys::Sys,
    template::{self, Builtins, Scope},
};

/// A task plus the arguments bound to it; the unit of scheduling.
/// The same task invoked with different arguments is a different node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub task: String,
    pub args: BTreeMap<String, String>,
}

impl Node {
    pub fn label(&self) -> String {
        if self.args.is_empty() {
            self.task.clone()
        } else {
            format!(
                "{}({})",
                self.task,
                self.args.iter().map(|(k, v)| format!("{k}={v}")).join(", ")
            )
        }
    }
}

/// A scheduled node with everything freshness and execution need
#[derive(Debug)]
pub struct PlanNode {
    pub node: Node,
    /// Declared inputs plus the expanded output globs of every direct
    /// dependency
    pub effective_inputs: Vec<IoEntry>,
    /// Direct dependency task name to its named outputs, for `dep.*`
    /// references
    pub dep_outputs: HashMap<String, IndexMap<String, String>>,
    /// Direct dependency nodes, for the executed-dependency cascade
    pub deps: Vec<Node>,
}

#[derive(Debug)]
pub struct Plan {
    /// Topological order, dependencies first; ties follow discovery
    /// order
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn get(&self, node: &Node) -> Option<&PlanNode> {
        self.nodes.iter().find(|plan| &plan.node == node)
    }
}

/// Build the execution plan for one requested task. With `only` the
/// plan is restricted to the single requested node and dependencies
/// are neither bound nor scheduled.
pub fn build(
    recipe: &Recipe,
    requested: &str,
    request_args: &DepArgs,
    sys: Sys<'_>,
    only: bool,
) -> Result<Plan, Error> {
    let builtins = Builtins::capture(
        recipe.project_root.display(),
        recipe.project_root.display(),
        sys.clock,
        sys.env,
    );

    let mut builder = Builder {
        recipe,
        sys,
        builtins,
        dag: Dag::new(),
        details: HashMap::new(),
        visiting: vec![],
        only,
    };

    let root = builder.visit(requested, request_args, None)?;

    let order = builder.dag.topo().into_iter().cloned().collect::<Vec<_>>();

    let mut nodes = order
        .into_iter()
        .map(|node| {
            let detail = builder.details.remove(&node).expect("every node has details");
            PlanNode {
                node,
                effective_inputs: detail.effective_inputs,
                dep_outputs: detail.dep_outputs,
                deps: detail.deps,
            }
        })
        .collect::<Vec<_>>();

    if only {
        nodes.retain(|plan| plan.node == root);
    }

    Ok(Plan { nodes })
}

/// Parse command line task arguments, either all positional or all
/// `name=value`
pub fn parse_request_args(task: &str, args: &[String]) -> Result<DepArgs, Error> {
    if args.is_empty() {
        return Ok(DepArgs::Defaults);
    }

    let is_named = |arg: &String| {
        arg.split_once('=').is_some_and(|(name, _)| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '$')
        })
    };

    if args.iter().all(is_named) {
        Ok(DepArgs::Named(
            args.iter()
                .map(|arg| {
                    let (name, value) = arg.split_once('=').expect("checked above");
                    (name.to_owned(), value.to_owned())
                })
                .collect(),
        ))
    } else if args.iter().any(is_named) {
        Err(Error::MixedArguments {
            task: task.to_owned(),
        })
    } else {
        Ok(DepArgs::Positional(args.to_vec()))
    }
}

struct Builder<'a> {
    recipe: &'a Recipe,
    sys: Sys<'a>,
    builtins: Builtins,
    dag: Dag<Node>,
    details: HashMap<Node, Detail>,
    visiting: Vec<Node>,
    only: bool,
}

#[derive(Debug, Default)]
struct Detail {
    effective_inputs: Vec<IoEntry>,
    /// All outputs, named or anonymous, fully expanded
    expanded_outputs: Vec<(Option<String>, String)>,
    dep_outputs: HashMap<String, IndexMap<String, String>>,
    deps: Vec<Node>,
}

impl Detail {
    /// The referenceable subset for `dep.*` templates
    fn named_outputs(&self) -> IndexMap<String, String> {
        self.expanded_outputs
            .iter()
            .filter_map(|(name, glob)| name.clone().map(|name| (name, glob.clone())))
            .collect()
    }
}

/// The caller's half of a dependency invocation: its task and bound
/// arguments, used to expand the argument templates it passes down
struct Caller<'a> {
    task: &'a Task,
    args: &'a BTreeMap<String, String>,
}

impl Builder<'_> {
    fn visit(
        &mut self,
        task_name: &str,
        invocation: &DepArgs,
        caller: Option<&Caller<'_>>,
    ) -> Result<Node, Error> {
        let task = self.recipe.tasks.get(task_name).ok_or_else(|| Error::UnknownTask {
            name: task_name.to_owned(),
            referrer: caller.map(|c| c.task.name.clone()),
        })?;

        let args = self.bind_args(task, invocation, caller)?;

        let node = Node {
            task: task_name.to_owned(),
            args,
        };

        if let Some(position) = self.visiting.iter().position(|n| n == &node) {
            let mut ring = self.visiting[position..]
                .iter()
                .map(Node::label)
                .collect::<Vec<_>>();
            ring.push(node.label());

            return Err(Error::DependencyCycle { ring });
        }

        // Two invocations binding the same arguments collapse into one
        // node
        if self.details.contains_key(&node) {
            return Ok(node);
        }

        let index = self.dag.add_node_or_get_index(node.clone());
        self.visiting.push(node.clone());

        let mut detail = Detail {
            effective_inputs: task.inputs.clone(),
            expanded_outputs: self.expand_outputs(task, &node)?,
            ..Default::default()
        };

        if !self.only {
            for dep in &task.deps {
                let caller = Caller {
                    task,
                    args: &node.args,
                };

                let child = self.visit(&dep.task, &dep.args, Some(&caller))?;
                let child_index = self.dag.add_node_or_get_index(child.clone());

                self.dag.add_edge(child_index, index).map_err(|ring| {
                    Error::DependencyCycle {
                        ring: ring.iter().map(Node::label).collect(),
                    }
                })?;

                let child_detail = self.details.get(&child).expect("visited before parent");

                // Automatic input inheritance: every output glob of a
                // direct dependency becomes an input of this node
                for (_, glob) in &child_detail.expanded_outputs {
                    detail.effective_inputs.push(IoEntry::anonymous(glob));
                }

                detail
                    .dep_outputs
                    .entry(dep.task.clone())
                    .or_insert_with(|| child_detail.named_outputs());

                detail.deps.push(child.clone());
            }
        }

        self.visiting.pop();
        self.details.insert(node.clone(), detail);

        Ok(node)
    }

    /// Expand a node's output globs with its own scope; dependents see
    /// these both as inherited inputs and through `dep.*`
    fn expand_outputs(&self, task: &Task, node: &Node) -> Result<Vec<(Option<String>, String)>, Error> {
        let context = format!("task `{}`", task.name);
        let builtins = self.task_builtins(task);
        let scope = Scope::new(&context)
            .with_vars(&self.recipe.variables)
            .with_namespace(task.namespace.as_deref())
            .with_args(&node.args)
            .with_env(self.sys.env)
            .with_builtins(&builtins);

        task.outputs
            .iter()
            .map(|entry| {
                let glob = template::substitute(&entry.glob, &scope)?;
                Ok((entry.name.clone(), glob))
            })
            .collect()
    }

    fn task_builtins(&self, task: &Task) -> Builtins {
        Builtins {
            recipe_dir: task.recipe_dir.display().to_string(),
            ..self.builtins.clone()
        }
        .for_task(&task.name, task.recipe_dir.display())
    }

    fn bind_args(
        &self,
        task: &Task,
        invocation: &DepArgs,
        caller: Option<&Caller<'_>>,
    ) -> Result<BTreeMap<String, String>, Error> {
        let context = match caller {
            Some(caller) => format!("task `{}`", caller.task.name),
            None => format!("task `{}`", task.name),
        };

        let builtins = self.task_builtins(caller.map(|c| c.task).unwrap_or(task));
        let mut scope = Scope::new(&context)
            .with_vars(&self.recipe.variables)
            .with_namespace(
                caller
                    .map(|c| c.task.namespace.as_deref())
                    .unwrap_or(task.namespace.as_deref()),
            )
            .with_env(self.sys.env)
            .with_builtins(&builtins);

        if let Some(caller) = caller {
            scope = scope.with_args(caller.args);
        }

        let expand = |value: &str| template::substitute(value, &scope).map_err(Error::from);

        let defaulted = |arg: &Arg| {
            arg.spec
                .default
                .as_ref()
                .map(Scalar::canonical)
                .ok_or_else(|| Error::MissingArgument {
                    task: task.name.clone(),
                    name: arg.spec.name.clone(),
                })
        };

        let mut bound = BTreeMap::new();

        match invocation {
            DepArgs::Defaults => {
                for arg in &task.args {
                    bound.insert(arg.spec.name.clone(), defaulted(arg)?);
                }
            }
            DepArgs::Positional(values) => {
                if values.len() > task.args.len() {
                    return Err(Error::ExcessArguments {
                        task: task.name.clone(),
                        expected: task.args.len(),
                        given: values.len(),
                    });
                }

                for (position, arg) in task.args.iter().enumerate() {
                    let value = match values.get(position) {
                        Some(value) => expand(value)?,
                        None => defaulted(arg)?,
                    };
                    bound.insert(arg.spec.name.clone(), value);
                }
            }
            DepArgs::Named(values) => {
                for name in values.keys() {
                    if !task.args.iter().any(|arg| arg.spec.key() == name) {
                        return Err(Error::UnknownArgument {
                            task: task.name.clone(),
                            name: name.clone(),
                        });
                    }
                }

                for arg in &task.args {
                    let value = match values.get(arg.spec.key()) {
                        Some(value) => expand(value)?,
                        None => defaulted(arg)?,
                    };
                    bound.insert(arg.spec.name.clone(), value);
                }
            }
        }

        for arg in &task.args {
            if !arg.spec.exported() {
                validate_value(&task.name, arg, &bound[&arg.spec.name])?;
            }
        }

        Ok(bound)
    }
}

fn validate_value(task: &str, arg: &Arg, value: &str) -> Result<(), Error> {
    let mismatch = || Error::ArgumentTypeMismatch {
        task: task.to_owned(),
        name: arg.spec.name.clone(),
        value: value.to_owned(),
        kind: arg.kind,
    };

    let ok = match arg.kind {
        ArgKind::Str | ArgKind::Path => true,
        ArgKind::Int => value.parse::<i64>().is_ok(),
        ArgKind::Float => value.parse::<f64>().is_ok(),
        ArgKind::Bool => matches!(value, "true" | "false"),
        ArgKind::Datetime => parse_datetime(value),
        ArgKind::Ip => value.parse::<IpAddr>().is_ok(),
        ArgKind::Ipv4 => value.parse::<Ipv4Addr>().is_ok(),
        ArgKind::Ipv6 => value.parse::<Ipv6Addr>().is_ok(),
        ArgKind::Email => valid_email(value),
        ArgKind::Hostname => valid_hostname(value),
    };

    if !ok {
        return Err(mismatch());
    }

    if let Some(choices) = &arg.spec.choices {
        if !choices.iter().any(|choice| choice.canonical() == value) {
            return Err(Error::ArgumentNotInChoices {
                task: task.to_owned(),
                name: arg.spec.name.clone(),
                value: value.to_owned(),
                choices: choices.iter().map(Scalar::canonical).join(", "),
            });
        }
    }

    if arg.spec.min.is_some() || arg.spec.max.is_some() {
        let number = value.parse::<f64>().map_err(|_| mismatch())?;

        let min = arg.spec.min.as_ref().and_then(scalar_number);
        let max = arg.spec.max.as_ref().and_then(scalar_number);

        if min.is_some_and(|min| number < min) || max.is_some_and(|max| number > max) {
            return Err(Error::ArgumentOutOfRange {
                task: task.to_owned(),
                name: arg.spec.name.clone(),
                value: value.to_owned(),
                min: min.map(|v| v.to_string()).unwrap_or_else(|| "-inf".into()),
                max: max.map(|v| v.to_string()).unwrap_or_else(|| "+inf".into()),
            });
        }
    }

    Ok(())
}

fn scalar_number(scalar: &Scalar) -> Option<f64> {
    scalar.canonical().parse().ok()
}

fn parse_datetime(value: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(value).is_ok()
        || chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
        || chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

fn valid_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !local.contains(char::is_whitespace) && valid_hostname(domain)
        }
        None => false,
    }
}

fn valid_hostname(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown task `{name}`{}, check `tt --list`", referrer.as_ref().map(|r| format!(" referenced by `{r}`")).unwrap_or_default())]
    UnknownTask {
        name: String,
        referrer: Option<String>,
    },
    #[error("task `{task}` has no argument `{name}`, check its `args` declaration")]
    UnknownArgument { task: String, name: String },
    #[error("task `{task}`: argument `{name}` has no value and no default, pass one explicitly")]
    MissingArgument { task: String, name: String },
    #[error("task `{task}` takes {expected} arguments, {given} given")]
    ExcessArguments {
        task: String,
        expected: usize,
        given: usize,
    },
    #[error("task `{task}`: mix of positional and name=value arguments, use one style")]
    MixedArguments { task: String },
    #[error("task `{task}`: argument `{name}` value `{value}` is not a valid {kind}")]
    ArgumentTypeMismatch {
        task: String,
        name: String,
        value: String,
        kind: ArgKind,
    },
    #[error("task `{task}`: argument `{name}` value `{value}` outside range {min}..={max}")]
    ArgumentOutOfRange {
        task: String,
        name: String,
        value: String,
        min: String,
        max: String,
    },
    #[error("task `{task}`: argument `{name}` value `{value}` not one of: {choices}")]
    ArgumentNotInChoices {
        task: String,
        name: String,
        value: String,
        choices: String,
    },
    #[error("dependency cycle: {}, break the ring by removing one dep", ring.join(" → "))]
    DependencyCycle { ring: Vec<String> },
    #[error(transparent)]
    Template(#[from] template::Error),
}
