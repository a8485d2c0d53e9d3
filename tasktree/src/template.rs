// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `{{ prefix.path }}` substitution over command text, paths and
//! argument values. Resolution happens in a fixed stage order, `var`
//! then `dep` then `self` then everything else, so a path assembled
//! from variables can afterwards be referenced through `self.inputs`.

use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use thiserror::Error;
use tt_recipe::IoEntry;

use crate::sys::{Clock, Environment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prefix {
    Var,
    Arg,
    Env,
    Tt,
    Dep,
    SelfIo,
}

impl FromStr for Prefix {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "var" => Ok(Prefix::Var),
            "arg" => Ok(Prefix::Arg),
            "env" => Ok(Prefix::Env),
            "tt" => Ok(Prefix::Tt),
            "dep" => Ok(Prefix::Dep),
            "self" => Ok(Prefix::SelfIo),
            _ => Err(()),
        }
    }
}

/// The values every task execution can reach through `tt.*`
#[derive(Debug, Clone)]
pub struct Builtins {
    pub project_root: String,
    pub recipe_dir: String,
    pub task_name: Option<String>,
    pub working_dir: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub user_home: Option<String>,
    pub user_name: Option<String>,
}

impl Builtins {
    /// Capture the builtins once. The timestamp is fixed here so every
    /// `tt.timestamp*` reference within one task execution agrees.
    pub fn capture(
        project_root: impl ToString,
        recipe_dir: impl ToString,
        clock: &dyn Clock,
        env: &dyn Environment,
    ) -> Self {
        Self {
            project_root: project_root.to_string(),
            recipe_dir: recipe_dir.to_string(),
            task_name: None,
            working_dir: None,
            timestamp: clock.now(),
            user_home: env.get("HOME").or_else(|| env.get("USERPROFILE")),
            user_name: env.get("USER").or_else(|| env.get("USERNAME")),
        }
    }

    pub fn for_task(mut self, name: impl ToString, working_dir: impl ToString) -> Self {
        self.task_name = Some(name.to_string());
        self.working_dir = Some(working_dir.to_string());
        self
    }

    fn get(&self, field: &str) -> Option<String> {
        match field {
            "project_root" => Some(self.project_root.clone()),
            "recipe_dir" => Some(self.recipe_dir.clone()),
            "task_name" => self.task_name.clone(),
            "working_dir" => self.working_dir.clone(),
            "timestamp" => Some(self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
            "timestamp_unix" => Some(self.timestamp.timestamp().to_string()),
            "user_home" => self.user_home.clone(),
            "user_name" => self.user_name.clone(),
            _ => None,
        }
    }
}

/// Everything a template may resolve against. Sections that are not
/// meaningful in the current context stay unset and referencing them
/// is an error.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    /// Context for error messages, e.g. a task or variable name
    pub context: &'a str,
    pub vars: Option<&'a IndexMap<String, String>>,
    /// Namespace of the owning task; namespaced variables win over
    /// identically named top-level ones
    pub namespace: Option<&'a str>,
    pub args: Option<&'a BTreeMap<String, String>>,
    pub env: Option<&'a dyn Environment>,
    pub builtins: Option<&'a Builtins>,
    /// Direct dependency task name to named-output map
    pub deps: Option<&'a HashMap<String, IndexMap<String, String>>>,
    pub inputs: Option<&'a [IoEntry]>,
    pub outputs: Option<&'a [IoEntry]>,
}

impl<'a> Scope<'a> {
    pub fn new(context: &'a str) -> Self {
        Self {
            context,
            vars: None,
            namespace: None,
            args: None,
            env: None,
            builtins: None,
            deps: None,
            inputs: None,
            outputs: None,
        }
    }

    pub fn with_vars(self, vars: &'a IndexMap<String, String>) -> Self {
        Self {
            vars: Some(vars),
            ..self
        }
    }

    pub fn with_namespace(self, namespace: Option<&'a str>) -> Self {
        Self { namespace, ..self }
    }

    pub fn with_args(self, args: &'a BTreeMap<String, String>) -> Self {
        Self {
            args: Some(args),
            ..self
        }
    }

    pub fn with_env(self, env: &'a dyn Environment) -> Self {
        Self { env: Some(env), ..self }
    }

    pub fn with_builtins(self, builtins: &'a Builtins) -> Self {
        Self {
            builtins: Some(builtins),
            ..self
        }
    }

    pub fn with_deps(self, deps: &'a HashMap<String, IndexMap<String, String>>) -> Self {
        Self { deps: Some(deps), ..self }
    }

    pub fn with_io(self, inputs: &'a [IoEntry], outputs: &'a [IoEntry]) -> Self {
        Self {
            inputs: Some(inputs),
            outputs: Some(outputs),
            ..self
        }
    }
}

/// Resolve every reference in `template`
pub fn substitute(template: &str, scope: &Scope<'_>) -> Result<String, Error> {
    let mut text = resolve_stage(template, scope, &[Prefix::Var])?;
    text = resolve_stage(&text, scope, &[Prefix::Dep])?;
    text = resolve_stage(&text, scope, &[Prefix::SelfIo])?;
    resolve_stage(&text, scope, &[Prefix::Arg, Prefix::Env, Prefix::Tt])
}

/// Resolve only `var` references, leaving every other reference
/// untouched. The definition hash is computed over this form so it is
/// stable regardless of call-time arguments and environment.
pub fn substitute_vars(template: &str, scope: &Scope<'_>) -> Result<String, Error> {
    resolve_stage(template, scope, &[Prefix::Var])
}

fn resolve_stage(text: &str, scope: &Scope<'_>, stage: &[Prefix]) -> Result<String, Error> {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            return Err(Error::Unterminated {
                context: scope.context.to_owned(),
                text: rest[open..].chars().take(24).collect(),
            });
        };

        let inner = rest[open + 2..open + 2 + close].trim();
        let (prefix, path) = parse_reference(inner, scope)?;

        output.push_str(&rest[..open]);

        if stage.contains(&prefix) {
            output.push_str(&resolve(prefix, path, scope)?);
        } else {
            // Not this stage's business, reproduce verbatim
            output.push_str(&rest[open..open + 2 + close + 2]);
        }

        rest = &rest[open + 2 + close + 2..];
    }

    output.push_str(rest);

    Ok(output)
}

fn parse_reference<'t>(inner: &'t str, scope: &Scope<'_>) -> Result<(Prefix, &'t str), Error> {
    let Some((prefix, path)) = inner.split_once('.') else {
        return Err(Error::Malformed {
            context: scope.context.to_owned(),
            reference: inner.to_owned(),
        });
    };

    let prefix = prefix.parse::<Prefix>().map_err(|()| Error::UnknownPrefix {
        context: scope.context.to_owned(),
        prefix: prefix.to_owned(),
    })?;

    Ok((prefix, path))
}

fn resolve(prefix: Prefix, path: &str, scope: &Scope<'_>) -> Result<String, Error> {
    let context = || scope.context.to_owned();

    match prefix {
        Prefix::Var => {
            let vars = scope.vars.ok_or_else(|| Error::Unavailable {
                context: context(),
                prefix: "var",
            })?;

            // Namespace-local variables shadow top-level ones
            scope
                .namespace
                .and_then(|ns| vars.get(&format!("{ns}.{path}")))
                .or_else(|| vars.get(path))
                .cloned()
                .ok_or_else(|| Error::UndefinedVariable {
                    context: context(),
                    name: path.to_owned(),
                })
        }
        Prefix::Arg => scope
            .args
            .ok_or_else(|| Error::Unavailable {
                context: context(),
                prefix: "arg",
            })?
            .get(path)
            .cloned()
            .ok_or_else(|| Error::UndefinedArg {
                context: context(),
                name: path.to_owned(),
            }),
        Prefix::Env => scope
            .env
            .ok_or_else(|| Error::Unavailable {
                context: context(),
                prefix: "env",
            })?
            .get(path)
            .ok_or_else(|| Error::UndefinedEnv {
                context: context(),
                name: path.to_owned(),
            }),
        Prefix::Tt => scope
            .builtins
            .ok_or_else(|| Error::Unavailable {
                context: context(),
                prefix: "tt",
            })?
            .get(path)
            .ok_or_else(|| Error::UnknownBuiltin {
                context: context(),
                name: path.to_owned(),
            }),
        Prefix::Dep => {
            let deps = scope.deps.ok_or_else(|| Error::Unavailable {
                context: context(),
                prefix: "dep",
            })?;

            // Task names may be namespaced and contain dots, so split
            // on the rightmost `.outputs.`
            let (task, output) = path
                .rfind(".outputs.")
                .map(|i| (&path[..i], &path[i + ".outputs.".len()..]))
                .ok_or_else(|| Error::Malformed {
                    context: context(),
                    reference: format!("dep.{path}"),
                })?;

            deps.get(task)
                .and_then(|outputs| outputs.get(output))
                .cloned()
                .ok_or_else(|| Error::UndefinedDependencyOutput {
                    context: context(),
                    dep: task.to_owned(),
                    output: output.to_owned(),
                })
        }
        Prefix::SelfIo => {
            let (section, key) = path.split_once('.').ok_or_else(|| Error::Malformed {
                context: context(),
                reference: format!("self.{path}"),
            })?;

            let entries = match section {
                "inputs" => scope.inputs,
                "outputs" => scope.outputs,
                _ => {
                    return Err(Error::Malformed {
                        context: context(),
                        reference: format!("self.{path}"),
                    })
                }
            }
            .ok_or_else(|| Error::Unavailable {
                context: context(),
                prefix: "self",
            })?;

            if let Ok(index) = key.parse::<i64>() {
                let valid = format!("0..{}", entries.len());

                if index < 0 || index as usize >= entries.len() {
                    return Err(Error::SelfRefIndexOutOfRange {
                        context: context(),
                        section: section.to_owned(),
                        index,
                        valid,
                    });
                }

                return Ok(entries[index as usize].glob.clone());
            }

            entries
                .iter()
                .find(|entry| entry.name.as_deref() == Some(key))
                .map(|entry| entry.glob.clone())
                .ok_or_else(|| Error::UndefinedSelfRef {
                    context: context(),
                    section: section.to_owned(),
                    name: key.to_owned(),
                })
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{context}: unterminated template reference near `{text}`, close it with `}}}}`")]
    Unterminated { context: String, text: String },
    #[error("{context}: malformed template reference `{reference}`, expected `prefix.path`")]
    Malformed { context: String, reference: String },
    #[error("{context}: unknown template prefix `{prefix}`, expected var, arg, env, tt, dep or self")]
    UnknownPrefix { context: String, prefix: String },
    #[error("{context}: `{prefix}` references are not available in this position")]
    Unavailable { context: String, prefix: &'static str },
    #[error("{context}: undefined variable `{name}`, define it under `variables`")]
    UndefinedVariable { context: String, name: String },
    #[error("{context}: undefined argument `{name}`, declare it under `args`")]
    UndefinedArg { context: String, name: String },
    #[error("{context}: environment variable `{name}` is not set")]
    UndefinedEnv { context: String, name: String },
    #[error("{context}: unknown builtin `tt.{name}`")]
    UnknownBuiltin { context: String, name: String },
    #[error("{context}: dependency `{dep}` declares no output named `{output}`")]
    UndefinedDependencyOutput {
        context: String,
        dep: String,
        output: String,
    },
    #[error("{context}: no {section} entry named `{name}`, name the entry in its declaration")]
    UndefinedSelfRef {
        context: String,
        section: String,
        name: String,
    },
    #[error("{context}: {section} index {index} out of range, valid range is {valid}")]
    SelfRefIndexOutOfRange {
        context: String,
        section: String,
        index: i64,
        valid: String,
    },
}
