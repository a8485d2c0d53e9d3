// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{fmt, path::PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

pub use self::arg::{ArgKind, ArgSpec, Scalar};
pub use self::runner::{Bind, ContainerRunner, PortMap, Runner, ShellRunner};

pub mod arg;
pub mod runner;

pub fn from_str(s: &str) -> Result<Document, serde_yaml::Error> {
    serde_yaml::from_str(s)
}

/// A single recipe document, before imports are executed and
/// variables are resolved
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    #[serde(default)]
    pub imports: Vec<Import>,
    #[serde(default)]
    pub runners: IndexMap<String, Runner>,
    #[serde(default)]
    pub variables: IndexMap<String, VariableDecl>,
    #[serde(default)]
    pub tasks: IndexMap<String, Task>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Import {
    pub file: PathBuf,
    #[serde(rename = "as")]
    pub namespace: String,
    #[serde(default)]
    pub run_in: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub deps: Vec<DepInvocation>,
    #[serde(default)]
    pub inputs: Vec<IoEntry>,
    #[serde(default)]
    pub outputs: Vec<IoEntry>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub runner: Option<String>,
    #[serde(default)]
    pub pin_runner: bool,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    pub cmd: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub task_output: OutputPolicy,
}

/// What to do with a spawned command's stdio
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OutputPolicy {
    #[default]
    All,
    Out,
    Err,
    OnErr,
    None,
}

/// An input or output declaration. Only named entries can be referenced
/// from templates, both kinds participate in globbing and freshness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoEntry {
    pub name: Option<String>,
    pub glob: String,
}

impl IoEntry {
    pub fn anonymous(glob: impl ToString) -> Self {
        Self {
            name: None,
            glob: glob.to_string(),
        }
    }

    pub fn named(name: impl ToString, glob: impl ToString) -> Self {
        Self {
            name: Some(name.to_string()),
            glob: glob.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for IoEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Debug, Deserialize)]
        #[serde(untagged)]
        enum Outer {
            Glob(String),
            Named(IndexMap<String, String>),
        }

        match Outer::deserialize(deserializer)? {
            Outer::Glob(glob) => Ok(IoEntry { name: None, glob }),
            Outer::Named(map) => {
                // Longhand `{name: .., glob: ..}` first, then the
                // single `name: glob` pair shorthand
                if map.len() == 2 {
                    if let (Some(name), Some(glob)) = (map.get("name"), map.get("glob")) {
                        return Ok(IoEntry {
                            name: Some(name.clone()),
                            glob: glob.clone(),
                        });
                    }
                }

                let mut entries = map.into_iter();

                match (entries.next(), entries.next()) {
                    (Some((name, glob)), None) => Ok(IoEntry {
                        name: Some(name),
                        glob,
                    }),
                    _ => Err(serde::de::Error::custom(
                        "io entry must be a glob string or a single `name: glob` pair",
                    )),
                }
            }
        }
    }
}

/// A reference to another task plus the arguments bound to it. Two
/// invocations of the same task with different arguments are distinct
/// nodes in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepInvocation {
    pub task: String,
    pub args: DepArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepArgs {
    Defaults,
    Positional(Vec<String>),
    Named(IndexMap<String, String>),
}

impl<'de> Deserialize<'de> for DepInvocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Debug, Deserialize)]
        #[serde(untagged)]
        enum Inner {
            Positional(Vec<Scalar>),
            Named(IndexMap<String, Scalar>),
        }

        #[derive(Debug, Deserialize)]
        #[serde(untagged)]
        enum Outer {
            Bare(String),
            Invocation(IndexMap<String, Inner>),
        }

        match Outer::deserialize(deserializer)? {
            Outer::Bare(task) => Ok(DepInvocation {
                task,
                args: DepArgs::Defaults,
            }),
            Outer::Invocation(map) => {
                let mut entries = map.into_iter();

                let (task, inner) = match (entries.next(), entries.next()) {
                    (Some(entry), None) => entry,
                    _ => {
                        return Err(serde::de::Error::custom(
                            "dependency entry must name exactly one task",
                        ))
                    }
                };

                let args = match inner {
                    Inner::Positional(values) => {
                        if values.is_empty() {
                            return Err(serde::de::Error::custom(
                                "dependency argument list may not be empty, use the bare task name instead",
                            ));
                        }
                        DepArgs::Positional(values.iter().map(Scalar::canonical).collect())
                    }
                    Inner::Named(values) => DepArgs::Named(
                        values
                            .into_iter()
                            .map(|(name, value)| (name, value.canonical()))
                            .collect(),
                    ),
                };

                Ok(DepInvocation { task, args })
            }
        }
    }
}

/// A variable declaration. Every kind resolves to a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableDecl {
    /// Non-string scalar, stringified
    Literal(String),
    /// Lookup of a process environment variable
    FromEnv { name: String, default: Option<String> },
    /// UTF-8 file contents, relative to the recipe directory
    FromFile { path: PathBuf },
    /// Stdout of a host subprocess run in the recipe directory
    FromEval { command: String },
    /// String scalar, substituted with the variables defined so far
    Template(String),
}

impl<'de> Deserialize<'de> for VariableDecl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Debug, Deserialize)]
        #[serde(untagged)]
        enum Outer {
            Env {
                env: String,
                #[serde(default)]
                default: Option<Scalar>,
            },
            Read {
                read: PathBuf,
            },
            Eval {
                eval: String,
            },
            Scalar(Scalar),
        }

        match Outer::deserialize(deserializer)? {
            Outer::Env { env, default } => Ok(VariableDecl::FromEnv {
                name: env,
                default: default.as_ref().map(Scalar::canonical),
            }),
            Outer::Read { read } => Ok(VariableDecl::FromFile { path: read }),
            Outer::Eval { eval } => Ok(VariableDecl::FromEval { command: eval }),
            Outer::Scalar(Scalar::String(template)) => Ok(VariableDecl::Template(template)),
            Outer::Scalar(scalar) => Ok(VariableDecl::Literal(scalar.canonical())),
        }
    }
}

impl fmt::Display for IoEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.glob),
            None => self.glob.fmt(f),
        }
    }
}
