// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// The closed set of argument types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArgKind {
    Str,
    Int,
    Float,
    Bool,
    Path,
    Datetime,
    Ip,
    Ipv4,
    Ipv6,
    Email,
    Hostname,
}

impl ArgKind {
    pub fn numeric(&self) -> bool {
        matches!(self, ArgKind::Int | ArgKind::Float)
    }
}

/// A YAML scalar as it appears in defaults, choices and bounds
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    /// Canonical text form, as used for substitution and hashing
    pub fn canonical(&self) -> String {
        match self {
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::String(s) => s.clone(),
        }
    }

    fn kind_hint(&self) -> ArgKind {
        match self {
            Scalar::Bool(_) => ArgKind::Bool,
            Scalar::Int(_) => ArgKind::Int,
            Scalar::Float(_) => ArgKind::Float,
            Scalar::String(_) => ArgKind::Str,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.canonical().fmt(f)
    }
}

/// A task argument declaration. A leading `$` on the name marks the
/// argument as exported into the child environment instead of being
/// available as a template.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    pub kind: Option<ArgKind>,
    pub default: Option<Scalar>,
    pub choices: Option<Vec<Scalar>>,
    pub min: Option<Scalar>,
    pub max: Option<Scalar>,
}

impl ArgSpec {
    pub fn named(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            kind: None,
            default: None,
            choices: None,
            min: None,
            max: None,
        }
    }

    /// Exported arguments become environment variables of the spawned
    /// command rather than template values
    pub fn exported(&self) -> bool {
        self.name.starts_with('$')
    }

    /// The identifier without the export sigil
    pub fn key(&self) -> &str {
        self.name.trim_start_matches('$')
    }

    /// Resolve the effective type, inferring it from `default`, `min`,
    /// `max` then the first choice when not declared, and check the
    /// declaration invariants
    pub fn resolve_kind(&self) -> Result<ArgKind, Error> {
        if self.exported() {
            if self.kind.is_some() {
                return Err(Error::ExportedWithType);
            }
            if self.choices.is_some() || self.min.is_some() || self.max.is_some() {
                return Err(Error::ExportedWithConstraints);
            }
            return Ok(ArgKind::Str);
        }

        if self.choices.is_some() && (self.min.is_some() || self.max.is_some()) {
            return Err(Error::ChoicesWithBounds);
        }

        if let Some(choices) = &self.choices {
            if choices.is_empty() {
                return Err(Error::EmptyChoices);
            }
        }

        let kind = match self.kind {
            Some(kind) => kind,
            None => self.infer_kind()?,
        };

        if !kind.numeric() && (self.min.is_some() || self.max.is_some()) {
            return Err(Error::BoundsOnNonNumeric(kind));
        }

        if let (Some(default), Some(choices)) = (&self.default, &self.choices) {
            if !choices.iter().any(|choice| choice.canonical() == default.canonical()) {
                return Err(Error::DefaultNotInChoices(default.canonical()));
            }
        }

        if let (Some(default), Some(value)) = (self.default.as_ref().and_then(Scalar::as_f64), &self.min) {
            let min = value.as_f64().ok_or(Error::NonNumericBound(value.canonical()))?;
            if default < min {
                return Err(Error::DefaultOutOfBounds {
                    default: default.to_string(),
                    bound: "min".into(),
                    value: min.to_string(),
                });
            }
        }

        if let (Some(default), Some(value)) = (self.default.as_ref().and_then(Scalar::as_f64), &self.max) {
            let max = value.as_f64().ok_or(Error::NonNumericBound(value.canonical()))?;
            if default > max {
                return Err(Error::DefaultOutOfBounds {
                    default: default.to_string(),
                    bound: "max".into(),
                    value: max.to_string(),
                });
            }
        }

        Ok(kind)
    }

    fn infer_kind(&self) -> Result<ArgKind, Error> {
        let sources = [
            self.default.as_ref(),
            self.min.as_ref(),
            self.max.as_ref(),
            self.choices.as_ref().and_then(|choices| choices.first()),
        ];

        let mut inferred = None;

        for hint in sources.into_iter().flatten().map(Scalar::kind_hint) {
            match inferred {
                None => inferred = Some(hint),
                Some(kind) if kind == hint => {}
                // Int/float bounds mix freely, widen to float
                Some(kind) if kind.numeric() && hint.numeric() => inferred = Some(ArgKind::Float),
                Some(kind) => return Err(Error::InferenceConflict(kind, hint)),
            }
        }

        Ok(inferred.unwrap_or(ArgKind::Str))
    }
}

impl<'de> Deserialize<'de> for ArgSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Debug, Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Inner {
            name: String,
            #[serde(default, rename = "type")]
            kind: Option<ArgKind>,
            #[serde(default)]
            default: Option<Scalar>,
            #[serde(default)]
            choices: Option<Vec<Scalar>>,
            #[serde(default)]
            min: Option<Scalar>,
            #[serde(default)]
            max: Option<Scalar>,
        }

        #[derive(Debug, Deserialize)]
        #[serde(untagged)]
        enum Outer {
            Name(String),
            Spec(Inner),
        }

        match Outer::deserialize(deserializer)? {
            Outer::Name(name) => Ok(ArgSpec::named(name)),
            Outer::Spec(inner) => Ok(ArgSpec {
                name: inner.name,
                kind: inner.kind,
                default: inner.default,
                choices: inner.choices,
                min: inner.min,
                max: inner.max,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("exported arguments are always strings and may not declare a type")]
    ExportedWithType,
    #[error("exported arguments may not declare choices or bounds")]
    ExportedWithConstraints,
    #[error("choices and min/max are mutually exclusive")]
    ChoicesWithBounds,
    #[error("choices may not be empty")]
    EmptyChoices,
    #[error("min/max are only valid for numeric types, not {0}")]
    BoundsOnNonNumeric(ArgKind),
    #[error("bound {0} is not numeric")]
    NonNumericBound(String),
    #[error("default `{0}` is not one of the declared choices")]
    DefaultNotInChoices(String),
    #[error("default {default} violates {bound} {value}")]
    DefaultOutOfBounds {
        default: String,
        bound: String,
        value: String,
    },
    #[error("conflicting types inferred from declaration: {0} vs {1}")]
    InferenceConflict(ArgKind, ArgKind),
}
