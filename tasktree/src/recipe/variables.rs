// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tt_recipe::VariableDecl;

use super::Error;
use crate::{
    sys::{SpawnRequest, StdioPolicy, Sys},
    template::{self, Builtins, Scope},
    util,
};

/// Resolve one variable declaration against everything declared before
/// it. All kinds produce plain strings.
pub fn resolve(
    name: &str,
    decl: &VariableDecl,
    resolved: &IndexMap<String, String>,
    recipe_dir: &Path,
    builtins: &Builtins,
    sys: Sys<'_>,
) -> Result<String, Error> {
    match decl {
        VariableDecl::Literal(value) => Ok(value.clone()),
        VariableDecl::FromEnv { name: env_name, default } => sys
            .env
            .get(env_name)
            .or_else(|| default.clone())
            .ok_or_else(|| Error::VariableNotSet {
                name: name.to_owned(),
                env: env_name.clone(),
            }),
        VariableDecl::FromFile { path } => {
            let path = resolve_read_path(path, recipe_dir, builtins);

            sys.fs
                .read_to_string(&path)
                .map(strip_one_newline)
                .map_err(|source| Error::VariableReadFailed {
                    name: name.to_owned(),
                    path,
                    source,
                })
        }
        VariableDecl::FromEval { command } => {
            // Always the host shell in the recipe directory, never a
            // container runner
            let (shell, flag) = util::host_shell();

            let request = SpawnRequest {
                program: shell.into(),
                args: vec![flag.to_owned(), command.clone()],
                current_dir: Some(recipe_dir.to_path_buf()),
                env: sys.env.vars(),
                stdout: StdioPolicy::Capture,
                stderr: StdioPolicy::Capture,
            };

            let output = sys
                .spawner
                .spawn(&request)
                .map_err(|source| Error::VariableEvalFailed {
                    name: name.to_owned(),
                    command: command.clone(),
                    detail: source.to_string(),
                })?;

            if !output.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = match output.code {
                    Some(code) => format!("exit code {code}: {}", stderr.trim()),
                    None => format!("stopped by signal: {}", stderr.trim()),
                };

                return Err(Error::VariableEvalFailed {
                    name: name.to_owned(),
                    command: command.clone(),
                    detail,
                });
            }

            Ok(strip_one_newline(
                String::from_utf8_lossy(&output.stdout).into_owned(),
            ))
        }
        VariableDecl::Template(text) => {
            let context = format!("variable `{name}`");
            let scope = Scope::new(&context)
                .with_vars(resolved)
                .with_env(sys.env)
                .with_builtins(builtins);

            Ok(template::substitute(text, &scope)?)
        }
    }
}

fn resolve_read_path(path: &Path, recipe_dir: &Path, builtins: &Builtins) -> PathBuf {
    let expanded = util::expand_tilde(path, builtins.user_home.as_deref());

    if expanded.is_absolute() {
        expanded
    } else {
        recipe_dir.join(expanded)
    }
}

/// Exactly one trailing newline is stripped, further ones are content
fn strip_one_newline(mut text: String) -> String {
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_trailing_newline_stripped() {
        assert_eq!(strip_one_newline("value\n".into()), "value");
        assert_eq!(strip_one_newline("value\r\n".into()), "value");
        assert_eq!(strip_one_newline("value\n\n".into()), "value\n");
        assert_eq!(strip_one_newline("value".into()), "value");
    }
}
