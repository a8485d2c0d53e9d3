// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::Path;

use thiserror::Error;

use crate::sys::FileSystem;

const STARTER: &str = r#"# Task Tree recipe. Run `tt <task>` to bring a task's outputs up to date.
#
# runners:
#   sandbox:
#     shell: /bin/bash
#     preamble: set -euo pipefail
#
# variables:
#   version: "0.1.0"

tasks:
  build:
    description: Build the project
    inputs:
      - "src/**/*"
    outputs:
      - "out/*"
    cmd: echo "replace me with a real build command"

  test:
    description: Run the tests
    deps: [build]
    cmd: echo "replace me with a real test command"
"#;

/// Write a starter recipe into `dir`, refusing to clobber anything
pub fn run(dir: &Path, fs: &dyn FileSystem) -> Result<(), Error> {
    let path = dir.join("tasktree.yaml");

    if fs.exists(&path) {
        return Err(Error::AlreadyExists(path.display().to_string()));
    }

    fs.write(&path, STARTER)
        .map_err(|source| Error::Write(path.display().to_string(), source))?;

    println!("created {}", path.display());

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} already exists, refusing to overwrite it")]
    AlreadyExists(String),
    #[error("write {0}")]
    Write(String, #[source] std::io::Error),
}

#[cfg(test)]
mod test {
    use crate::sys::testing::FakeFileSystem;

    use super::*;

    #[test]
    fn starter_recipe_parses() {
        let document = tt_recipe::from_str(STARTER).unwrap();
        assert!(document.tasks.contains_key("build"));
        assert!(document.tasks.contains_key("test"));
    }

    #[test]
    fn refuses_to_overwrite() {
        let fs = FakeFileSystem::new();
        run(Path::new("/proj"), &fs).unwrap();
        assert!(matches!(run(Path::new("/proj"), &fs), Err(Error::AlreadyExists(_))));
    }
}
