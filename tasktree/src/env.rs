// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use crate::{exec, recipe, state, sys::Sys};

/// Resolved invocation surroundings: which recipe governs us, where
/// the project root is, and where execution state lives
pub struct Env {
    pub config: config::Manager,
    pub recipe_path: PathBuf,
    pub project_root: PathBuf,
    pub state_path: PathBuf,
}

impl Env {
    pub fn new(recipe_arg: Option<&Path>, cwd: &Path, sys: Sys<'_>) -> Result<Self, recipe::Error> {
        let recipe_path = match recipe_arg {
            Some(path) => {
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    cwd.join(path)
                }
            }
            None => recipe::discover(cwd, sys)?,
        };

        let project_root = recipe_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());

        // A parent `tt` (possibly on the other side of a container
        // boundary) decides where our state lives
        let state_path = sys
            .env
            .get(exec::STATE_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| project_root.join(state::STATE_FILE_NAME));

        let config = config::Manager::new("tasktree", Some(&project_root));

        Ok(Self {
            config,
            recipe_path,
            project_root,
            state_path,
        })
    }
}

#[cfg(test)]
mod test {
    use crate::sys::testing::{FakeClock, FakeEnvironment, FakeFileSystem, FakeSpawner};

    use super::*;

    #[test]
    fn state_path_honours_the_parent_override() {
        let clock = FakeClock::at(0);
        let env = FakeEnvironment::default();
        let fs = FakeFileSystem::new();
        let spawner = FakeSpawner::ok();
        fs.add("/proj/tasktree.yaml", "tasks: {}", 0);

        let sys = Sys {
            clock: &clock,
            env: &env,
            fs: &fs,
            spawner: &spawner,
        };

        let plain = Env::new(None, Path::new("/proj"), sys).unwrap();
        assert_eq!(plain.state_path, PathBuf::from("/proj/.tasktree-state"));

        env.set(exec::STATE_FILE_ENV, "/.tasktree-state");
        let nested = Env::new(None, Path::new("/proj"), sys).unwrap();
        assert_eq!(nested.state_path, PathBuf::from("/.tasktree-state"));
    }
}
