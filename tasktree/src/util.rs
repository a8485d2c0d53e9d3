// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

/// The host shell and its command flag, used for `eval` variables
pub fn host_shell() -> (&'static str, &'static str) {
    #[cfg(unix)]
    {
        ("/bin/sh", "-c")
    }
    #[cfg(windows)]
    {
        ("cmd", "/C")
    }
}

pub fn expand_tilde(path: &Path, home: Option<&str>) -> PathBuf {
    let Some(home) = home else {
        return path.to_path_buf();
    };

    if path == Path::new("~") {
        return PathBuf::from(home);
    }

    match path.strip_prefix("~") {
        Ok(rest) => Path::new(home).join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(unix)]
pub fn host_user() -> (u32, u32) {
    use nix::unistd::{getgid, getuid};

    (getuid().as_raw(), getgid().as_raw())
}
