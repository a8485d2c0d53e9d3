// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::error::Error;

use tasktree::cli;

/// Main entry point
fn main() {
    if let Err(error) = cli::process() {
        report(&error);
        std::process::exit(error.exit_code());
    }
}

fn report(error: &cli::Error) {
    eprintln!("error: {error}");

    let mut source = error.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}
