// Copyright (c) 2019-2022 Alibaba Cloud
// Copyright (c) 2019-2022 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use slog::{error, info};

use dbs_cli::parser::{run_with_cli, DBSArgs};
use dbs_cli::utils::logger::{create_file_logger, slog_level};

const NAME: &str = "dbs-cli";

fn real_main() -> Result<()> {
    let args: DBSArgs = DBSArgs::parse();

    let level = slog_level(&args.log_level)?;
    let (logger, _async_guard) = create_file_logger(NAME, level, Path::new(&args.log_file))?;

    // Route the global slog-scope logger and `log` records from libraries to
    // the same file.
    let _scope_guard = slog_scope::set_global_logger(logger.clone());
    slog_stdlog::init().context("set up log bridge")?;

    info!(logger, "{} starting", NAME; "args" => format!("{:?}", std::env::args().collect::<Vec<_>>()));

    let result = run_with_cli(&args, &logger);
    if let Err(e) = result.as_ref() {
        error!(logger, "{} failed", NAME; "error" => format!("{:#}", e));
    }
    result
}

fn main() {
    if let Err(e) = real_main() {
        eprintln!("{}: {:#}", NAME, e);
        process::exit(1);
    }
}
