// Copyright (C) 2020-2022 Alibaba Cloud. All rights reserved.
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Command line surface of the launcher.

pub mod args;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use slog::{info, warn};

pub use args::{Commands, DBSArgs};

use crate::cli_instance::CliInstance;
use crate::vmm::KvmBackend;

/// Run the command selected by `args` on the KVM backend.
///
/// `create` returns once the guest has exited and its resources are released.
pub fn run_with_cli(args: &DBSArgs, logger: &slog::Logger) -> Result<()> {
    match args.command {
        Some(Commands::Create) => create_guest(args, logger),
        None => Err(anyhow!("no command given, try `dbs-cli create --help`")),
    }
}

fn create_guest(args: &DBSArgs, logger: &slog::Logger) -> Result<()> {
    let config = args.launch_config().context("invalid launch arguments")?;
    log_launch_args(args, logger);

    let backend = Arc::new(KvmBackend::new(logger));
    let cli_instance = CliInstance::new(backend, logger);
    let mut guest = cli_instance
        .create(&config)
        .with_context(|| format!("create guest {}", config.id))?;

    let waited = guest.wait();
    if let Err(e) = waited.as_ref() {
        warn!(logger, "waiting for guest failed"; "error" => %e);
    }
    guest.destroy().context("destroy guest")?;
    waited.context("wait for guest")?;

    info!(logger, "guest exited"; "guest" => guest.id());
    Ok(())
}

fn log_launch_args(args: &DBSArgs, logger: &slog::Logger) {
    info!(logger, "launch arguments";
        "create" => ?args.create_args,
        "boot" => ?args.boot_args,
        "tee" => &args.security_args.tee_type);
}
