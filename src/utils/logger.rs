// Copyright (c) 2019-2022 Alibaba Cloud
// Copyright (c) 2019-2022 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use slog::{o, Drain};

const LOG_CHANNEL_SIZE: usize = 1024;

/// Map a textual log level (case-insensitive) to a `slog::Level`.
///
/// Besides the names understood by slog, "warning" is accepted as an alias of
/// "warn".
pub fn slog_level(name: &str) -> Result<slog::Level> {
    let name = name.trim();
    if name.eq_ignore_ascii_case("warning") {
        return Ok(slog::Level::Warning);
    }
    slog::Level::from_str(name).map_err(|_| anyhow!("invalid log level {:?}", name))
}

/// Create a JSON logger writing asynchronously to `writer`.
///
/// The returned guard flushes pending records when dropped, so it must be
/// kept alive for as long as the logger is used.
pub fn create_logger<W>(
    name: &str,
    level: slog::Level,
    writer: W,
) -> (slog::Logger, slog_async::AsyncGuard)
where
    W: Write + Send + 'static,
{
    let json_drain = slog_json::Json::new(writer)
        .add_default_keys()
        .build()
        .fuse();
    let filter_drain = slog::LevelFilter::new(json_drain, level).fuse();
    let (async_drain, guard) = slog_async::Async::new(filter_drain)
        .chan_size(LOG_CHANNEL_SIZE)
        .thread_name("slog-async-logger".into())
        .build_with_guard();

    let logger = slog::Logger::root(
        async_drain.fuse(),
        o!(
            "version" => env!("CARGO_PKG_VERSION"),
            "subsystem" => "root",
            "pid" => process::id().to_string(),
            "name" => name.to_string(),
        ),
    );

    (logger, guard)
}

/// Create a logger appending to the file at `path`.
pub fn create_file_logger(
    name: &str,
    level: slog::Level,
    path: &Path,
) -> Result<(slog::Logger, slog_async::AsyncGuard)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {:?}", path))?;

    Ok(create_logger(name, level, file))
}
