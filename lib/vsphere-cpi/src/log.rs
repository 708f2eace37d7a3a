// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root logger construction.

use slog::{o, Drain, Level, Logger};
use vsphere_cpi_config::{LogConfig, LogFormat, LogLevel};

fn level(level: LogLevel) -> Level {
    match level {
        LogLevel::Trace => Level::Trace,
        LogLevel::Debug => Level::Debug,
        LogLevel::Info => Level::Info,
        LogLevel::Warn => Level::Warning,
        LogLevel::Error => Level::Error,
    }
}

/// Builds a root logger writing to stderr, leaving stdout to whatever
/// protocol the orchestrator speaks with the CPI.
pub fn build_logger(config: &LogConfig) -> Logger {
    let main_drain = match config.format {
        LogFormat::Plain => {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            slog_async::Async::new(drain)
                .overflow_strategy(slog_async::OverflowStrategy::Block)
                .build_no_guard()
        }
        LogFormat::Bunyan => {
            let drain = slog_bunyan::with_name("vsphere-cpi", std::io::stderr())
                .build()
                .fuse();
            slog_async::Async::new(drain)
                .overflow_strategy(slog_async::OverflowStrategy::Block)
                .build_no_guard()
        }
    };

    let filtered = slog::LevelFilter::new(main_drain, level(config.level));
    Logger::root(filtered.fuse(), o!())
}
