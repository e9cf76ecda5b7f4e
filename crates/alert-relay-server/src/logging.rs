// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

use alert_relay::config::LoggingConfig;
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Installs the global subscriber: stderr always, plus the rotated log file when one is
/// configured. The returned guard flushes the file writer on drop and must outlive the
/// process's logging.
pub fn init(log_level: &str, file: Option<BasicRollingFileAppender>) -> Option<WorkerGuard> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .boxed();

    let (file_layer, guard) = match file {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_level(true)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    #[allow(clippy::expect_used)]
    let subscriber = Registry::default()
        .with(EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"))
        .with(stderr_layer)
        .with(file_layer);

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
    guard
}

/// Opens the size-rotated log file, `None` when file logging is disabled.
pub fn rolling_appender(config: &LoggingConfig) -> io::Result<Option<BasicRollingFileAppender>> {
    if config.file.is_empty() {
        return Ok(None);
    }
    BasicRollingFileAppender::new(
        &config.file,
        RollingConditionBasic::new().max_size(config.rotation_bytes),
        config.max_files,
    )
    .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_disables_file_logging() {
        let config = LoggingConfig {
            file: String::new(),
            ..LoggingConfig::default()
        };
        assert!(rolling_appender(&config).unwrap().is_none());
    }

    #[test]
    fn test_log_file_rotates_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.log");
        let config = LoggingConfig {
            file: path.display().to_string(),
            rotation_bytes: 64,
            max_files: 2,
            ..LoggingConfig::default()
        };

        let mut appender = rolling_appender(&config).unwrap().expect("file logging enabled");
        for _ in 0..3 {
            appender.write_all(&[b'x'; 40]).unwrap();
        }
        appender.flush().unwrap();

        assert!(path.exists());
        let rotated = dir.path().join("relay.log.1");
        assert_eq!(std::fs::metadata(rotated).unwrap().len(), 80);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);
    }
}
