use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

pub const LOG_LEVEL_ENV: &str = "REQBIN_LOG";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    /// Level precedence: CLI flag, then `REQBIN_LOG`, then `[logging].level`,
    /// then `info`. Format defaults to JSON.
    pub fn resolve(
        config: &Config,
        cli_level: Option<&str>,
        env_level: Option<&str>,
    ) -> anyhow::Result<Self> {
        let configured = config.logging.as_ref();
        let raw_level = cli_level
            .or(env_level)
            .or_else(|| configured.and_then(|logging| logging.level.as_deref()))
            .unwrap_or(DEFAULT_LOG_LEVEL);

        Ok(Self {
            level: parse_level(raw_level)?,
            format: configured
                .and_then(|logging| logging.format)
                .unwrap_or(LogFormat::Json),
        })
    }
}

pub fn init(config: &Config, cli_level: Option<&str>) -> anyhow::Result<LogSettings> {
    let env_level = std::env::var(LOG_LEVEL_ENV).ok();
    let settings = LogSettings::resolve(config, cli_level, env_level.as_deref())?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_writer(std::io::stderr);
    match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(settings)
}

fn parse_level(raw_level: &str) -> anyhow::Result<LevelFilter> {
    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use serde_json::Value;
    use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

    use super::LogSettings;
    use crate::config::{Config, LogFormat};

    fn configured_logging() -> Config {
        Config::from_toml_str(
            r#"
[logging]
level = "warn"
format = "pretty"
"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_to_info_json() {
        let settings = LogSettings::resolve(&Config::default(), None, None).unwrap();
        assert_eq!(
            settings,
            LogSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Json,
            }
        );
    }

    #[test]
    fn level_precedence_is_cli_then_env_then_config() {
        let config = configured_logging();

        let from_config = LogSettings::resolve(&config, None, None).unwrap();
        assert_eq!(from_config.level, LevelFilter::WARN);
        assert_eq!(from_config.format, LogFormat::Pretty);

        let from_env = LogSettings::resolve(&config, None, Some("error")).unwrap();
        assert_eq!(from_env.level, LevelFilter::ERROR);

        let from_cli = LogSettings::resolve(&config, Some(" DEBUG "), Some("error")).unwrap();
        assert_eq!(from_cli.level, LevelFilter::DEBUG);
    }

    #[test]
    fn invalid_level_is_rejected() {
        let err = LogSettings::resolve(&Config::default(), Some("verbose"), None).unwrap_err();
        assert!(
            err.to_string().contains("invalid log level `verbose`"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn json_lines_carry_level_target_and_fields() {
        let writer = CaptureWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::INFO)
            .with_target(true)
            .json()
            .with_writer(writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "reqbin.purge", sessions = 2u64, "purged expired sessions");
        });

        let output = writer.contents();
        let line = output.lines().next().expect("expected one JSON log line");
        let log: Value = serde_json::from_str(line).unwrap();

        assert!(log.get("timestamp").is_some(), "log: {log}");
        assert_eq!(log["level"], "INFO", "log: {log}");
        assert_eq!(log["target"], "reqbin.purge", "log: {log}");
        assert_eq!(log["fields"]["message"], "purged expired sessions");
        assert_eq!(log["fields"]["sessions"], 2);
    }

    #[derive(Clone, Default)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
