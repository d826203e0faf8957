use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::{
    config::{Config, LogFormat},
    session::SessionId,
};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

/// Effective logging settings after the CLI override and `[logging]` are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    /// `cli_level_override` wins over `[logging].level`. Levels are case-insensitive.
    pub fn resolve(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let level = match cli_level_override.or_else(|| logging.and_then(|l| l.level.as_deref())) {
            Some(raw) => parse_level(raw)?,
            None => DEFAULT_LOG_LEVEL,
        };
        let format = logging
            .and_then(|logging| logging.format)
            .unwrap_or(LogFormat::Json);
        Ok(Self { level, format })
    }

    /// Installs the global subscriber writing to stderr, so stdout stays free for
    /// command output.
    pub fn install(self) -> anyhow::Result<()> {
        let builder = tracing_subscriber::fmt()
            .with_max_level(self.level)
            .with_target(true)
            .with_writer(std::io::stderr);
        match self.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Pretty => builder.pretty().try_init(),
        }
        .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
    }
}

pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    LogSettings::resolve(config, cli_level_override)?.install()
}

/// Span that scopes everything logged on behalf of one recording.
pub fn recording_span(session_id: &SessionId, url: &str) -> tracing::Span {
    tracing::info_span!("recording", session_id = %session_id, url = %url)
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim().to_ascii_lowercase().parse().map_err(|_| {
        anyhow!("invalid log level `{raw}`; expected one of trace, debug, info, warn, error, off")
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::Value;
    use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

    use super::{LogSettings, recording_span};
    use crate::{
        config::{Config, LogFormat},
        session::SessionId,
    };

    fn with_logging(level: &str, format: &str) -> Config {
        Config::from_toml_str(&format!("[logging]\nlevel = \"{level}\"\nformat = \"{format}\"\n"))
            .unwrap()
    }

    #[test]
    fn defaults_to_info_json() {
        let settings = LogSettings::resolve(&Config::default(), None).unwrap();
        assert_eq!(
            settings,
            LogSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Json
            }
        );
    }

    #[test]
    fn config_level_is_case_insensitive_and_cli_wins() {
        let config = with_logging("WARN", "pretty");
        let from_config = LogSettings::resolve(&config, None).unwrap();
        assert_eq!(from_config.level, LevelFilter::WARN);
        assert_eq!(from_config.format, LogFormat::Pretty);

        let overridden = LogSettings::resolve(&config, Some(" Debug ")).unwrap();
        assert_eq!(overridden.level, LevelFilter::DEBUG);
    }

    #[test]
    fn unknown_level_is_rejected() {
        let err = LogSettings::resolve(&Config::default(), Some("verbose")).unwrap_err();
        assert!(err.to_string().contains("invalid log level `verbose`"), "{err}");
    }

    #[test]
    fn json_lines_carry_the_recording_span() {
        let buffer = CaptureBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::DEBUG)
            .json()
            .with_writer(buffer.clone())
            .finish();

        let session_id = SessionId::parse("abc").unwrap();
        tracing::subscriber::with_default(subscriber, || {
            let _entered = recording_span(&session_id, "https://example.test/").entered();
            tracing::info!(resource_count = 3, "recording stopped");
        });

        let output = buffer.contents();
        let line: Value = serde_json::from_str(output.lines().next().expect("one log line"))
            .expect("log line should be JSON");
        assert_eq!(line["level"], "INFO", "{line}");
        assert_eq!(line["fields"]["message"], "recording stopped", "{line}");
        assert_eq!(line["fields"]["resource_count"], 3, "{line}");
        assert_eq!(line["span"]["name"], "recording", "{line}");
        assert_eq!(line["span"]["session_id"], "abc", "{line}");
        assert_eq!(line["span"]["url"], "https://example.test/", "{line}");
    }

    #[derive(Clone, Default)]
    struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

    impl CaptureBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl std::io::Write for CaptureBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CaptureBuffer {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }
}
