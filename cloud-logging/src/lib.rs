use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry, EnvFilter};

const DEFAULT_LOG_FILE: &str = "/var/log/cloud-orchestrator/cloud.log";

// --- Writer that copies every line to two sinks ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

/// Subscriber settings, normally read from `CLOUD_LOG_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let format = match lookup("CLOUD_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let output = match lookup("CLOUD_LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            Some("none") => LogOutput::None,
            _ => LogOutput::Console,
        };
        Self {
            level: lookup("CLOUD_LOG_LEVEL").unwrap_or(defaults.level),
            format,
            output,
            file: lookup("CLOUD_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.file),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        for directive in ["hyper=warn", "hyper_util=warn", "reqwest=warn", "tokio=warn"] {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        filter
    }
}

/// Initializes the global tracing subscriber from `CLOUD_LOG_*` variables.
///
/// The returned guard flushes the file writer when dropped; hold it for the
/// lifetime of the process.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = registry().with(settings.env_filter());
    let is_json = settings.format == LogFormat::Json;

    let log_dir = settings
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let log_filename = settings
        .file
        .file_name()
        .unwrap_or_else(|| "cloud.log".as_ref());

    match settings.output {
        LogOutput::Both => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let tee_writer = MakeTee {
                make_a: std::io::stdout,
                make_b: non_blocking,
            };
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(tee_writer);
            if is_json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer.pretty()).init();
            }
            Some(guard)
        }
        LogOutput::Console => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
            if is_json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer.pretty()).init();
            }
            None
        }
        LogOutput::File => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            if is_json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
            Some(guard)
        }
        LogOutput::None => {
            subscriber.init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let settings = LogSettings::from_lookup(lookup(&[]));
        assert_eq!(settings, LogSettings::default());
    }

    #[test]
    fn test_reads_all_variables() {
        let settings = LogSettings::from_lookup(lookup(&[
            ("CLOUD_LOG_LEVEL", "debug,cloud_orchestrator=trace"),
            ("CLOUD_LOG_FORMAT", "json"),
            ("CLOUD_LOG_OUTPUT", "both"),
            ("CLOUD_LOG_FILE", "/tmp/cloud/api.log"),
        ]));
        assert_eq!(settings.level, "debug,cloud_orchestrator=trace");
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.file, PathBuf::from("/tmp/cloud/api.log"));
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let settings = LogSettings::from_lookup(lookup(&[
            ("CLOUD_LOG_FORMAT", "xml"),
            ("CLOUD_LOG_OUTPUT", "syslog"),
        ]));
        assert_eq!(settings.format, LogFormat::Human);
        assert_eq!(settings.output, LogOutput::Console);
    }

    #[test]
    fn test_bad_level_still_builds_filter() {
        let settings = LogSettings {
            level: "cloud=loud".to_string(),
            ..LogSettings::default()
        };
        let filter = settings.env_filter();
        assert!(filter.to_string().contains("info"));
    }
}
