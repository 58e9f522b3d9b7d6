//! Tracing subscriber setup for the hub gateway.
//!
//! Settings come from `GATEWAY_LOG_*` environment variables:
//!
//! | Variable | Values | Default |
//! |---|---|---|
//! | `GATEWAY_LOG_LEVEL` | any `EnvFilter` directive | `info` |
//! | `GATEWAY_LOG_OUTPUT` | `console`, `file`, `both`, `none` | `console` |
//! | `GATEWAY_LOG_FORMAT` | `human`, `json` | `human` |
//! | `GATEWAY_LOG_TAGS` | `key:value,key:*` span field filters | empty |
//! | `GATEWAY_LOG_FILE` | path of the rolling log file | `/tmp/hub-gateway.log` |

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Directive,
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry::LookupSpan,
    EnvFilter,
};

/// Where formatted events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            "none" | "off" => LogOutput::None,
            _ => LogOutput::Console,
        }
    }

    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

/// A `key:value` span field requirement. A value of `*` matches any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub json: bool,
    pub tags: Vec<Tag>,
    pub file: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            json: false,
            tags: Vec::new(),
            file: PathBuf::from("/tmp/hub-gateway.log"),
        }
    }
}

impl LogSettings {
    /// Reads the `GATEWAY_LOG_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            level: lookup("GATEWAY_LOG_LEVEL").unwrap_or(defaults.level),
            output: lookup("GATEWAY_LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(defaults.output),
            json: lookup("GATEWAY_LOG_FORMAT")
                .map(|v| v.trim().eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.json),
            tags: lookup("GATEWAY_LOG_TAGS")
                .map(|v| parse_tags(&v))
                .unwrap_or_default(),
            file: lookup("GATEWAY_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.file),
        }
    }
}

/// Parses `key:value` pairs separated by commas. Malformed entries are skipped.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

// Writes every buffer to both sinks; succeeds if either does.
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
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

impl<'a, A, B> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Tee<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

/// Drops events whose enclosing spans do not carry every configured tag.
struct TagFilterLayer {
    filters: Vec<Tag>,
}

#[derive(Default)]
struct SpanFields(HashMap<String, String>);

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = SpanFields::default();
        attrs.record(&mut FieldVisitor(&mut fields.0));
        span.extensions_mut().insert(fields);
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut seen: HashMap<String, String> = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<SpanFields>() {
                for (k, v) in &fields.0 {
                    seen.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|tag| {
            seen.get(&tag.key)
                .is_some_and(|value| tag.value == "*" || value.contains(&tag.value))
        })
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let base = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    ["hyper=warn", "reqwest=warn", "tokio=warn"]
        .into_iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(base, |filter, directive| filter.add_directive(directive))
}

/// Installs the global subscriber described by `settings`.
///
/// Returns the appender guard when a log file is written; keep it alive for
/// the life of the process or buffered lines are lost. Calling this twice is
/// harmless: the second install is ignored.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(&settings.level))
        .with(TagFilterLayer {
            filters: settings.tags.clone(),
        });

    let log_dir = settings
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("/tmp"));
    let log_name = settings
        .file
        .file_name()
        .unwrap_or_else(|| "hub-gateway.log".as_ref());

    let (file_writer, guard) = if settings.output.file() {
        let appender = tracing_appender::rolling::daily(log_dir, log_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (Some(writer), Some(guard))
    } else {
        (None, None)
    };

    let result = match (settings.output.console(), file_writer) {
        (true, Some(file)) => {
            let writer = MakeTee {
                make_a: io::stdout,
                make_b: file,
            };
            let layer = tracing_subscriber::fmt::layer().with_writer(writer);
            if settings.json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            }
        }
        (true, None) => {
            let layer = tracing_subscriber::fmt::layer().with_writer(io::stdout);
            if settings.json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            }
        }
        (false, Some(file)) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file);
            if settings.json {
                subscriber.with(layer.json()).try_init()
            } else {
                subscriber.with(layer).try_init()
            }
        }
        (false, None) => subscriber.try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }

    guard
}

/// Convenience wrapper: `init_subscriber(&LogSettings::from_env())`.
pub fn init_from_env() -> Option<WorkerGuard> {
    init_subscriber(&LogSettings::from_env())
}
