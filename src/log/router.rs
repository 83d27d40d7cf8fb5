//! Tracing layer that copies events into child log files.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write as _;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

const TAG_FIELD: &str = "log.tag";

struct Sink {
    output: Mutex<File>,
    error: Mutex<File>,
}

/// Routes events to the child log named by the nearest enclosing span that
/// carries a `log.tag` field. Events outside such spans are ignored.
///
/// Errors go to both files of the log, everything else only to the output
/// file.
#[derive(Clone, Default)]
pub struct LogRouter {
    sinks: Arc<RwLock<HashMap<String, Arc<Sink>>>>,
}

impl LogRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, tag: &str, output: File, error: File) {
        let sink = Arc::new(Sink {
            output: Mutex::new(output),
            error: Mutex::new(error),
        });
        self.sinks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(tag.to_string(), sink);
    }

    pub(crate) fn unregister(&self, tag: &str) {
        self.sinks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(tag);
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.sinks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(tag)
    }

    fn sink(&self, tag: &str) -> Option<Arc<Sink>> {
        self.sinks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(tag)
            .cloned()
    }
}

struct LogTag(String);

#[derive(Default)]
struct TagVisitor(Option<String>);

impl Visit for TagVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == TAG_FIELD {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == TAG_FIELD {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }
}

impl<S> Layer<S> for LogRouter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = TagVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(tag), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(LogTag(tag));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        // Nearest span whose log is still open; stopped logs fall through to their parent.
        let Some(sink) = scope.into_iter().find_map(|span| {
            let extensions = span.extensions();
            self.sink(&extensions.get::<LogTag>()?.0)
        }) else {
            return;
        };

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let level = *event.metadata().level();
        let line = format!(
            "{} {:>5} {}{}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            visitor.message,
            visitor.fields
        );

        if let Ok(mut out) = sink.output.lock() {
            let _ = writeln!(out, "{line}");
        }
        if level == Level::ERROR {
            if let Ok(mut err) = sink.error.lock() {
                let _ = writeln!(err, "{line}");
            }
        }
    }
}
