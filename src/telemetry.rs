// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::fmt::{Debug, Write as _};

use thiserror::Error;
use tracing::{Event, Subscriber, field};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{Layer, Registry, filter::EnvFilter, prelude::*};

const DEFAULT_FILTER: &str = "info";

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse failure: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized: {0}")]
    Init(#[from] TryInitError),
}

pub fn setup_logging() -> Result<(), Error> {
    let filter = default_env_filter()?;
    tracing_subscriber::registry()
        .with(fmt_layer().with_filter(filter))
        .try_init()?;
    Ok(())
}

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn json_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::format().json().flatten_event(true);
    let format = tracing_subscriber::fmt::layer()
        .event_format(format)
        .fmt_fields(format::JsonFields::default());
    Box::new(format)
}

fn plain_fmt() -> BoxLayer {
    let format = tracing_subscriber::fmt::layer()
        .event_format(IstioFormat::new())
        .fmt_fields(IstioFormat::new());
    Box::new(format)
}

fn fmt_layer() -> BoxLayer {
    if env::var("LOG_FORMAT").unwrap_or("plain".to_string()) == "json" {
        json_fmt()
    } else {
        plain_fmt()
    }
}

fn default_env_filter() -> Result<EnvFilter, Error> {
    let var = env::var(EnvFilter::DEFAULT_ENV).unwrap_or(DEFAULT_FILTER.to_string());
    Ok(EnvFilter::builder().with_regex(false).parse(var)?)
}

/// Plain log lines in the layout shared by Istio components:
/// `<time>\t<level>\t<target>[:<span>{fields}]...\t<message>\t<k=v ...>`.
struct IstioFormat {
    // Targets under this crate are printed relative to it.
    target_prefix: &'static str,
}

impl IstioFormat {
    fn new() -> Self {
        IstioFormat {
            target_prefix: concat!(env!("CARGO_CRATE_NAME"), "::"),
        }
    }
}

/// Records a message followed by space separated key=value pairs.
struct FieldWriter<'writer> {
    writer: Writer<'writer>,
    wrote_field: bool,
    res: std::fmt::Result,
}

impl FieldWriter<'_> {
    fn write_pair(&mut self, name: &str, value: &dyn Debug) -> std::fmt::Result {
        if std::mem::replace(&mut self.wrote_field, true) {
            self.writer.write_char(' ')?;
        }
        write!(self.writer, "{name}={value:?}")
    }
}

impl field::Visit for FieldWriter<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn Debug) {
        if self.res.is_err() {
            return;
        }
        self.res = if field.name() == "message" {
            write!(self.writer, "{value:?}\t")
        } else {
            self.write_pair(field.name(), value)
        };
    }
}

impl<'writer> FormatFields<'writer> for IstioFormat {
    fn format_fields<R: tracing_subscriber::field::RecordFields>(
        &self,
        writer: Writer<'writer>,
        fields: R,
    ) -> std::fmt::Result {
        let mut visitor = FieldWriter {
            writer,
            wrote_field: false,
            res: Ok(()),
        };
        fields.record(&mut visitor);
        visitor.res
    }
}

impl<S, N> FormatEvent<S, N> for IstioFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        use tracing_log::NormalizeEvent;
        use tracing_subscriber::fmt::time::{FormatTime, SystemTime};

        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        SystemTime.format_time(&mut writer)?;
        let level = meta.level().as_str().to_ascii_lowercase();
        let target = meta.target();
        let target = target.strip_prefix(self.target_prefix).unwrap_or(target);
        write!(writer, "\t{level}\t{target}")?;

        for span in ctx.event_scope().into_iter().flat_map(|s| s.from_root()) {
            write!(writer, ":{}", span.metadata().name())?;
            let ext = span.extensions();
            match ext.get::<FormattedFields<N>>() {
                Some(fields) if !fields.is_empty() => write!(writer, "{{{fields}}}")?,
                _ => {}
            }
        }

        if event.fields().next().is_some() {
            writer.write_char('\t')?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use tracing::info;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn istio_format() {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = Registry::default().with(
            tracing_subscriber::fmt::layer()
                .event_format(IstioFormat::new())
                .fmt_fields(IstioFormat::new())
                .with_writer(move || writer.clone()),
        );
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("build", workload = "default/foo");
            let _guard = span.enter();
            info!(port = 80, "selected");
        });
        let line = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert!(
            line.contains("\tinfo\ttelemetry::tests:build{workload=\"default/foo\"}\t"),
            "{line}"
        );
        assert!(line.contains("selected"), "{line}");
        assert!(line.contains("port=80"), "{line}");
        assert!(line.ends_with('\n'));
    }
}
