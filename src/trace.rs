//! Subscriber setup for processes embedding the manager and for the test suite.

use std::sync::Once;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn fmt_layer<W>(format: LogFormat, writer: W) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_target(true);
    match format {
        LogFormat::Text => layer.compact().boxed(),
        LogFormat::Json => layer.json().flatten_event(true).boxed(),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info` filter.
///
/// Only the first call has an effect; a subscriber installed elsewhere first wins and is
/// reported on stderr.
pub fn init(log_format: LogFormat) {
    INIT.call_once(|| {
        let layer = fmt_layer(log_format, std::io::stderr).with_filter(env_filter("info"));
        if let Err(err) = tracing_subscriber::registry().with(layer).try_init() {
            eprintln!("tracing already initialized: {err}");
        }
    });
}

// Output goes through libtest's capture so passing tests stay quiet.
fn init_for_tests() {
    INIT.call_once(|| {
        let layer = fmt_layer(LogFormat::Text, fmt::TestWriter::new())
            .with_filter(env_filter("leasekeeper=debug"));
        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
}

/// Run an async test body inside a span named after the test.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    use tracing::Instrument;

    init_for_tests();
    f().instrument(tracing::info_span!("test", name = test_name))
        .await
}

pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    init_for_tests();
    tracing::info_span!("test", name = test_name).in_scope(f)
}
