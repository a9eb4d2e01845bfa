//! Tracing subscriber setup for the binary.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "theatre_sync=info";

/// Install the global subscriber: stderr always, plus a daily-rotated file in
/// `log_dir` when given.
///
/// Keep the returned guard alive for as long as logs should be flushed to
/// the file.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, TryInitError> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "theatre-sync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let file = fmt::layer().with_writer(writer).with_ansi(false);

      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry().with(filter).with(stderr).try_init()?;
      Ok(None)
    }
  }
}
