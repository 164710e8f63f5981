use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "trainwatch=debug"
    } else {
        "trainwatch=info"
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber: stderr always, plus an append-only copy in
/// `log_file` when given (the watchdog's `watchdog.log`).
///
/// A log file that cannot be opened is reported on stderr and skipped.
pub fn init(verbose: bool, log_file: Option<&Path>) {
    let file_layer = log_file.and_then(|path| {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(e) => {
                eprintln!("warning: cannot open log file {}: {e}", path.display());
                None
            }
        }
    });

    let result = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_follows_verbosity() {
        assert_eq!(default_directive(false), "trainwatch=info");
        assert_eq!(default_directive(true), "trainwatch=debug");
    }

    #[test]
    fn test_init_creates_log_file_and_tolerates_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("watchdog.log");
        init(false, Some(&log));
        init(true, None);
        assert!(log.exists());
    }

    #[test]
    fn test_unopenable_log_file_is_skipped() {
        init(false, Some(Path::new("/nonexistent-dir/watchdog.log")));
    }
}
