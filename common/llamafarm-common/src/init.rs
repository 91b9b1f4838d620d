//! Process-wide tracing setup shared by the `llamafarmd` binary and its tests.
//!
//! Stdout/stderr are both free for use here (unlike an MCP stdio server, which
//! reserves stdout for the protocol), so this mirrors the richer setup the
//! daemon needs: JSON formatting, a file sink, and env-driven verbosity.

use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Build the `EnvFilter` for a given verbosity level, honoring `RUST_LOG`/
/// `LOG_LEVEL` if set so an operator can override the `-v` flag count.
fn resolve_filter(crate_name: &str, verbosity: u8) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        return Ok(EnvFilter::new(format!("{crate_name}={level}")));
    }
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    Ok(EnvFilter::new(format!("{crate_name}={level}")))
}

/// Initialize tracing for `crate_name` at the given verbosity (0=warn .. 3+=trace).
///
/// `LOG_JSON_FORMAT=1` switches the stdout layer to JSON. `LOG_FILE=<path>`
/// additionally layers a non-blocking file writer; the returned guard must be
/// kept alive for the life of the process or buffered lines are dropped.
pub fn init_tracing(
    crate_name: &str,
    verbosity: u8,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = resolve_filter(crate_name, verbosity);
    let filter = filter?;

    let json = std::env::var("LOG_JSON_FORMAT")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let stdout_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let (file_layer, guard) = match std::env::var("LOG_FILE") {
        Ok(path) => {
            let path = Path::new(&path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "llamafarmd.log".to_string());
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| Path::new(".")),
                file_name,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .boxed(),
                ),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_defaults_by_verbosity() {
        let f = resolve_filter("llamafarm_core", 0).unwrap();
        assert_eq!(f.to_string(), "llamafarm_core=warn");
        let f = resolve_filter("llamafarm_core", 2).unwrap();
        assert_eq!(f.to_string(), "llamafarm_core=debug");
    }
}
