use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset. Each `-v` widens the varietal
/// crates first, then everything else. The HTML parser stays at `warn` since
/// it reports every malformed tag on catalog pages.
pub fn default_directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info,html5ever=warn,selectors=warn",
        1 => concat!(
            "info,varietal_harvest=debug,varietal_extract=debug,varietal_storage=debug,",
            "varietal_web=debug,tower_http=debug,html5ever=warn,selectors=warn"
        ),
        _ => "debug,hyper=info,hyper_util=info,h2=info,html5ever=warn,selectors=warn",
    }
}

/// `rust_log` wins when set; a malformed value is an error rather than a
/// silent fallback.
pub fn build_filter(rust_log: Option<&str>, verbosity: u8) -> anyhow::Result<EnvFilter> {
    match rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid RUST_LOG value {directives:?}")),
        None => EnvFilter::try_new(default_directives(verbosity)).context("build log filter"),
    }
}

/// Events go to stderr so stdout stays free for command output.
pub fn init(verbosity: u8) -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(rust_log.as_deref(), verbosity)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity > 0)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_verbosity_has_valid_directives() {
        for verbosity in 0..=3 {
            assert!(build_filter(None, verbosity).is_ok(), "verbosity {verbosity}");
        }
        assert_eq!(default_directives(2), default_directives(7));
        assert!(default_directives(1).contains("varietal_harvest=debug"));
    }

    #[test]
    fn rust_log_overrides_verbosity() {
        let filter = build_filter(Some("varietal_web=trace"), 0).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("varietal_web"));
        assert!(!rendered.contains("html5ever"));
    }

    #[test]
    fn blank_rust_log_falls_back_to_defaults() {
        assert!(build_filter(Some("  "), 0).is_ok());
    }

    #[test]
    fn malformed_rust_log_is_rejected() {
        let err = build_filter(Some("varietal_web=loud"), 0).unwrap_err();
        assert!(err.to_string().contains("invalid RUST_LOG"));
    }
}
