use indicatif::ProgressStyle;

/// Overall progress of a plan pass.
pub(crate) fn get_style_root() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// A single resource in flight.
pub(crate) fn get_style_task() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Installs a global `tracing` subscriber.
///
/// Log levels are read from `RUST_LOG`, defaulting to `info`. Log lines are
/// written through the progress bar layer, so they don't tear the bars of
/// resources that are still being created.
///
/// Does nothing if a global subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .compact()
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init();
}
