use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// RUST_LOG wins over the `-v` count.
///
/// 0: warnings, and console output from page scripts
/// 1 (-v): lifecycle events
/// 2+ (-vv): per-turn bookkeeping
pub fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn,sandbox::console=info",
        1 => "info",
        _ => "debug,rquickjs=info",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(stderr)
        .with_target(true)
        .with_level(true)
        .compact()
        .init();
}
