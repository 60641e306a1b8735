use log::LevelFilter;
use tracing::{info, subscriber};
use tracing_subscriber::FmtSubscriber;

pub fn init_tracing(level: LevelFilter) -> anyhow::Result<()> {
    if level == LevelFilter::Off {
        return Ok(());
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_to_tracing(level))
        .with_target(false)
        .finish();

    subscriber::set_global_default(subscriber)?;
    info!("Initialized tracing with level: {}", level);

    Ok(())
}

fn level_to_tracing(level: LevelFilter) -> tracing::Level {
    match level {
        LevelFilter::Error | LevelFilter::Off => tracing::Level::ERROR,
        LevelFilter::Warn => tracing::Level::WARN,
        LevelFilter::Info => tracing::Level::INFO,
        LevelFilter::Debug => tracing::Level::DEBUG,
        LevelFilter::Trace => tracing::Level::TRACE,
    }
}
