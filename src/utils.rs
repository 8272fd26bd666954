use std::fmt::Write;

pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut acc = String::with_capacity(bytes.len() * 2);

    for byte in bytes {
        let _ = write!(&mut acc, "{byte:02x}");
    }

    acc
}

/// Installs a `tracing` subscriber writing to stderr, with a progress bar
/// for every running prompt. The filter is read from `RUST_LOG` and defaults
/// to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(indicatif.get_stderr_writer())
                .with_target(false),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
