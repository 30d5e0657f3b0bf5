use tracing_subscriber::filter::{Directive, EnvFilter};
use tracing_subscriber::fmt::SubscriberBuilder;

use crate::errors::{BeaconError, Result};

/// Target used by the audit change-capture path.
pub const AUDIT_TARGET: &str = "beacon::audit";

/// Initializes the default tracing subscriber used by the service.
///
/// `RUST_LOG` wins over `level`. Audit events stay visible at `info` unless the
/// environment filter names the audit target explicitly.
pub fn init_tracing(level: Option<&str>) -> Result<()> {
    let default_level = level.unwrap_or("info");
    let from_env = std::env::var("RUST_LOG").ok();
    let mut filter = match from_env.as_deref() {
        Some(raw) => EnvFilter::try_new(raw).unwrap_or_else(|_| EnvFilter::new(default_level)),
        None => EnvFilter::new(default_level),
    };

    let mentions_audit = from_env
        .as_deref()
        .map(|raw| raw.contains(AUDIT_TARGET))
        .unwrap_or(false);
    if !mentions_audit {
        let directive: Directive = format!("{AUDIT_TARGET}=info")
            .parse()
            .map_err(|err| BeaconError::ConfigError(format!("invalid log directive: {err}")))?;
        filter = filter.add_directive(directive);
    }

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .try_init()
        .map_err(|err| BeaconError::GeneralError(err.to_string()))?;

    Ok(())
}
