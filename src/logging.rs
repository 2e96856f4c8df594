//! `tracing` subscriber installation.

use tracing_subscriber::EnvFilter;

use crate::config::Settings;

/// Installs the global subscriber: human-readable in development, JSON lines
/// in production. Filtered by `LOG_LEVEL` (any `EnvFilter` directive).
///
/// Only the first call installs anything; later calls return `false`.
pub fn init(settings: &Settings) -> bool {
    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if settings.mode.is_development() {
        builder.try_init().is_ok()
    } else {
        builder.json().with_current_span(false).try_init().is_ok()
    };
    if installed {
        tracing::debug!(service = %settings.service_name, mode = %settings.mode, "logging initialised");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let settings = Settings { log_level: "not a [valid directive".to_owned(), ..Settings::default() };
        let _ = init(&settings);
        assert!(!init(&settings));
    }
}
