//! Tracing subscriber setup from `[LOGGER]` configuration.

use tracing_subscriber::EnvFilter;

use crate::LoggerConfig;

/// Maps a `[LOGGER]` component name to the crate whose spans it covers.
fn component_target(component: &str) -> Option<&'static str> {
    match component {
        "sst" => Some("sirocco_sst"),
        "rpc" => Some("sirocco_rbm"),
        "viewmanager" => Some("sirocco_group"),
        "persistence" => Some("sirocco_persist"),
        _ => None,
    }
}

/// Installs the global tracing subscriber according to the logger
/// configuration. Safe to call more than once; only the first
/// installation wins (later calls are no-ops, which keeps tests that
/// each configure logging from panicking).
pub fn init_logging(logger: &LoggerConfig) {
    let mut filter = EnvFilter::new(logger.default_log_level.clone());
    for (component, level) in &logger.component_levels {
        if let Some(target) = component_target(component) {
            if let Ok(directive) = format!("{target}={level}").parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(logger.log_to_terminal);
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let logger = LoggerConfig::default();
        init_logging(&logger);
        init_logging(&logger);
    }

    #[test]
    fn component_targets_cover_configured_components() {
        for component in ["sst", "rpc", "viewmanager", "persistence"] {
            assert!(component_target(component).is_some());
        }
        assert!(component_target("unknown").is_none());
    }
}
