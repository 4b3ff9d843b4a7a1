//! Tracing setup
//!
//! Console and file outputs are both optional and come from
//! [`LoggingSettings`]. Both writers are non-blocking; their flush
//! guards live until the process exits.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::net::config::LoggingSettings;

/// Engine modules log at debug even under the default INFO floor.
const ENGINE_DIRECTIVE: &str = "keysprint_engine=debug";

static LOG_GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

/// Install the global subscriber from the config's logging section.
/// A second call is a no-op: the registry is already claimed.
pub fn init_logging(settings: &LoggingSettings) {
    let mut guards = Vec::new();

    let mut filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if let Ok(directive) = ENGINE_DIRECTIVE.parse() {
        filter = filter.add_directive(directive);
    }

    let file_layer = split_log_path(&settings.log_file).map(|(dir, name)| {
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
            dir,
            name,
        ));
        guards.push(guard);
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
    });

    let console_layer = settings.console.then(|| {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false)
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_ok();

    if installed {
        let _ = LOG_GUARDS.set(guards);
    }
}

/// Split a configured log file into the (directory, file name) pair the
/// appender wants. Empty setting means no file logging; a bare file
/// name logs into the working directory.
fn split_log_path(setting: &str) -> Option<(PathBuf, String)> {
    if setting.is_empty() {
        return None;
    }
    let path = Path::new(setting);
    let name = path.file_name()?.to_str()?.to_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::Directive;

    #[test]
    fn test_engine_directive_parses() {
        assert!(ENGINE_DIRECTIVE.parse::<Directive>().is_ok());
    }

    #[test]
    fn test_split_log_path() {
        assert_eq!(split_log_path(""), None);
        assert_eq!(
            split_log_path("keysprint.log"),
            Some((PathBuf::from("."), "keysprint.log".to_string()))
        );
        assert_eq!(
            split_log_path("/var/log/keysprint.log"),
            Some((PathBuf::from("/var/log"), "keysprint.log".to_string()))
        );
    }
}
