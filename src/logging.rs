use std::sync::Once;

use env_logger::Builder;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static RUST_LOG_ONCE: Once = Once::new();
static EFFECTIVE_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

const CRATE_LOG_ENV: &str = "FORCEPLATE_LOG";
const DEFAULT_FILTER: &str = "info";

/// Filter directives to use: `FORCEPLATE_LOG` wins over `RUST_LOG`.
fn pick_filter(crate_env: Option<String>, rust_env: Option<String>) -> String {
    crate_env
        .or(rust_env)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn formatted(mut builder: Builder) -> Builder {
    builder
        .format_timestamp_millis()
        .format_module_path(true)
        .format_target(true);
    builder
}

/// Builder driven by filter directives such as `info` or `forceplate_rs=debug`.
fn builder_from_filters(filters: &str) -> Builder {
    let mut builder = Builder::new();
    builder.parse_filters(filters);
    formatted(builder)
}

/// Builder pinned to one level. Ignores the environment.
fn builder_for_level(level: LevelFilter) -> Builder {
    let mut builder = Builder::new();
    builder.filter_level(level);
    formatted(builder)
}

fn install(mut builder: Builder) {
    RUST_LOG_ONCE.call_once(|| {
        if builder.try_init().is_ok() {
            let _ = EFFECTIVE_LEVEL.set(log::max_level());
        }
    });
}

/// Parse a textual level, ignoring case. Unknown strings yield `None`.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.parse::<LevelFilter>().ok())
}

/// Initialize logging for Rust binaries (stderr formatter) based on `FORCEPLATE_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    let filters = pick_filter(
        std::env::var(CRATE_LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    install(builder_from_filters(&filters));
}

/// Initialize logging with an explicit level, e.g. from a command-line flag.
/// The environment is not consulted. Only the first call installs the
/// logger; later calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    install(builder_for_level(level));
}

/// Most verbose level the installed logger lets through, if installed.
pub fn effective_level() -> Option<LevelFilter> {
    EFFECTIVE_LEVEL.get().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_level(Some("DEBUG")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some("warn")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn level_names_round_trip() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(parse_level(Some(level_to_str(level))), Some(level));
        }
    }

    #[test]
    fn crate_variable_takes_precedence() {
        let pick = |a: Option<&str>, b: Option<&str>| {
            pick_filter(a.map(String::from), b.map(String::from))
        };
        assert_eq!(pick(Some("debug"), Some("warn")), "debug");
        assert_eq!(pick(None, Some("warn")), "warn");
        assert_eq!(pick(None, None), "info");
        assert_eq!(pick(Some(" "), None), "info");
    }

    #[test]
    fn explicit_level_is_what_the_logger_enforces() {
        for level in [LevelFilter::Error, LevelFilter::Debug, LevelFilter::Trace] {
            assert_eq!(builder_for_level(level).build().filter(), level);
        }
    }

    #[test]
    fn filter_directives_set_the_most_verbose_level() {
        assert_eq!(builder_from_filters("warn").build().filter(), LevelFilter::Warn);
        assert_eq!(
            builder_from_filters("info,forceplate_rs::ads1261=trace")
                .build()
                .filter(),
            LevelFilter::Trace
        );
    }
}
