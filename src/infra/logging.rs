//! tracing subscriber setup. Logs go to stderr; stdout is reserved for output.

use tracing_subscriber::{EnvFilter, fmt::time::ChronoUtc};

/// Env var that overrides the verbosity flags
pub const LOG_ENV: &str = "TAGSAFE_LOG";

/// Filter directive for the given flags
pub fn default_directive(
    verbose: u8,
    quiet: bool,
) -> &'static str
{
    if quiet
    {
        return "error";
    }
    match verbose
    {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// UTC RFC 3339 timestamps, matching the report and state files
pub fn timer() -> ChronoUtc
{
    ChronoUtc::rfc_3339()
}

/// Install the global subscriber. Safe to call twice (second call is a no-op).
pub fn init(
    verbose: u8,
    quiet: bool,
    no_color: bool,
)
{
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(timer())
        .with_target(false)
        .with_ansi(!no_color)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn quiet_beats_verbose()
    {
        assert_eq!(default_directive(3, true), "error");
        assert_eq!(default_directive(0, false), "warn");
        assert_eq!(default_directive(2, false), "debug");
        assert_eq!(default_directive(9, false), "trace");
    }

    #[test]
    fn timestamps_are_rfc3339_utc()
    {
        use tracing_subscriber::fmt::{format::Writer, time::FormatTime};

        let mut stamp = String::new();
        timer()
            .format_time(&mut Writer::new(&mut stamp))
            .unwrap();
        let parsed = chrono::DateTime::parse_from_rfc3339(stamp.trim()).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 0);
    }
}
