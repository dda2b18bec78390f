//! env_logger setup: short local timestamps, padded levels, crate prefix stripped.

use std::io::Write;

use time::macros::format_description;

/// Install the global logger. `SIZEFIT_LOG` wins over `RUST_LOG`; without
/// either, debug builds log at debug and release builds at info.
/// Safe to call more than once.
pub fn init() {
    let filter = std::env::var("SIZEFIT_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_filter().to_string());

    let time_fmt = format_description!("[hour]:[minute]:[second]");
    let _ = env_logger::Builder::new()
        .parse_filters(&filter)
        .target(env_logger::Target::Stderr)
        .format(move |buf, record| {
            let now = time::OffsetDateTime::now_local()
                .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
            let ts = now.format(&time_fmt).unwrap_or_else(|_| "??:??:??".into());
            writeln!(
                buf,
                "{ts}  {level:5}  {target:8}  {message}",
                level = record.level(),
                target = short_target(record.target()),
                message = record.args()
            )
        })
        .try_init();
}

fn default_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "sizefit=debug,info"
    } else {
        "info"
    }
}

fn short_target(target: &str) -> &str {
    target
        .strip_prefix("sizefit::")
        .or_else(|| target.strip_prefix("sizefit_core::"))
        .unwrap_or(target)
}
