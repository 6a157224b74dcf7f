use std::io::Write;

/// Configures env_logger with timestamps and code locations. Safe to call
/// more than once, later calls are no-ops.
pub fn setup_logger() {
    let _ = env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - [{}] {}:{} {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .try_init();
}
