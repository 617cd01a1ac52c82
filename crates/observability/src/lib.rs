//! Logging setup shared by the binaries.

/// Initialize process-wide logging from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var("COURIER_LOG_FORMAT")
        .ok()
        .map(|raw| raw.parse::<tracing::LogFormat>())
        .transpose();
    match format {
        Ok(format) => tracing::init(format.unwrap_or_default()),
        Err(e) => {
            tracing::init(tracing::LogFormat::default());
            ::tracing::warn!(error = %e, "falling back to JSON logs");
        }
    }
}

/// Subscriber configuration (filters, formats).
pub mod tracing;
