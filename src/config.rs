use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "BrightSight";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory
/// ~/BrightSight/ on all platforms (user-visible by design)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("BrightSight")
}

/// Where the serialized database image lives between runs.
pub fn db_image_path() -> PathBuf {
    app_data_dir().join("brightsight.db")
}

/// Dump of the legacy flat store, consumed once by the migration runner.
pub fn legacy_store_path() -> PathBuf {
    app_data_dir().join("legacy-store.json")
}

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> &'static str {
    "info,brightsight=debug"
}
