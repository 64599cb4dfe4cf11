//! Filesystem path constants.

/// Default config file path for the server.
pub const DEFAULT_SERVER_CONFIG: &str = "/etc/kgate/config.yaml";

/// Default data directory for the persisted policy store.
pub const DEFAULT_SERVER_DATA_DIR: &str = "/tmp/kgate-data";

/// Default API port.
pub const DEFAULT_SERVER_PORT: u16 = 7443;
