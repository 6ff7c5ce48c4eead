/// Default port the daemon listens on, and peers are assumed to listen on
pub const DEFAULT_PORT: u16 = 18745;

/// API paths served by every node
pub const SERVICES_PATH: &str = "/api/services";
pub const ALL_SERVICES_PATH: &str = "/api/services/all";
pub const NETWORK_PATH: &str = "/api/network";

/// Coarse states with sort priority
pub const STATE_ACTIVE: &str = "active";
pub const STATE_FAILED: &str = "failed";

/// State filter value meaning "no filter"
pub const STATE_ALL: &str = "all";

/// Suffix identifying long-running service units
pub const SERVICE_SUFFIX: &str = ".service";
