//env
pub const DATABASE_URL_NOT_SET: &str = "DATABASE_URL not set!";

//db
pub const DATABASE_CONNECTION_FAILED: &str = "Failed to connect to database";
pub const DATABASE_ERROR: &str = "Database error";
pub const DB_TRANSACTION_BEGIN_FAILED: &str = "Failed to begin database transaction";
pub const DB_TRANSACTION_COMMIT_FAILED: &str = "Failed to commit database transaction";
pub const SCHEMA_BOOTSTRAP_FAILED: &str = "Failed to bootstrap database schema";

//scanner
pub const CONFIG_SNAPSHOT_LOAD_FAILED: &str = "Failed to load scan configuration";
pub const HTTP_CLIENT_BUILD_FAILED: &str = "Failed to build HTTP client";
