//! Application-wide constants

/// Directory name under the platform config and cache directories
pub const APP_DIR_NAME: &str = "glamour";

/// Config file name within the config directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Subdirectory holding committed cache objects
pub const OBJECTS_DIR_NAME: &str = "objects";

/// Subdirectory holding in-progress writes
pub const STAGING_DIR_NAME: &str = "staging";

/// Suffix for staged files awaiting verification
pub const PART_SUFFIX: &str = ".part";

/// Read buffer size for streaming file I/O (64KB)
pub const BUFFER_SIZE: usize = 64 * 1024;

/// How long success notifications stay on screen; failures stay until dismissed
pub const NOTIFICATION_DURATION: std::time::Duration = std::time::Duration::from_secs(5);
