/// Current firmware version, reported in the boot banner (spec §9: no
/// formal OTA/versioning protocol — this is diagnostic only).
pub const FIRMWARE_VERSION: &str = "0.0.1";

/// Build timestamp, set at compile time by `build.rs`.
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");
