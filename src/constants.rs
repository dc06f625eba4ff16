use std::time::Duration;

/// How far behind the highest observed provider height the processed head may
/// lag while still reporting as synchronized.
pub const DEFAULT_BLOCK_SYNC_THRESHOLD: u64 = 5;

/// Default interval between provider block number polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// Item key under which a block's body is stored.
pub const BLOCK_ITEM_KEY: &str = "block";

/// Item key under which a block's attached flag is stored.
pub const ATTACHED_ITEM_KEY: &str = "attached";

/// Suffix of anchor state item keys (`"<component>:state"`).
pub const STATE_KEY_SUFFIX: &str = ":state";
