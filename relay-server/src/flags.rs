//! Process-wide runtime switches, read once from the environment.

use std::sync::OnceLock;

/// `DEBUG` enables debug logging and a built-in two-player test room.
pub fn in_debug() -> bool {
    static IN_DEBUG: OnceLock<bool> = OnceLock::new();
    *IN_DEBUG.get_or_init(|| env_flag("DEBUG"))
}

/// `UNIT_TEST` inhibits spawning real player loops when a room admits a
/// session.
pub fn in_unit_test() -> bool {
    static IN_UNIT_TEST: OnceLock<bool> = OnceLock::new();
    *IN_UNIT_TEST.get_or_init(|| env_flag("UNIT_TEST"))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| !value.is_empty())
}
