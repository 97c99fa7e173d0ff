use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the logger and silences the validator's stderr diagnostics;
/// the scenarios below provoke violations on purpose.
pub fn init() {
    INIT.call_once(|| {
        pretty_env_logger::init();
        keel_sync::lockval::set_quiet(true);
    });
}
