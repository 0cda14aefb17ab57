use std::sync::Once;

/// Initializes logging and the async runtime once per test binary.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        netterm::runtime::init(4, 128).expect("runtime init failed");
    });
}
