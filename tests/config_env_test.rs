//! Environment overrides. Kept in its own test binary so the variables
//! cannot leak into other configuration tests.

use litert_lm::config::ConfigManager;

#[test]
fn test_environment_overrides_file_and_defaults() {
    std::env::set_var("LITERT_LM__DISPOSE__WAIT_TIMEOUT_MS", "250");
    std::env::set_var("LITERT_LM__ENGINE__NUM_THREADS", "2");

    let config = ConfigManager::load_from_env().unwrap();
    assert_eq!(config.dispose.wait_timeout_ms, 250);
    assert_eq!(config.engine.num_threads, 2);
    assert_eq!(config.generation.sync_buffer_size, 4096);

    std::env::remove_var("LITERT_LM__DISPOSE__WAIT_TIMEOUT_MS");
    std::env::remove_var("LITERT_LM__ENGINE__NUM_THREADS");
}
