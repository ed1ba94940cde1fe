//! Work-directory bootstrap behavior across the config crate surface.

use drift_config::{Config, Layout};

#[test]
fn test_fresh_work_dir_bootstraps_and_loads() {
    let temp = tempfile::tempdir().unwrap();
    let layout = Layout::new(temp.path());
    layout.ensure().unwrap();

    // Drop a default config where the layout says it lives, then load
    // it back through the normal path.
    std::fs::write(&layout.config_file, Config::default_toml()).unwrap();
    let config = Config::load(temp.path()).unwrap();

    assert_eq!(config.fd.max_shutdown_time, 600);
    assert!(layout.fifodir.is_dir());
    assert!(layout.outgoing.is_dir());
    assert!(layout.archive.is_dir());
}

#[test]
fn test_partial_config_merges_with_defaults() {
    let temp = tempfile::tempdir().unwrap();
    let layout = Layout::new(temp.path());
    layout.ensure().unwrap();

    std::fs::write(&layout.config_file, "[dupcheck]\nenabled = true\ntimeout = 3600\n").unwrap();
    let config = Config::load(temp.path()).unwrap();

    assert!(config.dupcheck.enabled);
    assert_eq!(config.dupcheck.timeout, 3600);
    // Sections absent from the file stay at their defaults.
    assert_eq!(config.operator.bind, "127.0.0.1");
    assert_eq!(config.fd.default_retry_interval, 120);
}
