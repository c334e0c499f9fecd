use super::*;

#[test]
fn test_defaults_match_documented_policy() {
    let cfg = Config::default();
    assert_eq!(cfg.session.reconnect_step_ms, 2_000);
    assert_eq!(cfg.session.reconnect_cap_ms, 60_000);
    assert!(cfg.session.max_reconnect_attempts.is_none());
    assert_eq!(cfg.queue.workers, 10);
    assert_eq!(cfg.history.per_chat_limit, 10);
    assert_eq!(cfg.webhook.timeout_secs, 5);
    assert_eq!(cfg.scheduler.poll_interval_secs, 60);
    assert_eq!(cfg.scheduler.lookahead_hours, 24);
}

#[test]
fn test_reconnect_delay_is_linear_then_capped() {
    let s = SessionConfig::default();
    assert_eq!(s.reconnect_delay(1).as_millis(), 2_000);
    assert_eq!(s.reconnect_delay(5).as_millis(), 10_000);
    assert_eq!(s.reconnect_delay(30).as_millis(), 60_000);
    assert_eq!(s.reconnect_delay(500).as_millis(), 60_000);
}

#[test]
fn test_partial_toml_keeps_defaults() {
    let toml_str = r#"
        [session]
        reconnect_step_ms = 500
        max_reconnect_attempts = 8

        [queue]
        workers = 3
    "#;
    let cfg: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.session.reconnect_step_ms, 500);
    assert_eq!(cfg.session.reconnect_cap_ms, 60_000);
    assert_eq!(cfg.session.max_reconnect_attempts, Some(8));
    assert_eq!(cfg.session.fatal_close_codes, vec![401, 403, 411]);
    assert_eq!(cfg.queue.workers, 3);
    assert_eq!(cfg.sender.min_delay_ms, 300);
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let cfg = load("/definitely/not/here/wagate.toml").unwrap();
    assert_eq!(cfg.gateway.name, "wagate");
}

#[test]
fn test_load_rejects_zero_workers() {
    let path = std::env::temp_dir().join("__wagate_test_zero_workers__.toml");
    std::fs::write(&path, "[queue]\nworkers = 0\n").unwrap();
    let result = load(path.to_str().unwrap());
    let _ = std::fs::remove_file(&path);
    assert!(matches!(result, Err(GatewayError::Config(_))));
}

#[test]
fn test_shellexpand_home() {
    if let Some(home) = std::env::var_os("HOME") {
        let expanded = shellexpand("~/x/y");
        assert_eq!(expanded, format!("{}/x/y", home.to_string_lossy()));
    }
    assert_eq!(shellexpand("/abs/path"), "/abs/path");
}
