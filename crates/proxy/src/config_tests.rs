// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serial_test::serial;

use super::*;

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    config: ProxyConfig,
}

fn parse(args: &[&str]) -> anyhow::Result<ProxyConfig> {
    let mut argv = vec!["authproxy"];
    argv.extend_from_slice(args);
    Ok(TestCli::try_parse_from(argv)?.config)
}

#[test]
#[serial]
fn defaults_match_documented_values() -> anyhow::Result<()> {
    let config = parse(&[])?;
    let rc = config.refresher_config();
    assert_eq!(rc.check_interval, Duration::from_secs(300));
    assert_eq!(rc.refresh_threshold, Duration::from_secs(50 * 60));
    assert_eq!(rc.backup_threshold, Duration::from_secs(55 * 60));
    assert_eq!(rc.reauth_timeout, Duration::from_secs(300));
    assert_eq!(rc.max_transient_failures, 5);
    assert!(!rc.force_reauth);
    assert_eq!(config.callback_port, DEFAULT_CALLBACK_PORT);
    assert_eq!(config.api_key_header, "x-api-key");
    Ok(())
}

#[test]
#[serial]
fn huge_threshold_minutes_saturate() -> anyhow::Result<()> {
    let max = u64::MAX.to_string();
    let config = parse(&["--refresh-threshold-mins", &max, "--backup-threshold-mins", &max])?;
    let rc = config.refresher_config();
    assert_eq!(rc.refresh_threshold, Duration::from_secs(u64::MAX));
    assert_eq!(rc.backup_threshold, Duration::from_secs(u64::MAX));
    Ok(())
}

#[test]
#[serial]
fn token_path_defaults_into_state_dir() -> anyhow::Result<()> {
    let config = parse(&["--state-dir", "/tmp/authproxy-test"])?;
    assert_eq!(config.token_path(), PathBuf::from("/tmp/authproxy-test/tokens.json"));
    let paths = config.daemon_paths();
    assert_eq!(paths.descriptor(), PathBuf::from("/tmp/authproxy-test/proxy.json"));
    assert_eq!(paths.startup_lock(), PathBuf::from("/tmp/authproxy-test/proxy.start.lock"));
    Ok(())
}

#[test]
#[serial]
fn explicit_token_file_wins() -> anyhow::Result<()> {
    let config = parse(&["--state-dir", "/tmp/a", "--token-file", "/tmp/b/t.json"])?;
    assert_eq!(config.token_path(), PathBuf::from("/tmp/b/t.json"));
    Ok(())
}

#[test]
#[serial]
fn oauth_config_requires_client_id() -> anyhow::Result<()> {
    let config = parse(&["--issuer", "https://id.example.com"])?;
    assert!(config.oauth_config().is_none());
    assert!(config.require_oauth().is_err());

    let config = parse(&["--client-id", "cli", "--token-endpoint", "https://id.example.com/t"])?;
    let oauth = config.require_oauth()?;
    assert_eq!(oauth.client_id, "cli");
    assert_eq!(oauth.token_endpoint.as_deref(), Some("https://id.example.com/t"));
    Ok(())
}

#[test]
#[serial]
fn require_target_trims_trailing_slash() -> anyhow::Result<()> {
    let config = parse(&["--target-url", "https://api.example.com/"])?;
    assert_eq!(config.require_target()?, "https://api.example.com");

    let config = parse(&[])?;
    let err = config.require_target().err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("--target-url"), "unexpected error: {err}");
    Ok(())
}

#[test]
#[serial]
fn blank_api_key_is_ignored() -> anyhow::Result<()> {
    let config = parse(&["--api-key", "  "])?;
    assert!(config.api_key().is_none());
    let config = parse(&["--api-key", "sk-123"])?;
    assert_eq!(config.api_key().as_deref(), Some("sk-123"));
    Ok(())
}

#[test]
#[serial]
fn state_dir_env_override() {
    std::env::set_var("AUTHPROXY_STATE_DIR", "/tmp/authproxy-env");
    assert_eq!(default_state_dir(), PathBuf::from("/tmp/authproxy-env"));
    std::env::remove_var("AUTHPROXY_STATE_DIR");
}

#[test]
#[serial]
fn state_dir_falls_back_to_xdg() {
    std::env::remove_var("AUTHPROXY_STATE_DIR");
    let prev = std::env::var("XDG_STATE_HOME").ok();
    std::env::set_var("XDG_STATE_HOME", "/tmp/xdg-state");
    assert_eq!(default_state_dir(), PathBuf::from("/tmp/xdg-state/authproxy"));
    match prev {
        Some(v) => std::env::set_var("XDG_STATE_HOME", v),
        None => std::env::remove_var("XDG_STATE_HOME"),
    }
}

#[test]
#[serial]
fn to_env_round_trips_through_the_parser() -> anyhow::Result<()> {
    let config = parse(&[
        "--state-dir",
        "/tmp/authproxy-env-rt",
        "--target-url",
        "https://api.example.com",
        "--client-id",
        "cli",
        "--api-key",
        "sk-secret",
        "--check-interval-secs",
        "42",
        "--force-reauth",
    ])?;
    let env = config.to_env();
    let lookup = |key: &str| env.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str());
    assert_eq!(lookup("AUTHPROXY_TARGET_URL"), Some("https://api.example.com"));
    assert_eq!(lookup("AUTHPROXY_API_KEY"), Some("sk-secret"));
    assert_eq!(lookup("AUTHPROXY_FORCE_REAUTH"), Some("true"));
    assert_eq!(lookup("AUTHPROXY_ISSUER"), None);

    for (k, v) in &env {
        std::env::set_var(k, v);
    }
    let reparsed = parse(&[]);
    for (k, _) in &env {
        std::env::remove_var(k);
    }
    let reparsed = reparsed?;
    assert_eq!(reparsed.state_dir(), PathBuf::from("/tmp/authproxy-env-rt"));
    assert_eq!(reparsed.require_target()?, "https://api.example.com");
    assert_eq!(reparsed.client_id.as_deref(), Some("cli"));
    assert_eq!(reparsed.check_interval_secs, 42);
    assert!(reparsed.force_reauth);
    Ok(())
}
