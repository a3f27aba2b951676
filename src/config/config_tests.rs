use super::*;
use crate::executor::{ElevationHelper, TextEncoding};
use std::path::PathBuf;
use std::time::Duration;

const MINIMAL: &str = r#"{ "interpreter": "/bin/sh", "script": "/opt/app/main.sh" }"#;

#[test]
fn test_minimal_config_uses_defaults() {
    let config = parse_config(MINIMAL).unwrap();

    assert_eq!(config.interpreter, "/bin/sh");
    assert_eq!(config.presentation, PresentationMode::ScrollingLog);
    assert_eq!(config.text_encoding, TextEncoding::Utf8);
    assert!(!config.remain_running);
    assert!(!config.privileged);
    assert_eq!(
        config.get_cancel_grace(),
        Duration::from_millis(DEFAULT_CANCEL_GRACE_MS)
    );
    assert!(config.get_queue_capacity() >= 1);
}

#[test]
fn test_full_config_deserializes_camel_case() {
    let json = r#"{
        "interpreter": "perl",
        "interpreterArgs": ["-w"],
        "script": "~/tool.pl",
        "scriptArgs": ["--quiet"],
        "presentation": "dropTarget",
        "textEncoding": "latin1",
        "remainRunning": true,
        "privileged": true,
        "dropSuffixes": ["txt", "md"],
        "acceptFolders": true,
        "queueCapacity": 8,
        "coalesceWindowMs": 750,
        "cancelGraceMs": 100,
        "elevation": { "helper": ["doas"], "denialExitCodes": [1], "pollIntervalMs": 20 },
        "saveOutputPath": "/tmp/out.txt"
    }"#;
    let config = parse_config(json).unwrap();

    assert_eq!(config.interpreter_args, vec!["-w"]);
    assert_eq!(config.script_args, vec!["--quiet"]);
    assert_eq!(config.presentation, PresentationMode::DropTarget);
    assert_eq!(config.text_encoding, TextEncoding::Latin1);
    assert!(config.remain_running && config.privileged);
    assert_eq!(config.get_queue_capacity(), 8);
    assert_eq!(config.get_coalesce_window(), Some(Duration::from_millis(750)));
    assert_eq!(config.get_cancel_grace(), Duration::from_millis(100));
    assert!(config.get_accepts_drops());

    let policy = config.drop_policy();
    assert_eq!(policy.suffixes, vec!["txt", "md"]);
    assert!(policy.accept_folders);
    assert!(!policy.accept_any);

    assert_eq!(
        config.elevation.get_helper(),
        ElevationHelper::Prefix(vec!["doas".into()])
    );
    assert_eq!(config.elevation.get_denial_exit_codes(), vec![1]);
    assert_eq!(config.elevation.get_poll_interval(), Duration::from_millis(20));
    assert_eq!(config.get_save_output_path(), Some(PathBuf::from("/tmp/out.txt")));
}

#[test]
fn test_coalescing_only_for_drop_targets() {
    let mut config = WrapperConfig::new("/bin/sh", "/tmp/x.sh");
    config.coalesce_window_ms = Some(300);
    assert_eq!(config.get_coalesce_window(), None);

    config.presentation = PresentationMode::DropTarget;
    assert_eq!(config.get_coalesce_window(), Some(Duration::from_millis(300)));

    config.coalesce_window_ms = None;
    assert_eq!(
        config.get_coalesce_window(),
        Some(Duration::from_millis(DEFAULT_COALESCE_WINDOW_MS))
    );

    config.coalesce_window_ms = Some(0);
    assert_eq!(config.get_coalesce_window(), None);
}

#[test]
fn test_elevation_defaults() {
    let elevation = ElevationConfig::default();
    assert_eq!(
        elevation.get_denial_exit_codes(),
        DEFAULT_DENIAL_EXIT_CODES.to_vec()
    );
    assert_eq!(
        elevation.get_poll_interval(),
        Duration::from_millis(DEFAULT_ELEVATION_POLL_INTERVAL_MS)
    );
    assert_eq!(elevation.get_helper(), ElevationHelper::default());

    let apple = ElevationConfig {
        apple_script: Some(true),
        ..Default::default()
    };
    assert_eq!(apple.get_helper(), ElevationHelper::AppleScript);
}

#[test]
fn test_missing_required_field_is_parse_error() {
    let err = parse_config(r#"{ "script": "/tmp/a.sh" }"#).unwrap_err();
    assert!(matches!(err, crate::error::ScriptExecError::ConfigParse(_)));
}

#[test]
fn test_empty_interpreter_is_rejected() {
    let err = parse_config(r#"{ "interpreter": " ", "script": "/tmp/a.sh" }"#).unwrap_err();
    assert!(matches!(err, crate::error::ScriptExecError::Config(_)));
}

#[test]
fn test_unknown_presentation_is_rejected() {
    let json = r#"{ "interpreter": "/bin/sh", "script": "/a.sh", "presentation": "hologram" }"#;
    assert!(parse_config(json).is_err());
}

#[test]
fn test_load_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wrapper.json");
    std::fs::write(&path, MINIMAL).unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.script, "/opt/app/main.sh");
}

#[test]
fn test_load_config_missing_file() {
    let err = load_config("/definitely/not/here/wrapper.json").unwrap_err();
    assert!(matches!(err, crate::error::ScriptExecError::ConfigRead { .. }));
}

#[test]
fn test_resolve_defaults_working_dir_to_script_parent() {
    let config = WrapperConfig::new("/bin/sh", "/opt/app/main.sh");
    let resolved = resolve_command(&config).unwrap();

    assert_eq!(resolved.interpreter, PathBuf::from("/bin/sh"));
    assert_eq!(resolved.script, PathBuf::from("/opt/app/main.sh"));
    assert_eq!(resolved.working_dir, PathBuf::from("/opt/app"));
}

#[test]
fn test_resolve_explicit_working_dir() {
    let mut config = WrapperConfig::new("/bin/sh", "/opt/app/main.sh");
    config.working_directory = Some("/var/tmp".into());
    let resolved = resolve_command(&config).unwrap();
    assert_eq!(resolved.working_dir, PathBuf::from("/var/tmp"));
}

#[cfg(unix)]
#[test]
fn test_resolve_bare_interpreter_on_path() {
    let config = WrapperConfig::new("sh", "/opt/app/main.sh");
    let resolved = resolve_command(&config).unwrap();
    assert!(resolved.interpreter.is_absolute());
    assert!(resolved.interpreter.ends_with("sh"));
}

#[test]
fn test_resolve_unknown_bare_interpreter_fails() {
    let config = WrapperConfig::new("no-such-interpreter-xyz", "/opt/app/main.sh");
    let err = resolve_command(&config).unwrap_err();
    assert!(matches!(err, crate::error::ScriptExecError::Launch { .. }));
}

#[test]
fn test_resolve_keeps_missing_interpreter_path() {
    let config = WrapperConfig::new("/no/such/bin/interp", "/opt/app/main.sh");
    let resolved = resolve_command(&config).unwrap();
    assert_eq!(resolved.interpreter, PathBuf::from("/no/such/bin/interp"));
}
