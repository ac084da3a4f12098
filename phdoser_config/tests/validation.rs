use phdoser_config::load_toml;
use rstest::rstest;

#[test]
fn empty_file_is_valid_with_defaults() {
    let cfg = load_toml("").expect("parse TOML");
    cfg.validate().expect("defaults are valid");
    assert_eq!(cfg.paths.settings, "data/settings.json");
    assert_eq!(cfg.probe.baud, 9600);
    assert_eq!(cfg.probe.empty_read_threshold, 10);
    assert_eq!(cfg.scheduler.health_check_ms, 10_000);
}

#[test]
fn partial_sections_keep_other_defaults() {
    let toml = r#"
[paths]
settings = "/var/lib/phdoser/settings.json"

[probe]
reconnect_delay_ms = 250
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("valid");
    assert_eq!(cfg.paths.settings, "/var/lib/phdoser/settings.json");
    assert_eq!(cfg.paths.event_log, "data/logs/sensor_log.jsonl");
    assert_eq!(cfg.probe.reconnect_delay_ms, 250);
    assert_eq!(cfg.probe.stale_reading_secs, 30);
}

#[rstest]
#[case("[probe]\nbaud = 0", "probe.baud must be > 0")]
#[case("[probe]\nread_timeout_ms = 0", "probe.read_timeout_ms must be >= 1")]
#[case("[probe]\nempty_read_threshold = 0", "probe.empty_read_threshold must be >= 1")]
#[case("[probe]\nslope_timeout_ms = 600000", "unreasonably large")]
#[case("[relay]\ntimeout_ms = 0", "relay.timeout_ms must be >= 1")]
#[case("[scheduler]\npump_poll_ms = 0", "scheduler.pump_poll_ms must be >= 1")]
#[case("[logging]\nrotation = \"weekly\"", "never|daily|hourly")]
#[case("[paths]\nsettings = \"  \"", "paths.settings must not be empty")]
fn rejects_bad_values(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject");
    assert!(
        format!("{err}").contains(needle),
        "expected '{needle}' in '{err}'"
    );
}

#[test]
fn unknown_field_type_is_a_parse_error() {
    assert!(load_toml("[probe]\nbaud = \"fast\"").is_err());
}
