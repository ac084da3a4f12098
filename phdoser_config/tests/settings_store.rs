use phdoser_config::{
    JsonFileSettings, MemorySettings, Settings, SettingsProvider, SlopeResult,
};

#[test]
fn missing_file_loads_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileSettings::new(dir.path().join("nope.json"));
    let s = store.load().unwrap();
    assert_eq!(s, Settings::default());
}

#[test]
fn slope_persists_exactly_and_other_keys_survive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(
        &path,
        r#"{"ph_target": 7.4, "time_zone": "UTC", "calibration": {"ph_probe": {"manual_cal_date": "2024-05-01"}}}"#,
    )
    .unwrap();
    let store = JsonFileSettings::new(&path);

    let slope = SlopeResult {
        acid_slope: 99.7,
        base_slope: 100.3,
        offset: -0.89,
    };
    store.update(&mut |s| s.set_probe_slope(slope)).unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["time_zone"], "UTC");
    assert_eq!(raw["ph_target"], 7.4);
    assert_eq!(raw["calibration"]["ph_probe"]["manual_cal_date"], "2024-05-01");
    assert_eq!(raw["calibration"]["ph_probe"]["slope"]["acid_slope"], 99.7);
    assert_eq!(raw["calibration"]["ph_probe"]["slope"]["offset"], -0.89);

    let back = store.load().unwrap();
    assert_eq!(back.calibration.ph_probe.slope, Some(slope));
}

#[test]
fn save_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/deeper/settings.json");
    let store = JsonFileSettings::new(&path);
    let s = Settings {
        auto_dosing_enabled: true,
        ..Settings::default()
    };
    store.save(&s).unwrap();
    assert!(path.exists());
    assert!(store.load().unwrap().auto_dosing_enabled);
}

#[test]
fn corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = JsonFileSettings::new(&path).load().unwrap_err();
    assert!(format!("{err:#}").contains("parsing settings"));
}

#[test]
fn memory_provider_update_returns_new_document() {
    let store = MemorySettings::new(Settings::default());
    let s = store.update(&mut |s| s.ph_target = 7.3).unwrap();
    assert_eq!(s.ph_target, 7.3);
    assert_eq!(store.load().unwrap().ph_target, 7.3);
}
