#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Bootstrap TOML and settings JSON must reject garbage without panicking.
    if let Ok(cfg) = phdoser_config::load_toml(data) {
        let _ = cfg.validate();
    }
    if let Ok(settings) = phdoser_config::Settings::from_json(data) {
        let _ = settings.validate();
        let _ = settings.to_json_pretty();
    }
});
