//! Pool gateway snapshot read from a JSON file on every poll.

use std::path::PathBuf;

use phdoser_core::PumpStateSource;
use phdoser_traits::BoxError;
use serde_json::Value;

pub struct FilePumpState {
    path: PathBuf,
}

impl FilePumpState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PumpStateSource for FilePumpState {
    fn snapshot(&self) -> Result<Value, BoxError> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phdoser_core::scheduler::pump_state;

    #[test]
    fn reads_the_file_fresh_each_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        let source = FilePumpState::new(&path);
        assert!(source.snapshot().is_err());

        std::fs::write(&path, r#"{"pump":{"2":{"state":{"value":1}}}}"#).unwrap();
        assert_eq!(pump_state(&source.snapshot().unwrap(), 2), Some(true));

        std::fs::write(&path, r#"{"pump":{"2":{"state":{"value":0}}}}"#).unwrap();
        assert_eq!(pump_state(&source.snapshot().unwrap(), 2), Some(false));

        std::fs::write(&path, "not json").unwrap();
        assert!(source.snapshot().is_err());
    }
}
