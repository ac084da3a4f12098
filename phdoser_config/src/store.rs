//! Settings persistence.
//!
//! Components never cache `Settings`; they call `load()` before each decision
//! so an operator edit takes effect on the next tick.
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use eyre::WrapErr;

use crate::atomic::write_atomic;
use crate::settings::Settings;

pub trait SettingsProvider: Send + Sync {
    fn load(&self) -> eyre::Result<Settings>;
    fn save(&self, settings: &Settings) -> eyre::Result<()>;

    /// Load, mutate and save as one step with respect to other `update` calls
    /// on the same provider. Returns the saved document.
    fn update(&self, f: &mut dyn FnMut(&mut Settings)) -> eyre::Result<Settings>;
}

/// JSON file on disk. A missing file reads as defaults; saves are atomic.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> eyre::Result<Settings> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(Settings::default()),
            Ok(s) => Settings::from_json(&s)
                .wrap_err_with(|| format!("parsing settings {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e).wrap_err_with(|| format!("reading settings {}", self.path.display())),
        }
    }

    fn write(&self, settings: &Settings) -> eyre::Result<()> {
        let json = settings.to_json_pretty().wrap_err("serializing settings")?;
        write_atomic(&self.path, json.as_bytes())
            .wrap_err_with(|| format!("writing settings {}", self.path.display()))
    }
}

impl SettingsProvider for JsonFileSettings {
    fn load(&self) -> eyre::Result<Settings> {
        self.read()
    }

    fn save(&self, settings: &Settings) -> eyre::Result<()> {
        let _g = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.write(settings)
    }

    fn update(&self, f: &mut dyn FnMut(&mut Settings)) -> eyre::Result<Settings> {
        let _g = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut s = self.read()?;
        f(&mut s);
        self.write(&s)?;
        Ok(s)
    }
}

/// In-memory provider for tests and the simulated backend.
#[derive(Debug, Default)]
pub struct MemorySettings {
    inner: Mutex<Settings>,
}

impl MemorySettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }
}

impl SettingsProvider for MemorySettings {
    fn load(&self) -> eyre::Result<Settings> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn save(&self, settings: &Settings) -> eyre::Result<()> {
        *self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = settings.clone();
        Ok(())
    }

    fn update(&self, f: &mut dyn FnMut(&mut Settings)) -> eyre::Result<Settings> {
        let mut g = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut g);
        Ok(g.clone())
    }
}

impl<T: SettingsProvider + ?Sized> SettingsProvider for std::sync::Arc<T> {
    fn load(&self) -> eyre::Result<Settings> {
        (**self).load()
    }
    fn save(&self, settings: &Settings) -> eyre::Result<()> {
        (**self).save(settings)
    }
    fn update(&self, f: &mut dyn FnMut(&mut Settings)) -> eyre::Result<Settings> {
        (**self).update(f)
    }
}
