//! Font loading, keyed by family and style

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::protocol::FontRequest;

pub trait FontLoader: Send {
    /// Make one family/style available to the host. Failures are reported but
    /// never block materialization.
    fn load(&mut self, font: &FontRequest) -> Result<(), String>;
}

/// Loader that pretends every font is available
pub struct NoopFontLoader;

impl NoopFontLoader {
    pub fn new() -> Self {
        NoopFontLoader
    }
}

impl Default for NoopFontLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl FontLoader for NoopFontLoader {
    fn load(&mut self, _font: &FontRequest) -> Result<(), String> {
        Ok(())
    }
}

/// Remembers which fonts were requested; families listed as unavailable fail
#[derive(Clone, Default)]
pub struct RecordingFontLoader {
    loaded: Arc<Mutex<HashSet<FontRequest>>>,
    unavailable: HashSet<String>,
}

impl RecordingFontLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every style of `family` fail to load
    pub fn with_unavailable(mut self, family: &str) -> Self {
        self.unavailable.insert(family.to_string());
        self
    }

    pub fn is_loaded(&self, family: &str, style: &str) -> bool {
        let key = FontRequest {
            family: family.to_string(),
            style: style.to_string(),
        };
        self.loaded.lock().map(|g| g.contains(&key)).unwrap_or(false)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().map(|g| g.len()).unwrap_or(0)
    }
}

impl FontLoader for RecordingFontLoader {
    fn load(&mut self, font: &FontRequest) -> Result<(), String> {
        if self.unavailable.contains(&font.family) {
            return Err(format!("font {} {} is not available", font.family, font.style));
        }
        let mut g = self
            .loaded
            .lock()
            .map_err(|_| "font loader poisoned".to_string())?;
        g.insert(font.clone());
        Ok(())
    }
}
