//! Design-token registration on the host side

use std::sync::{Arc, Mutex};

use crate::protocol::TokenMap;

pub trait TokenRegistry: Send {
    /// Register (or replace) the session's design tokens, returning how many
    /// variables were registered
    fn register(&mut self, tokens: &TokenMap) -> Result<usize, String>;
}

/// Registry that accepts tokens without storing them
pub struct NoopTokenRegistry;

impl NoopTokenRegistry {
    pub fn new() -> Self {
        NoopTokenRegistry
    }
}

impl Default for NoopTokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenRegistry for NoopTokenRegistry {
    fn register(&mut self, tokens: &TokenMap) -> Result<usize, String> {
        Ok(tokens.len())
    }
}

/// Keeps every registered token map, most recent last
#[derive(Clone, Default)]
pub struct RecordingTokenRegistry {
    registered: Arc<Mutex<Vec<TokenMap>>>,
}

impl RecordingTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<TokenMap> {
        self.registered
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

impl TokenRegistry for RecordingTokenRegistry {
    fn register(&mut self, tokens: &TokenMap) -> Result<usize, String> {
        let mut g = self
            .registered
            .lock()
            .map_err(|_| "token registry poisoned".to_string())?;
        g.push(tokens.clone());
        Ok(tokens.len())
    }
}
