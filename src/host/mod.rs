//! Host collaborators: token registration, font loading and user notices
//!
//! A reconstructing host provides these surfaces next to its [`SceneHost`].
//! Hosts that don't care about a surface can use the noop implementations.
//! The recording implementations keep what they received behind a shared
//! handle so tests can inspect it after the services have been moved into a
//! session.
//!
//! [`SceneHost`]: crate::scene::SceneHost

pub mod fonts;
pub mod notices;
pub mod tokens;

pub use fonts::{FontLoader, NoopFontLoader, RecordingFontLoader};
pub use notices::{LogNotifier, Notice, NoticeLevel, Notifier, RecordingNotifier};
pub use tokens::{NoopTokenRegistry, RecordingTokenRegistry, TokenRegistry};

/// The set of non-scene collaborators one session talks to
pub struct HostServices {
    pub tokens: Box<dyn TokenRegistry>,
    pub fonts: Box<dyn FontLoader>,
    pub notifier: Box<dyn Notifier>,
}

impl HostServices {
    pub fn new(
        tokens: Box<dyn TokenRegistry>,
        fonts: Box<dyn FontLoader>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            tokens,
            fonts,
            notifier,
        }
    }

    /// Services that accept everything and only log notices
    pub fn noop() -> Self {
        Self::new(
            Box::new(NoopTokenRegistry::new()),
            Box::new(NoopFontLoader::new()),
            Box::new(LogNotifier),
        )
    }
}

impl Default for HostServices {
    fn default() -> Self {
        Self::noop()
    }
}
