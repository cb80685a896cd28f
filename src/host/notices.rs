//! User-visible, non-fatal notices raised during a session

use std::sync::{Arc, Mutex};

use log::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

pub trait Notifier: Send {
    fn notify(&mut self, notice: &Notice);
}

/// Forwards notices to the `log` facade
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, notice: &Notice) {
        match notice.level {
            NoticeLevel::Info => info!("notice: {}", notice.message),
            NoticeLevel::Warning => warn!("notice: {}", notice.message),
            NoticeLevel::Error => error!("notice: {}", notice.message),
        }
    }
}

/// Collects notices in memory
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn count(&self, level: NoticeLevel) -> usize {
        self.notices
            .lock()
            .map(|g| g.iter().filter(|n| n.level == level).count())
            .unwrap_or(0)
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&mut self, notice: &Notice) {
        if let Ok(mut g) = self.notices.lock() {
            g.push(notice.clone());
        }
    }
}
