//! RFox Scene Streaming
//!
//! Streams a captured web page to a host that rebuilds it as a paint-ordered
//! scene graph. The producer side ([`producer::StreamSession`]) turns a
//! captured document into an ordered sequence of messages. The consumer side
//! ([`coordinator::SessionCoordinator`]) rebuilds the tree from those messages
//! even when parents arrive late or image chunks arrive out of order. An asset
//! that never completes is replaced by a placeholder within a bounded timeout.
//!
//! # Features
//!
//! - **Chunked assets**: large images travel as chunks and are reassembled in
//!   any order ([`assembler`])
//! - **Deterministic paint order**: one stacking-context pass per batch
//!   ([`stacking`])
//! - **Host-agnostic**: native primitives are created through the
//!   [`scene::SceneHost`] trait
//!
//! # Example
//!
//! ```no_run
//! use rfscene::{pipeline, ProducerConfig, SessionConfig};
//! use rfscene::host::HostServices;
//! use rfscene::producer::CapturedDocument;
//! use rfscene::scene::InMemoryScene;
//!
//! # async fn run(document: CapturedDocument) -> rfscene::Result<()> {
//! let outcome = pipeline::stream_document(
//!     document,
//!     ProducerConfig::default(),
//!     SessionConfig::default(),
//!     InMemoryScene::new(),
//!     HostServices::noop(),
//! )
//! .await?;
//! println!("created {} nodes", outcome.report.stats.nodes_created);
//! print!("{}", outcome.host.dump());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod assembler;
pub mod coordinator;
pub mod host;
pub mod ir;
pub mod pipeline;
pub mod producer;
pub mod protocol;
pub mod scene;
pub mod stacking;

pub use coordinator::{SessionCoordinator, SessionReport, SessionState};
pub use ir::IrNode;
pub use protocol::{Envelope, Message};

/// Configuration for the producing side of a stream
///
/// The defaults keep individual messages small. The transport never has to
/// carry more than one chunk or one batch of nodes at a time.
///
/// # Examples
///
/// ```
/// let cfg = rfscene::ProducerConfig::default();
/// assert_eq!(cfg.batch_size, 50);
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProducerConfig {
    /// Node records per NODES message
    pub batch_size: usize,
    /// Images up to this many bytes travel inline with their node
    pub inline_image_limit: usize,
    /// Size of each IMAGE_CHUNK slice in bytes
    pub chunk_size: usize,
    /// Pause after each NODES batch, in milliseconds
    pub batch_delay_ms: u64,
    /// Pause after each IMAGE_CHUNK, in milliseconds
    pub chunk_delay_ms: u64,
    /// How many assets are hashed and sliced concurrently
    pub encode_concurrency: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            inline_image_limit: 64 * 1024,
            chunk_size: 64 * 1024,
            batch_delay_ms: 10,
            chunk_delay_ms: 2,
            encode_concurrency: num_cpus::get().max(1),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::ConfigError("batch_size must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::ConfigError("chunk_size must be at least 1".into()));
        }
        if u32::try_from(self.chunk_size).is_err() {
            return Err(Error::ConfigError("chunk_size must fit in 32 bits".into()));
        }
        if self.encode_concurrency == 0 {
            return Err(Error::ConfigError("encode_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

/// Configuration for the consuming (reconstructing) side
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Age at which an incomplete asset assembly is evicted, in milliseconds
    pub assembly_timeout_ms: u64,
    /// Upper bound on the wait for pending images after COMPLETE, in milliseconds
    pub drain_timeout_ms: u64,
    /// Sleep between drain polls, in milliseconds
    pub drain_poll_interval_ms: u64,
    /// Streamed assets assembled at once; the oldest is evicted past this
    pub max_in_flight_assets: usize,
    /// Chunk bytes held across all assemblies; the oldest is evicted past this
    pub max_buffered_bytes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            assembly_timeout_ms: assembler::DEFAULT_ASSEMBLY_TIMEOUT.as_millis() as u64,
            drain_timeout_ms: coordinator::DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
            drain_poll_interval_ms: 25,
            max_in_flight_assets: assembler::DEFAULT_MAX_IN_FLIGHT_ASSETS,
            max_buffered_bytes: assembler::DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.assembly_timeout_ms == 0 || self.drain_timeout_ms == 0 {
            return Err(Error::ConfigError("timeouts must be non-zero".into()));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(Error::ConfigError("drain_poll_interval_ms must be non-zero".into()));
        }
        if self.max_in_flight_assets == 0 || self.max_buffered_bytes == 0 {
            return Err(Error::ConfigError("assembly limits must be non-zero".into()));
        }
        Ok(())
    }

    pub fn assembly_timeout(&self) -> Duration {
        Duration::from_millis(self.assembly_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

/// Both halves of the configuration, as read from a config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub producer: ProducerConfig,
    pub session: SessionConfig,
}
