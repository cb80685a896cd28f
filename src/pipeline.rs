//! Running a reconstruction session on a background task.
//!
//! [`spawn_session`] moves a [`SessionCoordinator`] onto its own tokio task
//! and hands back a [`SessionHandle`] holding the sending end of its input
//! channel. Any number of producers can send through clones of the sender.
//! Finishing the handle closes the channel and waits for the session report.

use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordinator::{SessionCoordinator, SessionReport};
use crate::host::HostServices;
use crate::producer::{CapturedDocument, StreamSession, StreamSummary};
use crate::protocol::Envelope;
use crate::scene::SceneHost;
use crate::{Error, ProducerConfig, Result, SessionConfig};

/// Default capacity of a session's input channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Handle to a session running on a background task
pub struct SessionHandle<H: SceneHost> {
    tx: mpsc::Sender<Envelope>,
    task: JoinHandle<(SessionReport, H)>,
}

/// Start a session that consumes envelopes until COMPLETE (plus drain) or
/// until every sender is dropped.
pub fn spawn_session<H>(
    config: SessionConfig,
    host: H,
    services: HostServices,
    capacity: usize,
) -> Result<SessionHandle<H>>
where
    H: SceneHost + 'static,
{
    let mut coordinator = SessionCoordinator::new(config, host, services)?;
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));

    let task = tokio::spawn(async move {
        let report = coordinator.run(&mut rx).await;
        debug!("session task finished after {} messages", report.messages);
        (report, coordinator.into_host())
    });

    Ok(SessionHandle { tx, task })
}

impl<H: SceneHost + 'static> SessionHandle<H> {
    /// Another sender for the session's input
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.tx.clone()
    }

    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| Error::TransportClosed)
    }

    /// Close this handle's sender and wait for the session to end
    pub async fn finish(self) -> Result<(SessionReport, H)> {
        drop(self.tx);
        self.task
            .await
            .map_err(|e| Error::Other(format!("session task failed: {}", e)))
    }
}

/// Everything produced by [`stream_document`]
#[derive(Debug, Serialize)]
pub struct PipelineOutcome<H> {
    pub summary: StreamSummary,
    pub report: SessionReport,
    pub host: H,
}

/// Stream `document` straight into a new session built on `host`
pub async fn stream_document<H>(
    document: CapturedDocument,
    producer_config: ProducerConfig,
    session_config: SessionConfig,
    host: H,
    services: HostServices,
) -> Result<PipelineOutcome<H>>
where
    H: SceneHost + 'static,
{
    let handle = spawn_session(session_config, host, services, DEFAULT_CHANNEL_CAPACITY)?;
    let mut producer = StreamSession::new(producer_config)?;
    let tx = handle.sender();
    let summary = producer.stream(document, &tx).await?;
    drop(tx);

    let (report, host) = handle.finish().await?;
    Ok(PipelineOutcome {
        summary,
        report,
        host,
    })
}
