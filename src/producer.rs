//! Producer side of a capture stream.
//!
//! A [`StreamSession`] takes one [`CapturedDocument`] and emits it as
//! messages in a fixed order: TOKENS, FONTS, NODES batches (each followed by
//! a PROGRESS), the IMAGE_CHUNKs of every streamed asset, then COMPLETE.
//!
//! Images above the inline limit are moved out of their node. The node keeps
//! an [`ImageChunkRef`] describing size, chunk count and digest, and the bytes
//! follow as separate chunks. Hashing and slicing run on the blocking pool,
//! a bounded number of assets at a time.

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::ir::{ImageChunkRef, IrNode};
use crate::protocol::{
    CompleteSummary, Envelope, ErrorPayload, FontsPayload, ImageChunk, Message, NodesPayload,
    Progress, TokenMap,
};
use crate::{Error, ProducerConfig, Result};

/// Everything the extractor captured from one page
///
/// Image bytes sit in each node's `inlineImage`; the producer decides which of
/// them are too large to stay inline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedDocument {
    #[serde(default)]
    pub tokens: TokenMap,
    #[serde(default)]
    pub fonts: FontsPayload,
    #[serde(default)]
    pub nodes: Vec<IrNode>,
}

/// What one `stream` call sent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub messages_sent: u64,
    pub node_batches: u64,
    pub chunks_sent: u64,
    /// Assets whose preparation failed; their nodes fall back to placeholders
    pub failed_assets: u64,
    pub complete: CompleteSummary,
}

/// A streamed asset ready to send
#[derive(Debug)]
struct PreparedAsset {
    node_id: String,
    chunks: Vec<Vec<u8>>,
    sha256: String,
}

fn prepare_asset(node_id: String, bytes: Vec<u8>, chunk_size: usize) -> PreparedAsset {
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let chunks = bytes.chunks(chunk_size).map(<[u8]>::to_vec).collect();
    PreparedAsset {
        node_id,
        chunks,
        sha256,
    }
}

/// Chunk reference for `len` bytes cut into `chunk_size` slices
fn chunk_ref(len: usize, chunk_size: usize) -> ImageChunkRef {
    let total_chunks = len.div_ceil(chunk_size).max(1);
    ImageChunkRef {
        total_size: len as u64,
        total_chunks: total_chunks as u32,
        chunk_size: chunk_size as u32,
        sha256: None,
    }
}

/// Emits one captured document as an ordered message stream
pub struct StreamSession {
    config: ProducerConfig,
    next_sequence: u64,
}

impl StreamSession {
    pub fn new(config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            next_sequence: 0,
        })
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Sequence number the next message will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    async fn send(&mut self, tx: &mpsc::Sender<Envelope>, message: Message) -> Result<()> {
        let envelope = Envelope::new(message, self.next_sequence);
        self.next_sequence += 1;
        tx.send(envelope).await.map_err(|_| Error::TransportClosed)
    }

    /// Move oversized images out of their nodes and prepare their chunks.
    ///
    /// Returns prepared assets in node order plus the ids whose preparation
    /// failed. A failed node keeps its chunk reference without a digest, so
    /// the consumer waits for it and falls back to a placeholder.
    async fn prepare_assets(&self, nodes: &mut [IrNode]) -> (Vec<PreparedAsset>, Vec<String>) {
        let limit = self.config.inline_image_limit;
        let chunk_size = self.config.chunk_size;

        let mut jobs = Vec::new();
        for (index, node) in nodes.iter_mut().enumerate() {
            let oversized = node.inline_image.as_ref().is_some_and(|b| b.len() > limit);
            if !oversized {
                continue;
            }
            if let Some(bytes) = node.inline_image.take() {
                node.image_chunk_ref = Some(chunk_ref(bytes.len(), chunk_size));
                jobs.push((index, node.id.clone(), bytes));
            }
        }
        if jobs.is_empty() {
            return (Vec::new(), Vec::new());
        }
        debug!(
            "preparing {} streamed assets with concurrency {}",
            jobs.len(),
            self.config.encode_concurrency
        );

        let results: Vec<_> = stream::iter(jobs)
            .map(|(index, id, bytes)| async move {
                let task_id = id.clone();
                let res =
                    tokio::task::spawn_blocking(move || prepare_asset(task_id, bytes, chunk_size))
                        .await;
                (index, id, res)
            })
            .buffered(self.config.encode_concurrency)
            .collect()
            .await;

        let mut prepared = Vec::new();
        let mut failed = Vec::new();
        for (index, id, res) in results {
            match res {
                Ok(asset) => {
                    if let Some(r) = nodes[index].image_chunk_ref.as_mut() {
                        r.sha256 = Some(asset.sha256.clone());
                    }
                    prepared.push(asset);
                }
                Err(e) => {
                    warn!("failed to prepare asset {id}: {e}");
                    failed.push(id);
                }
            }
        }
        (prepared, failed)
    }

    /// Stream `document` into `tx`.
    ///
    /// Fails with `TransportClosed` as soon as the receiving end is gone.
    pub async fn stream(
        &mut self,
        document: CapturedDocument,
        tx: &mpsc::Sender<Envelope>,
    ) -> Result<StreamSummary> {
        let CapturedDocument {
            tokens,
            fonts,
            mut nodes,
        } = document;
        let first_sequence = self.next_sequence;
        let mut summary = StreamSummary::default();

        let (assets, failed) = self.prepare_assets(&mut nodes).await;
        summary.failed_assets = failed.len() as u64;

        let inline_images = nodes.iter().filter(|n| n.inline_image.is_some()).count() as u64;
        let streamed_images = nodes.iter().filter(|n| n.image_chunk_ref.is_some()).count() as u64;
        summary.complete = CompleteSummary {
            total_nodes: nodes.len() as u64,
            total_images: inline_images + streamed_images,
            inline_images,
            streamed_images,
        };

        self.send(tx, Message::Tokens(tokens)).await?;
        self.send(tx, Message::Fonts(fonts)).await?;

        for id in &failed {
            self.send(
                tx,
                Message::Error(ErrorPayload {
                    message: format!("could not prepare image for {id}"),
                }),
            )
            .await?;
        }

        let total = nodes.len() as u64;
        let mut sent = 0u64;
        for batch in nodes.chunks(self.config.batch_size) {
            self.send(
                tx,
                Message::Nodes(NodesPayload {
                    nodes: batch.to_vec(),
                }),
            )
            .await?;
            sent += batch.len() as u64;
            summary.node_batches += 1;
            self.send(
                tx,
                Message::Progress(Progress {
                    stage: "nodes".into(),
                    current: sent,
                    total,
                }),
            )
            .await?;
            if self.config.batch_delay_ms > 0 {
                tokio::time::sleep(self.config.batch_delay()).await;
            }
        }

        let asset_count = assets.len() as u64;
        for (done, asset) in assets.into_iter().enumerate() {
            let total_chunks = asset.chunks.len() as u32;
            for (index, data) in asset.chunks.into_iter().enumerate() {
                self.send(
                    tx,
                    Message::ImageChunk(ImageChunk {
                        node_id: asset.node_id.clone(),
                        chunk_index: index as u32,
                        total_chunks,
                        data,
                    }),
                )
                .await?;
                summary.chunks_sent += 1;
                if self.config.chunk_delay_ms > 0 {
                    tokio::time::sleep(self.config.chunk_delay()).await;
                }
            }
            self.send(
                tx,
                Message::Progress(Progress {
                    stage: "images".into(),
                    current: done as u64 + 1,
                    total: asset_count,
                }),
            )
            .await?;
        }

        self.send(tx, Message::Complete(summary.complete)).await?;
        summary.messages_sent = self.next_sequence - first_sequence;
        info!(
            "streamed {} nodes in {} batches, {} chunks, {} messages",
            total, summary.node_batches, summary.chunks_sent, summary.messages_sent
        );
        Ok(summary)
    }
}
