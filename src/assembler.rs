//! Reassembly of chunked binary assets.
//!
//! Chunks for one asset may arrive in any order, more than once, or not at
//! all. An [`AssetChunkAssembler`] keeps one sparse record per in-flight
//! asset. The caller either takes the completed bytes out (`assemble`) or
//! receives the id back from `evict_expired` once the record is too old.
//! The table is bounded by a count of in-flight assets and a budget of
//! buffered bytes. Going over either evicts the oldest record, and its id
//! comes back from `take_overflowed`. Each record leaves the table exactly
//! once, by one of those paths.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{Error, Result};

/// How long an incomplete assembly is kept before eviction
pub const DEFAULT_ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Assets assembled at once before the oldest is pushed out
pub const DEFAULT_MAX_IN_FLIGHT_ASSETS: usize = 256;

/// Chunk bytes held across all assemblies before the oldest is pushed out
pub const DEFAULT_MAX_BUFFERED_BYTES: u64 = 256 * 1024 * 1024;

/// Result of feeding one chunk to the assembler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; more chunks are still missing
    Pending { received: u32, total: u32 },
    /// This index was already present and the chunk was ignored
    Duplicate,
    /// Every index is now present
    Complete,
    /// The asset alone is over the byte budget; its record was dropped
    Dropped,
}

/// In-flight state of one asset
#[derive(Debug)]
pub struct AssetAssembly {
    chunks: BTreeMap<u32, Vec<u8>>,
    total_chunks: u32,
    received_chunks: u32,
    bytes: u64,
    created_at: Instant,
}

impl AssetAssembly {
    fn new(total_chunks: u32, now: Instant) -> Self {
        Self {
            chunks: BTreeMap::new(),
            total_chunks,
            received_chunks: 0,
            bytes: 0,
            created_at: now,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn received_chunks(&self) -> u32 {
        self.received_chunks
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks
    }

    /// Bytes held by the chunks received so far
    pub fn buffered_bytes(&self) -> u64 {
        self.bytes
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total_chunks).filter(|i| !self.chunks.contains_key(i))
    }
}

/// Table of in-flight asset assemblies keyed by asset (node) id
#[derive(Debug)]
pub struct AssetChunkAssembler {
    assemblies: HashMap<String, AssetAssembly>,
    /// Announced size and when it was announced
    declared_sizes: HashMap<String, (u64, Instant)>,
    timeout: Duration,
    max_in_flight: usize,
    max_buffered_bytes: u64,
    buffered_bytes: u64,
    overflowed: Vec<String>,
}

impl Default for AssetChunkAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_ASSEMBLY_TIMEOUT)
    }
}

impl AssetChunkAssembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            assemblies: HashMap::new(),
            declared_sizes: HashMap::new(),
            timeout,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT_ASSETS,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            buffered_bytes: 0,
            overflowed: Vec::new(),
        }
    }

    /// Replace the in-flight count and byte budget. Zero is treated as one.
    pub fn with_limits(mut self, max_in_flight: usize, max_buffered_bytes: u64) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self.max_buffered_bytes = max_buffered_bytes.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of assets currently being assembled
    pub fn in_flight(&self) -> usize {
        self.assemblies.len()
    }

    /// Chunk bytes currently held across every assembly
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// Number of announced sizes still on record
    pub fn declared(&self) -> usize {
        self.declared_sizes.len()
    }

    pub fn get(&self, asset_id: &str) -> Option<&AssetAssembly> {
        self.assemblies.get(asset_id)
    }

    /// Record the byte size the producer announced for an asset.
    ///
    /// May be called before or after the first chunk arrives. `assemble`
    /// refuses to hand out a buffer whose length disagrees with it. An
    /// announcement that no chunk follows within the timeout is forgotten.
    pub fn declare_total_size(&mut self, asset_id: &str, total_size: u64) {
        self.declare_total_size_at(asset_id, total_size, Instant::now());
    }

    pub fn declare_total_size_at(&mut self, asset_id: &str, total_size: u64, now: Instant) {
        self.declared_sizes
            .insert(asset_id.to_string(), (total_size, now));
    }

    /// Store one chunk, stamping a new record with the current time
    pub fn add_chunk(
        &mut self,
        asset_id: &str,
        chunk_index: u32,
        bytes: Vec<u8>,
        total_chunks: u32,
    ) -> Result<ChunkOutcome> {
        self.add_chunk_at(asset_id, chunk_index, bytes, total_chunks, Instant::now())
    }

    /// Store one chunk; `now` stamps the record if this is the first chunk
    pub fn add_chunk_at(
        &mut self,
        asset_id: &str,
        chunk_index: u32,
        bytes: Vec<u8>,
        total_chunks: u32,
        now: Instant,
    ) -> Result<ChunkOutcome> {
        if total_chunks == 0 {
            return Err(Error::InvalidChunk {
                asset_id: asset_id.to_string(),
                reason: "totalChunks is 0".to_string(),
            });
        }
        if chunk_index >= total_chunks {
            return Err(Error::InvalidChunk {
                asset_id: asset_id.to_string(),
                reason: format!("index {chunk_index} out of range for {total_chunks} chunks"),
            });
        }

        if !self.assemblies.contains_key(asset_id) {
            while self.assemblies.len() >= self.max_in_flight {
                let Some(oldest) = self.oldest_except(asset_id) else {
                    break;
                };
                self.overflow(&oldest, "too many assets in flight");
            }
            self.assemblies
                .insert(asset_id.to_string(), AssetAssembly::new(total_chunks, now));
        }
        let Some(assembly) = self.assemblies.get_mut(asset_id) else {
            return Err(Error::Other(format!("no assembly in flight for {asset_id}")));
        };

        if assembly.total_chunks != total_chunks {
            return Err(Error::InvalidChunk {
                asset_id: asset_id.to_string(),
                reason: format!(
                    "totalChunks changed from {} to {}",
                    assembly.total_chunks, total_chunks
                ),
            });
        }

        if assembly.chunks.contains_key(&chunk_index) {
            debug!("duplicate chunk {chunk_index} for asset {asset_id} ignored");
            return Ok(ChunkOutcome::Duplicate);
        }
        let len = bytes.len() as u64;
        assembly.chunks.insert(chunk_index, bytes);
        assembly.received_chunks += 1;
        assembly.bytes += len;
        let outcome = if assembly.is_complete() {
            ChunkOutcome::Complete
        } else {
            ChunkOutcome::Pending {
                received: assembly.received_chunks,
                total: assembly.total_chunks,
            }
        };

        self.buffered_bytes += len;
        while self.buffered_bytes > self.max_buffered_bytes {
            match self.oldest_except(asset_id) {
                Some(oldest) => self.overflow(&oldest, "buffered bytes over budget"),
                None => {
                    self.overflow(asset_id, "asset alone exceeds the byte budget");
                    return Ok(ChunkOutcome::Dropped);
                }
            }
        }
        Ok(outcome)
    }

    /// Oldest record other than `keep`, ties broken by id
    fn oldest_except(&self, keep: &str) -> Option<String> {
        self.assemblies
            .iter()
            .filter(|(id, _)| id.as_str() != keep)
            .min_by(|(a_id, a), (b_id, b)| a.created_at.cmp(&b.created_at).then_with(|| a_id.cmp(b_id)))
            .map(|(id, _)| id.clone())
    }

    fn overflow(&mut self, asset_id: &str, reason: &str) {
        if let Some(a) = self.remove(asset_id) {
            warn!(
                "evicting asset {asset_id} ({reason}): {}/{} chunks, {} bytes",
                a.received_chunks, a.total_chunks, a.bytes
            );
            self.overflowed.push(asset_id.to_string());
        }
        self.declared_sizes.remove(asset_id);
    }

    fn remove(&mut self, asset_id: &str) -> Option<AssetAssembly> {
        let assembly = self.assemblies.remove(asset_id)?;
        self.buffered_bytes = self.buffered_bytes.saturating_sub(assembly.bytes);
        Some(assembly)
    }

    /// Ids evicted by the in-flight or byte limits since the last call
    pub fn take_overflowed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.overflowed)
    }

    pub fn is_complete(&self, asset_id: &str) -> bool {
        self.assemblies
            .get(asset_id)
            .is_some_and(AssetAssembly::is_complete)
    }

    /// Concatenate the chunks of a complete asset and remove its record.
    ///
    /// An incomplete asset yields `AssemblyIncomplete` and is left untouched
    /// so the call can be retried later. A size disagreement is final: the
    /// record is dropped and `SizeMismatch` is returned.
    pub fn assemble(&mut self, asset_id: &str) -> Result<Vec<u8>> {
        let assembly = self
            .assemblies
            .get(asset_id)
            .ok_or_else(|| Error::Other(format!("no assembly in flight for {asset_id}")))?;

        if let Some(first_missing) = assembly.missing().next() {
            debug!("asset {asset_id} still missing chunk {first_missing}");
            return Err(Error::AssemblyIncomplete {
                asset_id: asset_id.to_string(),
                received: assembly.received_chunks,
                total: assembly.total_chunks,
            });
        }

        let Some(assembly) = self.remove(asset_id) else {
            return Err(Error::Other(format!("no assembly in flight for {asset_id}")));
        };
        let declared = self.declared_sizes.remove(asset_id).map(|(size, _)| size);

        let len: usize = assembly.chunks.values().map(Vec::len).sum();
        if let Some(declared) = declared {
            if declared != len as u64 {
                warn!("asset {asset_id}: declared {declared} bytes but chunks hold {len}");
                return Err(Error::SizeMismatch {
                    asset_id: asset_id.to_string(),
                    declared,
                    actual: len as u64,
                });
            }
        }

        let mut buffer = Vec::with_capacity(len);
        for chunk in assembly.chunks.into_values() {
            buffer.extend_from_slice(&chunk);
        }
        debug!(
            "assembled asset {asset_id}: {} chunks, {} bytes",
            assembly.total_chunks,
            buffer.len()
        );
        Ok(buffer)
    }

    /// Drop every record older than the timeout, returning the evicted ids
    /// sorted for deterministic fallback handling. Announced sizes that no
    /// chunk followed within the timeout are dropped too, silently.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let mut expired: Vec<String> = self
            .assemblies
            .iter()
            .filter(|(_, a)| a.age(now) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        for id in &expired {
            if let Some(a) = self.remove(id) {
                warn!(
                    "evicting asset {id} after {:?}: {}/{} chunks received",
                    a.age(now),
                    a.received_chunks,
                    a.total_chunks
                );
            }
            self.declared_sizes.remove(id);
        }

        let assemblies = &self.assemblies;
        self.declared_sizes.retain(|id, (_, at)| {
            assemblies.contains_key(id) || now.saturating_duration_since(*at) < timeout
        });
        expired
    }

    /// Forget one asset without assembling it
    pub fn discard(&mut self, asset_id: &str) -> bool {
        self.declared_sizes.remove(asset_id);
        self.remove(asset_id).is_some()
    }

    pub fn clear(&mut self) {
        self.assemblies.clear();
        self.declared_sizes.clear();
        self.overflowed.clear();
        self.buffered_bytes = 0;
    }
}
