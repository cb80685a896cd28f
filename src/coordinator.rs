//! Consumer side of a capture stream.
//!
//! [`SessionCoordinator`] owns every piece of per-session state: the node
//! lookup table, nodes deferred on streamed images, the chunk assembler and
//! the scene builder. Messages are applied one at a time. A failure while
//! handling one message is logged and reported as a notice, and the session
//! carries on.
//!
//! Lifecycle:
//!
//! ```text
//! Idle --TOKENS--> Receiving --COMPLETE--> Draining --drain()--> Completed
//!                      ^                                            |
//!                      +-------------------TOKENS-------------------+
//! ```
//!
//! A TOKENS message always starts a fresh session: tables from the previous
//! one are dropped, not merged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::assembler::{AssetChunkAssembler, ChunkOutcome};
use crate::host::{HostServices, Notice};
use crate::ir::IrNode;
use crate::protocol::{
    CompleteSummary, Envelope, ErrorPayload, FontsPayload, ImageChunk, Message, Progress, TokenMap,
};
use crate::scene::{BuildStats, HostHandle, SceneGraphBuilder, SceneHost};
use crate::stacking::StackingOrderResolver;
use crate::{Error, Result, SessionConfig};

/// Default upper bound on the post-COMPLETE wait for pending images
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Receiving,
    Draining,
    Completed,
}

/// Counters for one session, returned when it completes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionReport {
    pub stats: BuildStats,
    pub messages: u64,
    pub nodes_received: u64,
    pub duplicate_nodes: u64,
    pub images_assembled: u64,
    /// Streamed images replaced by placeholders
    pub asset_failures: u64,
    /// Chunks for assets that were already resolved
    pub late_chunks: u64,
    pub fonts_loaded: u64,
    pub font_failures: u64,
    pub decode_errors: u64,
    pub handler_errors: u64,
    /// Messages whose sequence number was not above the previous one
    pub out_of_order: u64,
    pub ignored_messages: u64,
    /// ERROR messages sent by the producer
    pub producer_errors: Vec<String>,
    /// Totals the producer declared in COMPLETE, if it got that far
    pub declared: Option<CompleteSummary>,
    /// Nodes still waiting on image bytes when the report was taken
    pub pending_images: usize,
}

/// State dropped wholesale when a new session starts
struct SessionTables {
    lookup: HashMap<String, IrNode>,
    pending: BTreeMap<String, IrNode>,
    resolved_assets: HashSet<String>,
    assembler: AssetChunkAssembler,
    builder: SceneGraphBuilder,
    last_sequence: Option<u64>,
    report: SessionReport,
}

impl SessionTables {
    fn new(config: &SessionConfig) -> Self {
        Self {
            lookup: HashMap::new(),
            pending: BTreeMap::new(),
            resolved_assets: HashSet::new(),
            assembler: AssetChunkAssembler::new(config.assembly_timeout())
                .with_limits(config.max_in_flight_assets, config.max_buffered_bytes),
            builder: SceneGraphBuilder::new(),
            last_sequence: None,
            report: SessionReport::default(),
        }
    }
}

/// Rebuilds a scene in `H` from an ordered message stream
pub struct SessionCoordinator<H: SceneHost> {
    config: SessionConfig,
    state: SessionState,
    host: H,
    services: HostServices,
    resolver: StackingOrderResolver,
    session: SessionTables,
}

impl<H: SceneHost> SessionCoordinator<H> {
    pub fn new(config: SessionConfig, host: H, services: HostServices) -> Result<Self> {
        config.validate()?;
        let session = SessionTables::new(&config);
        Ok(Self {
            config,
            state: SessionState::Idle,
            host,
            services,
            resolver: StackingOrderResolver::new(),
            session,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    /// A node received in the current session
    pub fn node(&self, id: &str) -> Option<&IrNode> {
        self.session.lookup.get(id)
    }

    /// Host handle of a materialized node
    pub fn handle(&self, id: &str) -> Option<HostHandle> {
        self.session.builder.handle(id)
    }

    /// Session-wide paint index of a received node. Deferred image nodes
    /// have theirs from the moment their batch arrives.
    pub fn paint_order(&self, id: &str) -> Option<u64> {
        self.session.builder.paint_order(id)
    }

    pub fn pending_images(&self) -> usize {
        self.session.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.session.pending.contains_key(id)
    }

    /// Snapshot of the current session's counters
    pub fn report(&self) -> SessionReport {
        let mut report = self.session.report.clone();
        report.stats = self.session.builder.stats().clone();
        report.pending_images = self.session.pending.len();
        report
    }

    /// Decode one raw message and apply it. Undecodable input is counted and
    /// reported but never stops the session.
    pub fn process_json(&mut self, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => self.process(envelope),
            Err(e) => {
                self.session.report.decode_errors += 1;
                error!("dropping undecodable message: {e}");
                self.services
                    .notifier
                    .notify(&Notice::error(format!("Received a malformed message: {e}")));
            }
        }
    }

    /// Apply one message, then evict asset assemblies past their timeout or
    /// over the assembler's limits
    pub fn process(&mut self, envelope: Envelope) {
        let Envelope {
            message,
            sequence_number,
            ..
        } = envelope;
        let label = message.to_string();
        let starts_session = matches!(message, Message::Tokens(_));

        if !starts_session {
            self.check_sequence(sequence_number);
        }
        if let Err(e) = self.dispatch(message) {
            self.session.report.handler_errors += 1;
            error!("failed to handle {label}: {e}");
            self.services
                .notifier
                .notify(&Notice::error(format!("Could not process {label}: {e}")));
        }
        self.session.report.messages += 1;
        let last = self.session.last_sequence.get_or_insert(sequence_number);
        *last = (*last).max(sequence_number);

        self.evict_expired(Instant::now());
    }

    fn check_sequence(&mut self, sequence_number: u64) {
        if let Some(last) = self.session.last_sequence {
            if sequence_number <= last {
                self.session.report.out_of_order += 1;
                debug!("sequence {sequence_number} arrived after {last}");
            }
        }
    }

    fn dispatch(&mut self, message: Message) -> Result<()> {
        if !matches!(message, Message::Tokens(_)) {
            match self.state {
                SessionState::Idle => {
                    warn!("{} before TOKENS; opening session implicitly", message.kind());
                    self.state = SessionState::Receiving;
                }
                SessionState::Completed => {
                    warn!("ignoring {} after session completed", message.kind());
                    self.session.report.ignored_messages += 1;
                    return Ok(());
                }
                SessionState::Receiving | SessionState::Draining => {}
            }
        }

        match message {
            Message::Tokens(tokens) => self.on_tokens(tokens),
            Message::Fonts(fonts) => self.on_fonts(fonts),
            Message::Nodes(payload) => self.on_nodes(payload.nodes),
            Message::ImageChunk(chunk) => self.on_image_chunk(chunk),
            Message::Progress(p) => self.on_progress(p),
            Message::Error(p) => self.on_producer_error(p),
            Message::Complete(summary) => self.on_complete(summary),
            Message::Unknown { kind } => {
                debug!("ignoring unknown message type {kind}");
                self.session.report.ignored_messages += 1;
                Ok(())
            }
        }
    }

    fn on_tokens(&mut self, tokens: TokenMap) -> Result<()> {
        if self.state != SessionState::Idle {
            info!("TOKENS received; resetting session state");
        }
        self.session = SessionTables::new(&self.config);
        self.state = SessionState::Receiving;

        match self.services.tokens.register(&tokens) {
            Ok(count) => debug!("registered {count} design tokens"),
            Err(reason) => {
                warn!("token registration failed: {reason}");
                self.services
                    .notifier
                    .notify(&Notice::warning(format!("Design tokens not registered: {reason}")));
            }
        }
        Ok(())
    }

    fn on_fonts(&mut self, fonts: FontsPayload) -> Result<()> {
        for font in &fonts.fonts {
            match self.services.fonts.load(font) {
                Ok(()) => self.session.report.fonts_loaded += 1,
                Err(reason) => {
                    self.session.report.font_failures += 1;
                    warn!("font {} {} unavailable: {reason}", font.family, font.style);
                    self.services.notifier.notify(&Notice::warning(format!(
                        "Font {} {} could not be loaded",
                        font.family, font.style
                    )));
                }
            }
        }
        Ok(())
    }

    fn on_nodes(&mut self, nodes: Vec<IrNode>) -> Result<()> {
        self.session.report.nodes_received += nodes.len() as u64;

        let mut accepted = Vec::with_capacity(nodes.len());
        for node in nodes {
            if self.session.lookup.contains_key(&node.id) {
                self.session.report.duplicate_nodes += 1;
                warn!("duplicate node id {}; keeping the first", node.id);
                continue;
            }
            self.session.lookup.insert(node.id.clone(), node.clone());
            accepted.push(node);
        }

        // Deferred nodes get their order now, with the rest of the batch
        let order = self.resolver.resolve(&accepted);
        self.session.builder.assign_paint_order(&order);

        let mut ready = Vec::with_capacity(accepted.len());
        for node in accepted {
            if !node.awaits_streamed_image() {
                ready.push(node);
                continue;
            }
            if let Some(r) = &node.image_chunk_ref {
                self.session.assembler.declare_total_size(&node.id, r.total_size);
            }
            if self.session.resolved_assets.contains(&node.id) {
                // chunks were already evicted before the node showed up
                ready.push(self.substitute_placeholder(&node, Error::AssemblyTimeout(node.id.clone())));
            } else if self.session.assembler.is_complete(&node.id) {
                ready.push(self.resolve_image(node));
            } else {
                debug!("deferring {} until its image arrives", node.id);
                self.session.pending.insert(node.id.clone(), node);
            }
        }

        self.materialize(ready);
        Ok(())
    }

    fn on_image_chunk(&mut self, chunk: ImageChunk) -> Result<()> {
        let ImageChunk {
            node_id,
            chunk_index,
            total_chunks,
            data,
        } = chunk;
        if self.session.resolved_assets.contains(&node_id) {
            self.session.report.late_chunks += 1;
            debug!("ignoring chunk {chunk_index} for resolved asset {node_id}");
            return Ok(());
        }

        let outcome = self
            .session
            .assembler
            .add_chunk(&node_id, chunk_index, data, total_chunks)?;
        // a dropped asset comes back through `evict_expired`
        if outcome != ChunkOutcome::Complete {
            return Ok(());
        }

        // A complete asset whose node hasn't arrived yet waits in the
        // assembler; `on_nodes` picks it up.
        if let Some(node) = self.session.pending.remove(&node_id) {
            let ready = self.resolve_image(node);
            self.materialize(vec![ready]);
        }
        Ok(())
    }

    fn on_progress(&mut self, progress: Progress) -> Result<()> {
        debug!(
            "producer progress {}: {}/{}",
            progress.stage, progress.current, progress.total
        );
        self.services.notifier.notify(&Notice::info(format!(
            "Importing {}: {}/{}",
            progress.stage, progress.current, progress.total
        )));
        Ok(())
    }

    fn on_producer_error(&mut self, payload: ErrorPayload) -> Result<()> {
        warn!("producer reported: {}", payload.message);
        self.services
            .notifier
            .notify(&Notice::warning(payload.message.clone()));
        self.session.report.producer_errors.push(payload.message);
        Ok(())
    }

    fn on_complete(&mut self, summary: CompleteSummary) -> Result<()> {
        info!(
            "COMPLETE: {} nodes declared, {} images pending",
            summary.total_nodes,
            self.session.pending.len()
        );
        self.session.report.declared = Some(summary);
        self.state = SessionState::Draining;
        Ok(())
    }

    /// Assemble and verify the bytes for `node`, or fall back to a placeholder
    fn resolve_image(&mut self, node: IrNode) -> IrNode {
        match self.take_image(&node) {
            Ok(bytes) => {
                self.session.resolved_assets.insert(node.id.clone());
                self.session.report.images_assembled += 1;
                node.with_image(bytes)
            }
            Err(e) => {
                if !e.is_asset_failure() {
                    error!("unexpected failure assembling {}: {e}", node.id);
                }
                self.session.assembler.discard(&node.id);
                self.substitute_placeholder(&node, e)
            }
        }
    }

    fn take_image(&mut self, node: &IrNode) -> Result<Vec<u8>> {
        if let Some(r) = &node.image_chunk_ref {
            self.session.assembler.declare_total_size(&node.id, r.total_size);
        }
        let bytes = self.session.assembler.assemble(&node.id)?;
        if let Some(expected) = node.image_chunk_ref.as_ref().and_then(|r| r.sha256.as_deref()) {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(Error::DigestMismatch(node.id.clone()));
            }
        }
        Ok(bytes)
    }

    fn substitute_placeholder(&mut self, node: &IrNode, cause: Error) -> IrNode {
        warn!("{cause}; using placeholder for {}", node.id);
        self.services.notifier.notify(&Notice::warning(format!(
            "Image for {} replaced by a placeholder",
            node.id
        )));
        self.session.resolved_assets.insert(node.id.clone());
        self.session.report.asset_failures += 1;
        node.placeholder()
    }

    /// Create `nodes` in the host at the paint orders their batch was given
    fn materialize(&mut self, nodes: Vec<IrNode>) {
        if nodes.is_empty() {
            return;
        }
        let root = self.host.root();
        let result = self
            .session
            .builder
            .materialize(&nodes, root, &mut self.host);
        if result.failed > 0 {
            self.services.notifier.notify(&Notice::error(format!(
                "{} nodes could not be created",
                result.failed
            )));
        }
        debug!(
            "materialized batch: {} created, {} orphans",
            result.created, result.orphans
        );
    }

    /// Replace pending nodes whose assembly outlived the timeout or was
    /// pushed out by the assembler's limits
    pub fn evict_expired(&mut self, now: Instant) {
        let mut evicted: Vec<(String, Error)> = self
            .session
            .assembler
            .take_overflowed()
            .into_iter()
            .map(|id| {
                let cause = Error::AssemblyOverflow(id.clone());
                (id, cause)
            })
            .collect();
        evicted.extend(self.session.assembler.evict_expired(now).into_iter().map(|id| {
            let cause = Error::AssemblyTimeout(id.clone());
            (id, cause)
        }));
        if evicted.is_empty() {
            return;
        }
        let mut ready = Vec::new();
        for (id, cause) in evicted {
            match self.session.pending.remove(&id) {
                Some(node) => ready.push(self.substitute_placeholder(&node, cause)),
                None => {
                    debug!("{cause}; node not received yet");
                    self.session.resolved_assets.insert(id);
                }
            }
        }
        self.materialize(ready);
    }

    /// Turn every still-pending node into a placeholder and close the session
    fn finalize(&mut self) -> SessionReport {
        let pending = std::mem::take(&mut self.session.pending);
        let mut ready = Vec::with_capacity(pending.len());
        for (id, node) in pending {
            self.session.assembler.discard(&id);
            ready.push(self.substitute_placeholder(&node, Error::AssemblyTimeout(id)));
        }
        self.materialize(ready);
        self.session.assembler.clear();

        if let Some(declared) = self.session.report.declared {
            if declared.total_nodes != self.session.report.nodes_received {
                warn!(
                    "producer declared {} nodes but {} arrived",
                    declared.total_nodes, self.session.report.nodes_received
                );
                self.services.notifier.notify(&Notice::warning(format!(
                    "Expected {} nodes, received {}",
                    declared.total_nodes, self.session.report.nodes_received
                )));
            }
        }

        self.state = SessionState::Completed;
        let report = self.report();
        info!(
            "session complete: {} nodes created, {} placeholders, {} orphans",
            report.stats.nodes_created, report.stats.placeholders, report.stats.orphans
        );
        self.services.notifier.notify(&Notice::info(format!(
            "Imported {} nodes",
            report.stats.nodes_created
        )));
        report
    }

    /// Wait up to the drain timeout for pending images, then substitute
    /// placeholders for whatever is still missing.
    ///
    /// Without an input channel nothing new can arrive here, but assemblies
    /// that expire during the wait are still replaced as they expire. A
    /// session that already completed is not finalized again.
    pub async fn drain(&mut self) -> SessionReport {
        if self.state == SessionState::Completed {
            debug!("session already completed; nothing to drain");
            return self.report();
        }
        if self.state == SessionState::Receiving {
            warn!("draining a session that never received COMPLETE");
        }
        self.state = SessionState::Draining;
        let deadline = Instant::now() + self.config.drain_timeout();
        while !self.session.pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.config.drain_poll_interval().min(deadline - now)).await;
            self.evict_expired(Instant::now());
        }
        self.finalize()
    }

    /// Consume envelopes from `rx` until the session completes or the
    /// channel closes.
    ///
    /// After COMPLETE, late chunks keep being applied until every pending
    /// image resolves or the drain timeout passes.
    pub async fn run(&mut self, rx: &mut mpsc::Receiver<Envelope>) -> SessionReport {
        loop {
            match rx.recv().await {
                Some(envelope) => self.process(envelope),
                None => {
                    if self.state == SessionState::Completed {
                        return self.report();
                    }
                    warn!("transport closed before COMPLETE");
                    return self.finalize();
                }
            }
            if self.state == SessionState::Draining && self.drain_from(rx).await {
                return self.finalize();
            }
        }
    }

    /// Keep applying input while images are pending after COMPLETE. Returns
    /// false when a TOKENS message restarted the session mid-drain.
    async fn drain_from(&mut self, rx: &mut mpsc::Receiver<Envelope>) -> bool {
        let deadline = Instant::now() + self.config.drain_timeout();
        let mut input_open = true;
        while !self.session.pending.is_empty() && input_open {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.config.drain_poll_interval().min(deadline - now);
            tokio::select! {
                next = rx.recv() => match next {
                    Some(envelope) => self.process(envelope),
                    None => input_open = false,
                },
                _ = tokio::time::sleep(wait) => self.evict_expired(Instant::now()),
            }
            if self.state != SessionState::Draining {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{NoticeLevel, RecordingFontLoader, RecordingNotifier, RecordingTokenRegistry};
    use crate::ir::{ImageChunkRef, NodeKind};
    use crate::protocol::{FontRequest, NodesPayload};
    use crate::scene::InMemoryScene;

    struct Fixture {
        coordinator: SessionCoordinator<InMemoryScene>,
        notices: RecordingNotifier,
        tokens: RecordingTokenRegistry,
        fonts: RecordingFontLoader,
        seq: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(SessionConfig::default())
        }

        fn with_config(config: SessionConfig) -> Self {
            let notices = RecordingNotifier::new();
            let tokens = RecordingTokenRegistry::new();
            let fonts = RecordingFontLoader::new().with_unavailable("Missing Sans");
            let services = HostServices::new(
                Box::new(tokens.clone()),
                Box::new(fonts.clone()),
                Box::new(notices.clone()),
            );
            let coordinator =
                SessionCoordinator::new(config, InMemoryScene::new(), services).unwrap();
            Self {
                coordinator,
                notices,
                tokens,
                fonts,
                seq: 0,
            }
        }

        fn send(&mut self, message: Message) {
            let env = Envelope::new(message, self.seq);
            self.seq += 1;
            self.coordinator.process(env);
        }

        fn start(&mut self) {
            self.send(Message::Tokens(TokenMap::new()));
        }

        fn nodes(&mut self, nodes: Vec<IrNode>) {
            self.send(Message::Nodes(NodesPayload { nodes }));
        }

        fn chunk(&mut self, id: &str, index: u32, total: u32, data: &[u8]) {
            self.send(Message::ImageChunk(ImageChunk {
                node_id: id.into(),
                chunk_index: index,
                total_chunks: total,
                data: data.to_vec(),
            }));
        }
    }

    fn frame(id: &str, parent: Option<&str>) -> IrNode {
        IrNode::new(id, parent)
    }

    fn streamed(id: &str, parent: &str, total_size: u64, chunk_size: u32) -> IrNode {
        let mut n = IrNode::new(id, Some(parent));
        n.kind = NodeKind::Image;
        n.image_chunk_ref = Some(ImageChunkRef {
            total_size,
            total_chunks: total_size.div_ceil(u64::from(chunk_size)).max(1) as u32,
            chunk_size,
            sha256: None,
        });
        n
    }

    #[test]
    fn parent_in_later_batch_leaves_child_orphaned() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![frame("child", Some("parent"))]);
        f.nodes(vec![frame("parent", None)]);

        let scene = f.coordinator.host();
        assert_eq!(scene.find("child").unwrap().parent, Some(scene.root_handle()));
        assert_eq!(scene.find("parent").unwrap().parent, Some(scene.root_handle()));
        assert_eq!(f.coordinator.report().stats.orphans, 1);
    }

    #[test]
    fn streamed_image_materializes_once_chunks_arrive() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![frame("page", None), streamed("hero", "page", 10, 4)]);
        assert!(f.coordinator.is_pending("hero"));
        assert!(f.coordinator.host().find("hero").is_none());

        f.chunk("hero", 2, 3, &[8, 9]);
        f.chunk("hero", 0, 3, &[0, 1, 2, 3]);
        f.chunk("hero", 1, 3, &[4, 5, 6, 7]);

        let scene = f.coordinator.host();
        let hero = scene.find("hero").unwrap();
        assert_eq!(hero.image_len, Some(10));
        assert_eq!(hero.parent, f.coordinator.handle("page"));
        assert_eq!(f.coordinator.pending_images(), 0);
        assert_eq!(f.coordinator.report().images_assembled, 1);
    }

    #[test]
    fn chunks_before_node_are_used_when_node_arrives() {
        let mut f = Fixture::new();
        f.start();
        f.chunk("logo", 0, 1, &[1, 2, 3]);
        f.nodes(vec![frame("page", None), streamed("logo", "page", 3, 4)]);

        assert_eq!(f.coordinator.host().find("logo").unwrap().image_len, Some(3));
        assert_eq!(f.coordinator.pending_images(), 0);
    }

    #[test]
    fn size_mismatch_becomes_placeholder() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![streamed("img", "page", 8, 4)]);
        f.chunk("img", 0, 2, &[0; 4]);
        f.chunk("img", 1, 2, &[0; 3]);

        let entry = f.coordinator.host().find("img").unwrap();
        assert_eq!(entry.kind, NodeKind::Placeholder);
        assert_eq!(f.coordinator.report().asset_failures, 1);
        assert_eq!(f.notices.count(NoticeLevel::Warning), 1);
    }

    #[test]
    fn digest_mismatch_becomes_placeholder() {
        let mut f = Fixture::new();
        f.start();
        let mut img = streamed("img", "page", 2, 4);
        if let Some(r) = img.image_chunk_ref.as_mut() {
            r.sha256 = Some(hex::encode(Sha256::digest([9u8, 9])));
        }
        f.nodes(vec![img]);
        f.chunk("img", 0, 1, &[1, 2]);
        assert_eq!(f.coordinator.host().find("img").unwrap().kind, NodeKind::Placeholder);
    }

    #[test]
    fn late_chunks_for_resolved_asset_are_ignored() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![streamed("img", "page", 2, 4)]);
        f.chunk("img", 0, 1, &[1, 2]);
        f.chunk("img", 0, 1, &[1, 2]);
        assert_eq!(f.coordinator.report().late_chunks, 1);
        assert_eq!(f.coordinator.host().len(), 1);
    }

    #[test]
    fn tokens_reset_session_tables() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![frame("a", None), streamed("img", "a", 10, 4)]);
        assert_eq!(f.coordinator.pending_images(), 1);

        f.start();
        assert_eq!(f.coordinator.state(), SessionState::Receiving);
        assert_eq!(f.coordinator.pending_images(), 0);
        assert!(f.coordinator.node("a").is_none());
        assert!(f.coordinator.handle("a").is_none());
        let report = f.coordinator.report();
        assert_eq!(report.nodes_received, 0);
        assert_eq!(report.messages, 1);
        assert_eq!(f.tokens.registered().len(), 2);
    }

    #[test]
    fn message_before_tokens_opens_session() {
        let mut f = Fixture::new();
        assert_eq!(f.coordinator.state(), SessionState::Idle);
        f.nodes(vec![frame("a", None)]);
        assert_eq!(f.coordinator.state(), SessionState::Receiving);
        assert_eq!(f.coordinator.host().len(), 1);
    }

    #[test]
    fn failures_are_isolated_to_their_message() {
        let mut f = Fixture::new();
        f.start();
        f.chunk("img", 5, 2, &[0]);
        f.coordinator.process_json("{not json");
        f.nodes(vec![frame("a", None)]);

        let report = f.coordinator.report();
        assert_eq!(report.handler_errors, 1);
        assert_eq!(report.decode_errors, 1);
        assert_eq!(f.coordinator.host().len(), 1);
        assert_eq!(f.notices.count(NoticeLevel::Error), 2);
    }

    #[test]
    fn unknown_fonts_do_not_block() {
        let mut f = Fixture::new();
        f.start();
        f.send(Message::Fonts(FontsPayload {
            fonts: vec![
                FontRequest {
                    family: "Inter".into(),
                    style: "Regular".into(),
                },
                FontRequest {
                    family: "Missing Sans".into(),
                    style: "Regular".into(),
                },
            ],
            font_faces: Vec::new(),
        }));
        f.nodes(vec![frame("a", None)]);

        let report = f.coordinator.report();
        assert_eq!((report.fonts_loaded, report.font_failures), (1, 1));
        assert!(f.fonts.is_loaded("Inter", "Regular"));
        assert_eq!(f.coordinator.host().len(), 1);
    }

    #[test]
    fn paint_order_is_unique_across_batches() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![frame("a", None), frame("b", Some("a"))]);
        f.nodes(vec![frame("c", None)]);
        let orders: Vec<u64> = ["a", "b", "c"]
            .iter()
            .filter_map(|id| f.coordinator.paint_order(id))
            .collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn numbered_siblings_nest_under_their_parent() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![
            frame("node-1", None),
            frame("node-9", Some("node-1")),
            frame("node-10", Some("node-9")),
        ]);

        let scene = f.coordinator.host();
        assert_eq!(scene.find("node-10").unwrap().parent, f.coordinator.handle("node-9"));
        assert_eq!(f.coordinator.report().stats.orphans, 0);
        assert!(f.coordinator.paint_order("node-9") < f.coordinator.paint_order("node-10"));
    }

    #[test]
    fn deferred_image_keeps_its_batch_paint_order() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![
            frame("page", None),
            streamed("a-hero", "page", 3, 4),
            frame("b-caption", Some("page")),
        ]);
        let hero = f.coordinator.paint_order("a-hero");
        let caption = f.coordinator.paint_order("b-caption");
        assert!(hero.is_some());
        assert!(hero < caption);

        f.chunk("a-hero", 0, 1, &[1, 2, 3]);
        assert_eq!(f.coordinator.paint_order("a-hero"), hero);

        let scene = f.coordinator.host();
        let page = f.coordinator.handle("page").unwrap();
        let ids: Vec<&str> = scene
            .children(page)
            .iter()
            .filter_map(|h| scene.get(*h))
            .map(|e| e.node_id.as_str())
            .collect();
        assert_eq!(ids, ["a-hero", "b-caption"]);
    }

    #[test]
    fn in_flight_limit_turns_oldest_image_into_placeholder() {
        let mut f = Fixture::with_config(SessionConfig {
            max_in_flight_assets: 1,
            ..Default::default()
        });
        f.start();
        f.nodes(vec![
            frame("page", None),
            streamed("img-a", "page", 10, 4),
            streamed("img-b", "page", 10, 4),
        ]);
        f.chunk("img-a", 0, 3, &[0; 4]);
        f.chunk("img-b", 0, 3, &[0; 4]);

        let scene = f.coordinator.host();
        assert_eq!(scene.find("img-a").unwrap().kind, NodeKind::Placeholder);
        assert!(f.coordinator.is_pending("img-b"));

        f.chunk("img-a", 1, 3, &[0; 4]);
        let report = f.coordinator.report();
        assert_eq!(report.late_chunks, 1);
        assert_eq!(report.asset_failures, 1);
    }

    #[test]
    fn oversized_asset_is_dropped_to_placeholder() {
        let mut f = Fixture::with_config(SessionConfig {
            max_buffered_bytes: 6,
            ..Default::default()
        });
        f.start();
        f.nodes(vec![frame("page", None), streamed("big", "page", 8, 4)]);
        f.chunk("big", 0, 2, &[0; 4]);
        assert!(f.coordinator.is_pending("big"));
        f.chunk("big", 1, 2, &[0; 4]);

        assert!(!f.coordinator.is_pending("big"));
        assert_eq!(f.coordinator.host().find("big").unwrap().kind, NodeKind::Placeholder);
        assert_eq!(f.notices.count(NoticeLevel::Error), 0);
    }

    #[test]
    fn out_of_order_sequence_is_counted() {
        let mut f = Fixture::new();
        f.start();
        f.coordinator.process(Envelope::new(Message::Unknown { kind: "PING".into() }, 7));
        f.coordinator.process(Envelope::new(Message::Unknown { kind: "PING".into() }, 3));
        let report = f.coordinator.report();
        assert_eq!(report.out_of_order, 1);
        assert_eq!(report.ignored_messages, 2);
    }

    #[test]
    fn expired_assembly_is_replaced_on_eviction() {
        let mut f = Fixture::with_config(SessionConfig {
            assembly_timeout_ms: 50,
            ..Default::default()
        });
        f.start();
        f.nodes(vec![streamed("img", "page", 10, 4)]);
        f.chunk("img", 0, 3, &[0; 4]);
        f.coordinator
            .evict_expired(Instant::now() + Duration::from_millis(100));
        assert_eq!(f.coordinator.host().find("img").unwrap().kind, NodeKind::Placeholder);
        assert_eq!(f.coordinator.pending_images(), 0);
    }

    #[tokio::test]
    async fn drain_substitutes_placeholder_after_timeout() {
        let mut f = Fixture::with_config(SessionConfig {
            drain_timeout_ms: 200,
            drain_poll_interval_ms: 20,
            ..Default::default()
        });
        f.start();
        let mut hero = streamed("hero", "page", 10, 4);
        hero.rect = crate::ir::Rect::new(0.0, 0.0, 320.0, 200.0);
        f.nodes(vec![frame("page", None), hero]);
        f.send(Message::Complete(CompleteSummary {
            total_nodes: 2,
            total_images: 1,
            inline_images: 0,
            streamed_images: 1,
        }));
        assert_eq!(f.coordinator.state(), SessionState::Draining);
        let before = f.coordinator.host().len();

        let started = Instant::now();
        let report = f.coordinator.drain().await;
        assert!(started.elapsed() >= Duration::from_millis(200));

        assert_eq!(f.coordinator.state(), SessionState::Completed);
        assert_eq!(f.coordinator.host().len(), before + 1);
        let hero = f.coordinator.host().find("hero").unwrap();
        assert_eq!(hero.kind, NodeKind::Placeholder);
        assert_eq!(hero.rect.width, 320.0);
        assert_eq!(report.stats.placeholders, 1);
        assert_eq!(report.pending_images, 0);
    }

    #[tokio::test]
    async fn second_drain_returns_report_without_refinalizing() {
        let mut f = Fixture::new();
        f.start();
        f.nodes(vec![frame("page", None)]);
        f.send(Message::Complete(CompleteSummary::default()));

        let first = f.coordinator.drain().await;
        let second = f.coordinator.drain().await;
        assert_eq!(first, second);

        let imported = f
            .notices
            .notices()
            .iter()
            .filter(|n| n.level == NoticeLevel::Info && n.message.starts_with("Imported"))
            .count();
        assert_eq!(imported, 1);
    }

    #[tokio::test]
    async fn run_applies_chunks_sent_after_complete() {
        let mut f = Fixture::new();
        let (tx, mut rx) = mpsc::channel(16);
        let msgs = vec![
            Message::Tokens(TokenMap::new()),
            Message::Nodes(NodesPayload {
                nodes: vec![streamed("img", "page", 2, 4)],
            }),
            Message::Complete(CompleteSummary::default()),
            Message::ImageChunk(ImageChunk {
                node_id: "img".into(),
                chunk_index: 0,
                total_chunks: 1,
                data: vec![1, 2],
            }),
        ];
        for (i, m) in msgs.into_iter().enumerate() {
            tx.send(Envelope::new(m, i as u64)).await.unwrap();
        }

        let report = f.coordinator.run(&mut rx).await;
        assert_eq!(report.images_assembled, 1);
        assert_eq!(report.stats.placeholders, 0);
        assert_eq!(f.coordinator.host().find("img").unwrap().image_len, Some(2));
    }

    #[tokio::test]
    async fn closed_channel_finishes_session() {
        let mut f = Fixture::new();
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Envelope::new(Message::Tokens(TokenMap::new()), 0))
            .await
            .unwrap();
        tx.send(Envelope::new(
            Message::Nodes(NodesPayload {
                nodes: vec![streamed("img", "page", 2, 4)],
            }),
            1,
        ))
        .await
        .unwrap();
        drop(tx);

        let report = f.coordinator.run(&mut rx).await;
        assert_eq!(f.coordinator.state(), SessionState::Completed);
        assert_eq!(report.stats.placeholders, 1);
        assert!(report.declared.is_none());
    }
}
