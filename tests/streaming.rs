use rfscene::host::{HostServices, RecordingFontLoader, RecordingNotifier, RecordingTokenRegistry};
use rfscene::ir::{IrNode, NodeKind, Rect};
use rfscene::pipeline::{self, spawn_session};
use rfscene::producer::{CapturedDocument, StreamSession};
use rfscene::protocol::{Envelope, FontRequest, FontsPayload, Message, TokenMap};
use rfscene::scene::InMemoryScene;
use rfscene::{ProducerConfig, SessionConfig};
use tokio::sync::mpsc;

fn quick_producer() -> ProducerConfig {
    ProducerConfig {
        batch_size: 3,
        inline_image_limit: 64,
        chunk_size: 100,
        batch_delay_ms: 0,
        chunk_delay_ms: 0,
        encode_concurrency: 2,
    }
}

fn page_document() -> CapturedDocument {
    let mut tokens = TokenMap::new();
    tokens.insert("space.md".into(), serde_json::json!(16));

    let mut nodes = vec![IrNode::new("page", None)];
    for i in 0..5 {
        let mut card = IrNode::new(format!("card-{i}"), Some("page"));
        card.rect = Rect::new(0.0, 100.0 * i as f32, 300.0, 90.0);
        nodes.push(card);

        let mut img = IrNode::new(format!("img-{i}"), Some(format!("card-{i}").as_str()));
        img.kind = NodeKind::Image;
        // even cards get an inline thumbnail, odd cards a streamed photo
        let len = if i % 2 == 0 { 32 } else { 250 + i };
        img.inline_image = Some((0..len).map(|b| (b % 256) as u8).collect());
        nodes.push(img);
    }

    CapturedDocument {
        tokens,
        fonts: FontsPayload {
            fonts: vec![FontRequest {
                family: "Inter".into(),
                style: "Bold".into(),
            }],
            font_faces: Vec::new(),
        },
        nodes,
    }
}

#[tokio::test]
async fn document_streams_into_matching_scene() {
    let tokens = RecordingTokenRegistry::new();
    let fonts = RecordingFontLoader::new();
    let notices = RecordingNotifier::new();
    let services = HostServices::new(
        Box::new(tokens.clone()),
        Box::new(fonts.clone()),
        Box::new(notices.clone()),
    );

    let outcome = pipeline::stream_document(
        page_document(),
        quick_producer(),
        SessionConfig::default(),
        InMemoryScene::new(),
        services,
    )
    .await
    .expect("pipeline runs");

    assert_eq!(outcome.summary.complete.total_nodes, 11);
    assert_eq!(outcome.summary.complete.streamed_images, 2);
    assert_eq!(outcome.summary.chunks_sent, 6);

    let report = &outcome.report;
    assert_eq!(report.nodes_received, 11);
    assert_eq!(report.images_assembled, 2);
    assert_eq!(report.stats.nodes_created, 11);
    assert_eq!(report.stats.placeholders, 0);
    assert_eq!(report.stats.max_depth, 3);
    assert_eq!(report.out_of_order, 0);

    let scene = &outcome.host;
    for i in 0..5 {
        let img = scene.find(&format!("img-{i}")).unwrap();
        let card = scene.find(&format!("card-{i}")).unwrap();
        assert_eq!(img.parent, Some(card.handle));
        let expected = if i % 2 == 0 { 32 } else { 250 + i };
        assert_eq!(img.image_len, Some(expected));
    }

    assert_eq!(tokens.registered()[0]["space.md"], 16);
    assert!(fonts.is_loaded("Inter", "Bold"));
}

#[tokio::test]
async fn transcript_survives_json_round_trip() {
    let (tx, mut rx) = mpsc::channel(256);
    let mut producer = StreamSession::new(quick_producer()).unwrap();
    producer.stream(page_document(), &tx).await.unwrap();
    drop(tx);

    let mut lines = Vec::new();
    while let Some(env) = rx.recv().await {
        lines.push(env.to_json().unwrap());
    }

    let mut coordinator = rfscene::SessionCoordinator::new(
        SessionConfig::default(),
        InMemoryScene::new(),
        HostServices::noop(),
    )
    .unwrap();
    for l in &lines {
        coordinator.process_json(l);
    }
    let report = coordinator.drain().await;
    assert_eq!(report.decode_errors, 0);
    assert_eq!(report.images_assembled, 2);
    assert_eq!(coordinator.host().len(), 11);
}

#[tokio::test]
async fn reordered_chunks_still_assemble() {
    let (tx, mut rx) = mpsc::channel(256);
    let mut producer = StreamSession::new(quick_producer()).unwrap();
    producer.stream(page_document(), &tx).await.unwrap();
    drop(tx);

    let mut envelopes = Vec::new();
    while let Some(env) = rx.recv().await {
        envelopes.push(env);
    }
    // reverse the chunk run so every asset sees its last chunk first
    let first_chunk = envelopes
        .iter()
        .position(|e| matches!(e.message, Message::ImageChunk(_)))
        .unwrap();
    let last_chunk = envelopes
        .iter()
        .rposition(|e| matches!(e.message, Message::ImageChunk(_)))
        .unwrap();
    envelopes[first_chunk..=last_chunk].reverse();

    let handle = spawn_session(
        SessionConfig::default(),
        InMemoryScene::new(),
        HostServices::noop(),
        16,
    )
    .unwrap();
    for env in envelopes {
        handle.send(env).await.unwrap();
    }
    let (report, scene) = handle.finish().await.unwrap();

    assert_eq!(report.images_assembled, 2);
    assert!(report.out_of_order > 0);
    assert_eq!(scene.find("img-3").unwrap().image_len, Some(253));
}

#[tokio::test]
async fn second_tokens_starts_fresh_session() {
    let mut c = rfscene::SessionCoordinator::new(
        SessionConfig::default(),
        InMemoryScene::new(),
        HostServices::noop(),
    )
    .unwrap();
    c.process(Envelope::new(Message::Tokens(TokenMap::new()), 0));
    c.process(Envelope::new(
        Message::Nodes(rfscene::protocol::NodesPayload {
            nodes: vec![IrNode::new("a", None)],
        }),
        1,
    ));
    c.process(Envelope::new(Message::Tokens(TokenMap::new()), 0));
    c.process(Envelope::new(
        Message::Nodes(rfscene::protocol::NodesPayload {
            nodes: vec![IrNode::new("a", None)],
        }),
        1,
    ));

    let report = c.report();
    assert_eq!(report.nodes_received, 1);
    assert_eq!(report.duplicate_nodes, 0);
    assert_eq!(report.out_of_order, 0);
    // both sessions built into the same host
    assert_eq!(c.host().len(), 2);
}
