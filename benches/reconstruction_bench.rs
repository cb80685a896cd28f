use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rfscene::assembler::AssetChunkAssembler;
use rfscene::ir::{IrNode, Position, ZIndex};
use rfscene::stacking::StackingOrderResolver;

/// A wide, shallow tree with a positioned layer every seventh node
fn build_batch(count: usize) -> Vec<IrNode> {
    let mut nodes = vec![IrNode::new("root", None)];
    for i in 0..count {
        let parent = if i < 20 {
            "root".to_string()
        } else {
            format!("n{}", i / 20)
        };
        let mut node = IrNode::new(format!("n{i}"), Some(parent.as_str()));
        if i % 7 == 0 {
            node.stacking.position = Position::Relative;
            node.stacking.z_index = ZIndex::Value((i % 5) as i32 - 2);
        }
        nodes.push(node);
    }
    nodes
}

fn bench_resolve_paint_order(c: &mut Criterion) {
    let resolver = StackingOrderResolver::new();
    let batch = build_batch(2_000);
    c.bench_function("resolve_paint_order_2000", |b| {
        b.iter(|| {
            let order = resolver.resolve(black_box(&batch));
            black_box(order.len())
        })
    });
}

fn bench_assemble_reversed_chunks(c: &mut Criterion) {
    let data: Vec<u8> = (0..(1 << 20)).map(|i| (i % 251) as u8).collect();
    let chunks: Vec<Vec<u8>> = data.chunks(64 * 1024).map(<[u8]>::to_vec).collect();
    let total = chunks.len() as u32;

    c.bench_function("assemble_1mib_reversed", |b| {
        b.iter(|| {
            let mut asm = AssetChunkAssembler::default();
            asm.declare_total_size("asset", data.len() as u64);
            for (i, chunk) in chunks.iter().enumerate().rev() {
                let _ = asm.add_chunk("asset", i as u32, chunk.clone(), total);
            }
            black_box(asm.assemble("asset").map(|b| b.len()).unwrap_or(0))
        })
    });
}

criterion_group!(benches, bench_resolve_paint_order, bench_assemble_reversed_chunks);
criterion_main!(benches);
