use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use openvds_pager::{
    AxisDescriptor, BrickSize, ChannelDescriptor, DimensionGroup, Format, LayoutDescriptor, ValueRange,
    VolumeDataLayout,
};
use std::hint::black_box;

fn layout(lod_levels: u32) -> VolumeDataLayout {
    VolumeDataLayout::new(
        vec![
            AxisDescriptor::new(1126, "Sample", "ms", 0.0, 4500.0),
            AxisDescriptor::new(605, "Crossline", "", 1.0, 605.0),
            AxisDescriptor::new(385, "Inline", "", 1.0, 385.0),
        ],
        vec![ChannelDescriptor::new(Format::R32, "Amplitude", ValueRange::new(-1.0, 1.0))],
        LayoutDescriptor::new(BrickSize::Size64)
            .with_margins(4, 4)
            .with_lod_levels(lod_levels),
    )
}

fn chunk_min_max(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_min_max");
    let layout = layout(2);
    for lod in 0..=2 {
        let layer = layout.layer(DimensionGroup::D012, lod, 0).unwrap();
        let partition = layer.partition();
        let chunks = partition.total_chunk_count();
        group.throughput(Throughput::Elements(chunks));
        group.bench_function(BenchmarkId::new("lod", lod), |b| {
            b.iter(|| {
                for chunk in 0..chunks {
                    black_box(partition.chunk_min_max(chunk, true).unwrap());
                }
            });
        });
    }
    group.finish();
}

fn chunk_index_from_position(c: &mut Criterion) {
    let layout = layout(0);
    let layer = layout.layer(DimensionGroup::D012, 0, 0).unwrap();
    let partition = layer.partition();
    let positions: Vec<[usize; 3]> = (0..1024)
        .map(|i| [(i * 37) % 1126, (i * 11) % 605, (i * 7) % 385])
        .collect();

    let mut group = c.benchmark_group("chunk_index_from_position");
    group.throughput(Throughput::Elements(positions.len() as u64));
    group.bench_function("random_positions", |b| {
        b.iter(|| {
            for position in &positions {
                black_box(partition.chunk_index_from_position(position).unwrap());
            }
        });
    });
    group.finish();
}

fn dimension_group_lookup(c: &mut Criterion) {
    c.bench_function("dimension_group_decompose", |b| {
        b.iter(|| {
            for group in DimensionGroup::iter() {
                for i in 0..group.dimensionality() {
                    black_box(group.dimension(i).unwrap());
                }
            }
        });
    });
}

criterion_group!(benches, chunk_min_max, chunk_index_from_position, dimension_group_lookup);
criterion_main!(benches);
