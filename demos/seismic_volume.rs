//! Example: Create a seismic volume, write it page by page and read it back
//!
//! Run with: cargo run --example seismic_volume

use openvds_pager::{
    AccessMode, AxisDescriptor, BrickSize, ChannelDescriptor, CompressionMethod, DimensionGroup, Format,
    LayoutDescriptor, ValueRange, VdsConfig, VolumeDataAccess, VolumeDataLayout,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("OpenVDS Pager Example: Seismic Volume");
    println!("=====================================\n");

    // Define a 3D seismic volume
    let axes = vec![
        AxisDescriptor::new(200, "Sample", "ms", 0.0, 796.0),
        AxisDescriptor::new(150, "Crossline", "", 2000.0, 2149.0),
        AxisDescriptor::new(100, "Inline", "", 1000.0, 1099.0),
    ];
    let channels = vec![ChannelDescriptor::new(
        Format::R32,
        "Amplitude",
        ValueRange::new(-1.0, 1.0),
    )];

    // 64x64x64 bricks with a margin of 2 voxels, compressed with Zstd
    let descriptor = LayoutDescriptor::new(BrickSize::Size64)
        .with_margins(2, 2)
        .with_compression(CompressionMethod::Zstd, 0.0);
    let layout = VolumeDataLayout::new(axes, channels, descriptor).with_metadata("survey", "North Sea 3D");

    println!("Layout info:");
    println!("  {}", layout.summary());
    println!();

    let temp_dir = tempfile::tempdir()?;
    let volume_path = temp_dir.path().join("seismic-volume");
    let url = volume_path.to_str().ok_or("Temporary path is not UTF-8")?;
    println!("Creating volume at: {}", url);

    let vds = VolumeDataAccess::create(url, layout, VdsConfig::default())?;
    println!("✓ Volume created successfully\n");

    // Write a synthetic wavelet into every chunk
    let writer = vds.create_page_accessor(DimensionGroup::D012, 0, 0, None, AccessMode::Create)?;
    for chunk in 0..writer.chunk_count() {
        let page = writer.create_page(chunk)?;
        let (min, _) = page.min_max();
        page.with_view_mut::<f32, _>(|mut view| {
            for (index, value) in view.indexed_iter_mut() {
                let sample = (min[0] + index[0]) as f32;
                *value = (sample * 0.05).sin();
            }
        })?;
        let (written_min, written_max) = page.min_max_excluding_margin();
        page.update_written_region(&written_min, &written_max)?;
    }
    writer.commit()?;
    println!("Wrote {} chunks: {:?}\n", writer.chunk_count(), writer.stats());

    // Read an inline slice back through a fresh accessor
    let reader = VolumeDataAccess::open(url, VdsConfig::default())?;
    let accessor = reader.create_page_accessor(DimensionGroup::D012, 0, 0, Some(4), AccessMode::ReadOnly)?;
    let slice = accessor.read_region(&[0, 0, 50, 0, 0, 0], &[200, 150, 51, 1, 1, 1])?;
    let values = slice.as_slice::<f32>()?;
    let peak = values.iter().cloned().fold(f32::MIN, f32::max);
    println!("Read inline slice of {} samples, peak amplitude {:.3}", values.len(), peak);

    let stats = reader.get_stats();
    println!("Volume statistics:");
    println!("  {}", stats.summary());
    println!("Accessor: {:?}", accessor.stats());

    println!("\n✓ Example complete!");
    Ok(())
}
