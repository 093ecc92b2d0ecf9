//! OpenVDS Pager - chunk addressing and paging core for volume data stores
//!
//! Splits an N-dimensional volume (up to 6D) into chunks and serves them to
//! readers and writers through a bounded set of resident pages.
//!
//! # Features
//!
//! - Chunk addressing for every dimension group and LOD, with margins
//! - Page accessors with read-only, read-write and create modes
//! - Margin propagation between neighbouring chunks on commit
//! - Refcounted byte-range cache with prefetching and shared fetches
//! - Pluggable storage (implement the `IOManager` trait for cloud storage)
//! - Pluggable chunk codec (Deflate, Zstd and RLE built in)
//!
//! # Example
//!
//! ```rust,no_run
//! use openvds_pager::{
//!     AccessMode, AxisDescriptor, BrickSize, ChannelDescriptor, DimensionGroup, Format,
//!     LayoutDescriptor, ValueRange, VdsConfig, VolumeDataAccess, VolumeDataLayout,
//! };
//!
//! # fn example() -> openvds_pager::Result<()> {
//! let layout = VolumeDataLayout::new(
//!     vec![
//!         AxisDescriptor::new(256, "Sample", "ms", 0.0, 1020.0),
//!         AxisDescriptor::new(128, "Crossline", "", 1.0, 128.0),
//!         AxisDescriptor::new(128, "Inline", "", 1.0, 128.0),
//!     ],
//!     vec![ChannelDescriptor::new(Format::R32, "Amplitude", ValueRange::new(-1.0, 1.0))],
//!     LayoutDescriptor::new(BrickSize::Size64).with_margins(2, 2),
//! );
//! let vds = VolumeDataAccess::create("file:///data/survey", layout, VdsConfig::default())?;
//!
//! let accessor = vds.create_page_accessor(DimensionGroup::D012, 0, 0, None, AccessMode::Create)?;
//! let page = accessor.create_page(0)?;
//! page.writable_buffer()?.as_mut_slice::<f32>()?.fill(0.5);
//! drop(page);
//! accessor.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod buffer;
pub mod codec;
pub mod compression;
pub mod config;
pub mod data_provider;
pub mod data_view;
pub mod dimension_group;
pub mod error;
pub mod hash;
pub mod io;
pub mod layer;
pub mod layout;
pub mod metadata;
pub mod page;
pub mod page_accessor;
pub mod partition;
pub mod request;
pub mod store;
pub mod types;
pub mod utils;

// Re-exports
pub use access::{VolumeDataAccess, VolumeStats};
pub use buffer::{copy_region, PageBuffer, VoxelValue};
pub use codec::{ChunkCodec, DataBlockCodec};
pub use compression::{CompressionLevel, CompressionMethod, Compressor};
pub use config::VdsConfig;
pub use data_provider::DataProvider;
pub use data_view::{DataViewHandle, DataViewManager, DataViewManagerConfig};
pub use dimension_group::DimensionGroup;
pub use error::{Result, VdsError};
pub use io::{IOManager, InMemoryIOManager, StorageBackend};
pub use layer::VolumeDataLayer;
pub use layout::{BrickSize, LayoutDescriptor, VolumeDataLayout};
pub use metadata::VdsMetadata;
pub use page::{AccessMode, Page, PageState};
pub use page_accessor::{PageAccessorStats, VolumeDataPageAccessor};
pub use partition::{IndexArray, VolumeDataPartition};
pub use request::{IoDispatcher, Request, RequestState};
pub use store::VolumeDataStore;
pub use types::{AxisDescriptor, ChannelDescriptor, Components, Format, ValueRange};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Magic number at the start of every stored chunk
pub const VDS_MAGIC: &[u8; 4] = b"VDS\0";
