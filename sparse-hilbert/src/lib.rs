//! # Sparse Hilbert Index - Range Queries Over Sorted Flat Files
//!
//! This crate builds a small secondary index over a flat file of records with
//! numeric coordinates, then answers multi-dimensional range queries with a
//! handful of contiguous byte-range reads of the data file. The data file can
//! sit on local disk or behind any HTTP server that supports (or even
//! ignores) `Range` requests; the index itself is tiny and lives in memory.
//!
//! ## How It Works
//!
//! - **Hilbert curve ordering**: each record's coordinates are normalized to
//!   integer ordinates and mapped to a point on a space-filling curve, and
//!   the data file is rewritten in curve order
//! - **Sparse position table**: every so many records, the curve index and
//!   byte position are sampled into a table small enough to keep in memory
//! - **Query decomposition**: a query box becomes a short list of curve
//!   ranges, which the table turns into merged byte regions of the file
//! - **Streaming scan**: each region is scanned with early termination and
//!   an exact bounds filter, sequentially or across worker threads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sparse_hilbert::{
//!     create_index, Bounds, FileRangeSource, IndexConfig, LineCodec, SearchOptions,
//! };
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // index CSV lines of "lat,lon,time" by their three coordinates
//! let point = |line: &String| -> Vec<f64> {
//!     line.split(',').map(|s| s.parse().unwrap()).collect()
//! };
//! let config = IndexConfig::new(10, 3)?;
//! let index = create_index(
//!     LineCodec,
//!     point,
//!     &config,
//!     Path::new("input.csv"),
//!     Path::new("sorted.csv"),
//! )?;
//! index.write_to_path("sorted.csv.idx")?;
//!
//! // query a box over the sorted copy
//! let source = FileRangeSource::new("sorted.csv");
//! let bounds = Bounds::new(vec![-35.0, 142.0, 0.0], vec![-33.0, 144.0, 1e12])?;
//! for record in index.search(&bounds, &source, &SearchOptions::default())? {
//!     println!("{}", record?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Searching a remote file works the same way with
//! [`HttpRangeSource`](search::HttpRangeSource) (behind the default `http`
//! feature), and [`SpatialIndex::read_from_url`] fetches the index itself
//! over HTTP.

pub mod bounds;
pub mod builder;
pub mod codec;
pub mod curve;
pub mod errors;
pub mod index;
pub mod search;
pub mod sorter;
pub mod stats;

pub use bounds::Bounds;
pub use builder::{create_index, IndexConfig};
pub use codec::{FixedWidthCodec, LineCodec, RecordCodec};
pub use curve::{HilbertCurve, IndexRange, MAX_INDEX_BITS};
pub use errors::{IndexError, IndexResult};
pub use index::{PositionRange, SpatialIndex};
#[cfg(feature = "http")]
pub use search::HttpRangeSource;
pub use search::{
    ConcurrentSearchStream, ConcurrentStatsStream, FileRangeSource, RangeSource, SearchOptions,
    SearchStream, StatsSearchStream,
};
pub use sorter::SortConfig;
pub use stats::{StatsAccumulator, StatsSnapshot, WithStats};
