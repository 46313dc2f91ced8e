//! VOD-to-live HLS sequencing engine
//!
//! Rewrites a static multi-bitrate HLS VOD into a continuously-advancing
//! live presentation: ingests the VOD's manifests, splices ad breaks in at
//! arbitrary offsets, optionally carries the tail of a previously served
//! asset across the boundary, partitions the result into bounded live
//! windows and renders each window as standard live playlist text.
//!
//! ## Component Overview
//!
//! - `asset`: the [`HlsVod`] aggregate and its load/window/render operations
//! - `splice`: ad-break insertion over a rendition timeline
//! - `bridge`: predecessor tail carry-over and ladder reconciliation
//! - `window`: the two window-advancement policies and their counters
//! - `render`: window-to-playlist-text serialization
//! - `fetch`: manifest download with bounded retries

pub mod asset;
pub mod bridge;
pub mod config;
pub mod error;
pub mod fetch;
pub mod render;
pub mod splice;
pub mod store;
pub mod window;

pub use asset::{HlsVod, UsageProfile};
pub use config::{FetchConfig, SubtitleTrack, VodConfig};
pub use error::VodError;
pub use fetch::{FetchError, HttpManifestFetcher, ManifestFetcher};
pub use render::{RenderOptions, render_playlist};
pub use splice::{AdSegment, AdSplice};
pub use store::SegmentStore;
pub use window::{DeltaTime, MediaSequence, TrackSequence, WindowPolicy};
