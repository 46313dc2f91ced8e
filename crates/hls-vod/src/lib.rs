// Typed HLS VOD model: segment timeline entries and manifest records.
pub mod manifest;
pub mod segment;

// Export common types for ease of use
pub use manifest::{
    ManifestError, MasterManifest, MediaGroupEntry, MediaGroupType, MediaManifest, PlaylistItem,
    VariantStream, parse_master, parse_media,
};
pub use segment::{
    ByteRange, ContentSegment, Cue, DiscontinuityMarker, InitSegment, Segment, SegmentKey,
    TimedMetadata,
};
