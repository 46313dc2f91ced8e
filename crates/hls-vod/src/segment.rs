use serde::{Deserialize, Serialize};

/// One addressable unit of a rendition timeline.
///
/// A timeline entry is either a content segment (playable media with a
/// duration and a URI) or a discontinuity marker (a decoding/timeline break
/// with no playable content of its own). Decorations such as cue markers,
/// DRM keys and byte ranges only ever appear on content segments; timed
/// metadata can sit on either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Content(ContentSegment),
    Marker(DiscontinuityMarker),
}

impl Segment {
    /// Create a plain content segment.
    #[inline]
    pub fn content(duration: f64, uri: impl Into<String>) -> Self {
        Segment::Content(ContentSegment::new(duration, uri))
    }

    /// Create a plain discontinuity marker.
    #[inline]
    pub fn marker() -> Self {
        Segment::Marker(DiscontinuityMarker::default())
    }

    /// Create the synthetic boundary marker inserted at a predecessor
    /// transition, carrying the new asset's staged timed metadata.
    pub fn vod_transition(metadata: Option<TimedMetadata>) -> Self {
        Segment::Marker(DiscontinuityMarker {
            vod_transition: true,
            daterange: metadata,
        })
    }

    #[inline]
    pub fn is_marker(&self) -> bool {
        matches!(self, Segment::Marker(_))
    }

    #[inline]
    pub fn is_content(&self) -> bool {
        matches!(self, Segment::Content(_))
    }

    /// Duration in seconds; markers contribute nothing to a window.
    #[inline]
    pub fn duration(&self) -> f64 {
        match self {
            Segment::Content(c) => c.duration,
            Segment::Marker(_) => 0.0,
        }
    }

    #[inline]
    pub fn uri(&self) -> Option<&str> {
        match self {
            Segment::Content(c) => Some(&c.uri),
            Segment::Marker(_) => None,
        }
    }

    #[inline]
    pub fn as_content(&self) -> Option<&ContentSegment> {
        match self {
            Segment::Content(c) => Some(c),
            Segment::Marker(_) => None,
        }
    }

    #[inline]
    pub fn as_content_mut(&mut self) -> Option<&mut ContentSegment> {
        match self {
            Segment::Content(c) => Some(c),
            Segment::Marker(_) => None,
        }
    }

    #[inline]
    pub fn as_marker(&self) -> Option<&DiscontinuityMarker> {
        match self {
            Segment::Marker(m) => Some(m),
            Segment::Content(_) => None,
        }
    }

    /// Timed metadata attached to this entry, regardless of variant.
    pub fn daterange(&self) -> Option<&TimedMetadata> {
        match self {
            Segment::Content(c) => c.daterange.as_ref(),
            Segment::Marker(m) => m.daterange.as_ref(),
        }
    }
}

/// Playable media referenced by a rendition playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSegment {
    pub duration: f64,
    pub uri: String,
    /// Absolute wall-clock anchor in milliseconds, from the source
    /// playlist's program-date-time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cue: Option<Cue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_range: Option<ByteRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_segment: Option<InitSegment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<SegmentKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daterange: Option<TimedMetadata>,
}

impl ContentSegment {
    pub fn new(duration: f64, uri: impl Into<String>) -> Self {
        ContentSegment {
            duration,
            uri: uri.into(),
            timeline_position: None,
            cue: None,
            byte_range: None,
            init_segment: None,
            keys: Vec::new(),
            daterange: None,
        }
    }
}

/// A decoding/timeline break. Carries no playable content.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiscontinuityMarker {
    /// Set only on the synthetic marker inserted at a predecessor boundary;
    /// stripped again when the marker is copied forward into a successor.
    #[serde(default)]
    pub vod_transition: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daterange: Option<TimedMetadata>,
}

/// SCTE-35 ad cue attributes attached to a content segment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cue {
    /// Segment opens an ad break.
    pub out: bool,
    /// Segment closes an ad break.
    pub r#in: bool,
    /// Elapsed seconds into an ongoing break (cue-out continuation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cont: Option<f64>,
    /// Total break duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scte_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_data: Option<String>,
}

/// A sub-range of a segment resource, `length@offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.offset {
            Some(offset) => write!(f, "{}@{}", self.length, offset),
            None => write!(f, "{}", self.length),
        }
    }
}

/// CMAF/fMP4 initialization segment reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSegment {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_range: Option<ByteRange>,
}

/// One DRM key descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentKey {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_format_versions: Option<String>,
}

/// Ordered key/value timed-metadata block, rendered as an
/// `EXT-X-DATERANGE` tag. Insertion order is preserved because the
/// rendered attribute order is part of the produced text protocol.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimedMetadata(Vec<(String, String)>);

impl TimedMetadata {
    pub fn new() -> Self {
        TimedMetadata(Vec::new())
    }

    /// Insert or replace a key, keeping the original position on replace.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
