use std::collections::BTreeMap;

use hls_vod::Segment;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Audio/subtitle timelines, keyed group-id then language.
pub type TrackMap = BTreeMap<String, BTreeMap<String, Vec<Segment>>>;

/// The flat, ever-growing timeline of one asset: one ordered segment
/// sequence per video bandwidth and per (group, language) track.
/// Append-only while ingestion runs; windowing consumes it read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentStore {
    pub video: BTreeMap<u64, Vec<Segment>>,
    pub audio: TrackMap,
    pub subtitles: TrackMap,
}

impl SegmentStore {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty() && self.subtitles.is_empty()
    }

    pub fn bandwidths(&self) -> Vec<u64> {
        self.video.keys().copied().collect()
    }

    pub fn video_timeline_mut(&mut self, bandwidth: u64) -> &mut Vec<Segment> {
        self.video.entry(bandwidth).or_default()
    }

    pub fn audio_timeline_mut(&mut self, group_id: &str, language: &str) -> &mut Vec<Segment> {
        self.audio
            .entry(group_id.to_string())
            .or_default()
            .entry(language.to_string())
            .or_default()
    }

    pub fn subtitle_timeline_mut(&mut self, group_id: &str, language: &str) -> &mut Vec<Segment> {
        self.subtitles
            .entry(group_id.to_string())
            .or_default()
            .entry(language.to_string())
            .or_default()
    }

    /// The windowing reference: the longest video timeline (a standalone
    /// rung after a ladder change may be shorter), lowest bandwidth first
    /// on ties.
    pub fn reference_video(&self) -> Option<&Vec<Segment>> {
        let mut reference: Option<&Vec<Segment>> = None;
        for timeline in self.video.values() {
            if reference.is_none_or(|current| timeline.len() > current.len()) {
                reference = Some(timeline);
            }
        }
        reference
    }

    /// Longest timeline of one track family, the family's windowing
    /// reference.
    pub fn reference_track(tracks: &TrackMap) -> Option<&Vec<Segment>> {
        let mut reference: Option<&Vec<Segment>> = None;
        for timeline in tracks.values().flat_map(|languages| languages.values()) {
            if reference.is_none_or(|current| timeline.len() > current.len()) {
                reference = Some(timeline);
            }
        }
        reference
    }

    /// Total content duration of one video timeline, in seconds.
    pub fn video_duration(&self, bandwidth: u64) -> f64 {
        self.video
            .get(&bandwidth)
            .map(|timeline| timeline.iter().map(Segment::duration).sum())
            .unwrap_or(0.0)
    }

    /// Two consecutive discontinuity markers are illegal on a timeline;
    /// collapse every run to its first marker, folding any metadata or
    /// transition flag of the dropped markers into the kept one.
    pub fn collapse_markers(&mut self) {
        for timeline in self.timelines_mut() {
            collapse_timeline(timeline);
        }
    }

    pub(crate) fn timelines_mut(&mut self) -> impl Iterator<Item = &mut Vec<Segment>> {
        self.video
            .values_mut()
            .chain(self.audio.values_mut().flat_map(|langs| langs.values_mut()))
            .chain(
                self.subtitles
                    .values_mut()
                    .flat_map(|langs| langs.values_mut()),
            )
    }
}

fn collapse_timeline(timeline: &mut Vec<Segment>) {
    let mut collapsed: Vec<Segment> = Vec::with_capacity(timeline.len());
    let mut dropped = 0usize;
    for seg in timeline.drain(..) {
        match seg {
            Segment::Marker(next) if matches!(collapsed.last(), Some(Segment::Marker(_))) => {
                // fold the dropped marker into the kept one
                if let Some(Segment::Marker(kept)) = collapsed.last_mut() {
                    kept.vod_transition |= next.vod_transition;
                    if kept.daterange.is_none() {
                        kept.daterange = next.daterange;
                    }
                }
                dropped += 1;
            }
            seg => collapsed.push(seg),
        }
    }
    if dropped > 0 {
        debug!("Collapsed {dropped} consecutive discontinuity markers");
    }
    *timeline = collapsed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hls_vod::TimedMetadata;

    #[test]
    fn collapses_consecutive_markers_keeping_metadata() {
        let mut meta = TimedMetadata::new();
        meta.set("start-date", "2024-01-01T00:00:00Z");

        let mut store = SegmentStore::default();
        let timeline = store.video_timeline_mut(1000);
        timeline.push(Segment::content(6.0, "a.ts"));
        timeline.push(Segment::marker());
        timeline.push(Segment::vod_transition(Some(meta.clone())));
        timeline.push(Segment::content(6.0, "b.ts"));

        store.collapse_markers();

        let timeline = &store.video[&1000];
        assert_eq!(timeline.len(), 3);
        let marker = timeline[1].as_marker().unwrap();
        assert!(marker.vod_transition);
        assert_eq!(marker.daterange, Some(meta));
    }

    #[test]
    fn windowing_reference_is_the_longest_timeline() {
        let mut store = SegmentStore::default();
        store.video_timeline_mut(1000).push(Segment::content(6.0, "a.ts"));
        store.video_timeline_mut(2000).push(Segment::content(6.0, "a.ts"));
        store.video_timeline_mut(2000).push(Segment::content(6.0, "b.ts"));

        assert_eq!(store.reference_video().unwrap().len(), 2);
    }
}
