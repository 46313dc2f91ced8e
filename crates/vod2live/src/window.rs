// Window generation: partitions a finished timeline into bounded live
// windows and computes the per-window counters the playlist headers need.

use std::collections::BTreeMap;

use hls_vod::Segment;
use serde::{Deserialize, Serialize};

use crate::error::VodError;
use crate::store::TrackMap;

/// How the window list advances over the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Partition the timeline into windows of at least the target
    /// duration; the final partial window is still emitted.
    #[default]
    DurationThreshold,
    /// Slide: every window after the first appends at least one new
    /// segment and sheds old ones from the front once the target duration
    /// is reached.
    AlwaysAdvance,
}

/// One live window of the video timeline, per bandwidth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaSequence {
    pub segments: BTreeMap<u64, Vec<Segment>>,
}

/// One live window of the audio or subtitle timelines, keyed group-id
/// then language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSequence {
    pub segments: TrackMap,
}

/// Per-window advancement record. `position` is the cumulative content
/// duration newly exposed up to and including this window; `interval` is
/// the change of that advancement relative to the previous window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeltaTime {
    pub interval: f64,
    pub position: f64,
}

/// Element index ranges, one `[start, end)` per window, over a reference
/// timeline. Both policies produce contiguous ranges; everything else
/// (counters, materialized windows) derives from these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowPlan {
    pub bounds: Vec<(usize, usize)>,
}

/// Header counters and delta-time records for one track family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceCounters {
    /// `EXT-X-MEDIA-SEQUENCE` value per window: content segments that
    /// slid out before the window start.
    pub media_sequence_values: Vec<u64>,
    /// `EXT-X-DISCONTINUITY-SEQUENCE` value per window: markers before
    /// the window start, plus a leading marker (suppressed inline and
    /// accounted here instead).
    pub discontinuity_sequences: Vec<u64>,
    pub delta_times: Vec<DeltaTime>,
}

pub fn plan_windows(reference: &[Segment], target_duration: f64, policy: WindowPolicy) -> WindowPlan {
    match policy {
        WindowPolicy::DurationThreshold => plan_duration_threshold(reference, target_duration),
        WindowPolicy::AlwaysAdvance => plan_always_advance(reference, target_duration),
    }
}

/// Accumulate consecutive durations; the element that pushes the
/// running sum to or past the target closes the window, and the next
/// window opens at the following index. A leading marker stays in its
/// window (it is suppressed by the renderer and folded into the
/// discontinuity-sequence header), so the next window start passes over
/// it like any other position.
fn plan_duration_threshold(reference: &[Segment], target_duration: f64) -> WindowPlan {
    let mut bounds = Vec::new();
    let mut idx = 0;
    let n = reference.len();

    while idx < n {
        let start = idx;
        let mut sum = 0.0;
        while idx < n {
            sum += reference[idx].duration();
            idx += 1;
            if sum >= target_duration {
                break;
            }
        }
        bounds.push((start, idx));
    }

    WindowPlan { bounds }
}

/// Sliding advancement: every step clones the previous window, appends new trailing
/// elements until the target duration is reached (at least one, so each
/// window carries something new), then sheds from the front until the
/// duration drops below the target again. Markers shed this way count
/// toward the discontinuity sequence, not the media sequence.
fn plan_always_advance(reference: &[Segment], target_duration: f64) -> WindowPlan {
    let n = reference.len();
    if n == 0 {
        return WindowPlan::default();
    }

    let mut bounds = Vec::new();
    let mut front = 0usize;
    let mut end = 0usize;
    let mut duration = 0.0f64;

    while end < n {
        duration += reference[end].duration();
        end += 1;
        if duration >= target_duration {
            break;
        }
    }
    bounds.push((front, end));

    while end < n {
        let mut pushed = 0usize;
        while duration < target_duration && end < n {
            duration += reference[end].duration();
            end += 1;
            pushed += 1;
        }
        if pushed == 0 {
            // previous window already reached the target; advance anyway
            duration += reference[end].duration();
            end += 1;
            pushed += 1;
        }

        let mut removed = 0usize;
        while front < end {
            if duration < target_duration && removed > 0 {
                break;
            }
            match &reference[front] {
                Segment::Marker(_) => {}
                seg => {
                    duration -= seg.duration();
                    removed += 1;
                }
            }
            front += 1;
        }

        // Churn minimization: when a single shift sufficed but several
        // elements were pushed, hand the extra back to the next step.
        if removed == 1 && pushed > 1 {
            end -= 1;
            duration -= reference[end].duration();
        }

        bounds.push((front, end));
    }

    WindowPlan { bounds }
}

/// Derive the per-window counters for one timeline from a plan. Bounds are
/// clamped to the timeline length, so a family windowed under another
/// family's plan (audio under the duration-threshold policy) still gets
/// consistent counters.
pub fn counters_for(reference: &[Segment], plan: &WindowPlan) -> SequenceCounters {
    let n = reference.len();
    let mut counters = SequenceCounters::default();
    let mut prev_advanced = 0.0f64;
    let mut position = 0.0f64;
    let mut prev_end = 0usize;

    for (index, &(start, end)) in plan.bounds.iter().enumerate() {
        let start = start.min(n);
        let end = end.min(n);

        let mut content_before = 0u64;
        let mut markers_before = 0u64;
        for seg in &reference[..start] {
            if seg.is_marker() {
                markers_before += 1;
            } else {
                content_before += 1;
            }
        }
        let leading_marker = reference.get(start).is_some_and(Segment::is_marker);

        counters.media_sequence_values.push(content_before);
        counters
            .discontinuity_sequences
            .push(markers_before + leading_marker as u64);

        let advanced = if index == 0 {
            0.0
        } else {
            reference[prev_end.min(end)..end]
                .iter()
                .map(Segment::duration)
                .sum()
        };
        position += advanced;
        counters.delta_times.push(DeltaTime {
            interval: advanced - prev_advanced,
            position,
        });
        prev_advanced = advanced;
        prev_end = end;
    }

    counters
}

/// Materialize the planned windows for every video bandwidth. Timelines
/// share their suffix (the asset's own content) but may differ in prefix
/// length when a rung started standalone after a ladder change, so each
/// bandwidth is aligned at the tail: an index range on the reference maps
/// down by the bandwidth's length deficit, clamping at the timeline start.
/// A planned range past the reference itself is an internal invariant
/// violation: the whole load must fail rather than emit corrupt windows.
pub fn materialize_video(
    plan: &WindowPlan,
    video: &BTreeMap<u64, Vec<Segment>>,
) -> Result<Vec<MediaSequence>, VodError> {
    let reference_len = video.values().map(Vec::len).max().unwrap_or(0);
    let mut sequences = Vec::with_capacity(plan.bounds.len());
    for &(start, end) in &plan.bounds {
        if end > reference_len {
            return Err(VodError::Structural(format!(
                "window range {start}..{end} exceeds the reference timeline ({reference_len} entries)"
            )));
        }
        let mut window = MediaSequence::default();
        for (bandwidth, timeline) in video {
            let deficit = reference_len - timeline.len();
            window.segments.insert(
                *bandwidth,
                timeline[start.saturating_sub(deficit)..end.saturating_sub(deficit)].to_vec(),
            );
        }
        sequences.push(window);
    }
    Ok(sequences)
}

/// Materialize the planned windows for audio/subtitle tracks, tail-aligned
/// the same way as video bandwidths.
pub fn materialize_tracks(plan: &WindowPlan, tracks: &TrackMap) -> Vec<TrackSequence> {
    let reference_len = tracks
        .values()
        .flat_map(|languages| languages.values())
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    let mut sequences = Vec::with_capacity(plan.bounds.len());
    for &(start, end) in &plan.bounds {
        let start = start.min(reference_len);
        let end = end.min(reference_len);
        let mut window = TrackSequence::default();
        for (group_id, languages) in tracks {
            let entry = window.segments.entry(group_id.clone()).or_default();
            for (language, timeline) in languages {
                let deficit = reference_len - timeline.len();
                entry.insert(
                    language.clone(),
                    timeline[start.saturating_sub(deficit)..end.saturating_sub(deficit)].to_vec(),
                );
            }
        }
        sequences.push(window);
    }
    sequences
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_timeline(count: usize, duration: f64) -> Vec<Segment> {
        (0..count)
            .map(|n| Segment::content(duration, format!("seg_{n}.ts")))
            .collect()
    }

    #[test]
    fn duration_threshold_partitions_without_overlap_or_gap() {
        // 2646 s of 6 s segments, 60 s target: 44 windows of 10 plus the
        // final partial window of one segment.
        let timeline = content_timeline(441, 6.0);
        let plan = plan_windows(&timeline, 60.0, WindowPolicy::DurationThreshold);

        assert_eq!(plan.bounds.len(), 45);
        assert_eq!(plan.bounds[0], (0, 10));
        assert_eq!(plan.bounds[44], (440, 441));
        for pair in plan.bounds.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn duration_threshold_keeps_leading_marker_in_window() {
        // 9 s segments with a break after the first: the second window
        // opens on the marker and accounts it in its discontinuity value.
        let mut timeline = vec![
            Segment::content(9.0, "a.ts"),
            Segment::content(9.0, "b.ts"),
        ];
        for n in 0..6 {
            timeline.push(Segment::content(9.0, format!("c_{n}.ts")));
        }
        timeline.insert(2, Segment::marker());

        let plan = plan_windows(&timeline, 18.0, WindowPolicy::DurationThreshold);
        let counters = counters_for(&timeline, &plan);

        assert_eq!(plan.bounds[0], (0, 2));
        assert_eq!(plan.bounds[1], (2, 5)); // marker + two content segments
        assert_eq!(counters.discontinuity_sequences[0], 0);
        assert_eq!(counters.discontinuity_sequences[1], 1);
        assert_eq!(counters.discontinuity_sequences[2], 1);
        // markers do not advance the media sequence
        assert_eq!(counters.media_sequence_values[1], 2);
        assert_eq!(counters.media_sequence_values[2], 4);
    }

    #[test]
    fn always_advance_exposes_new_segments_every_window() {
        let timeline = content_timeline(12, 6.0);
        let plan = plan_windows(&timeline, 18.0, WindowPolicy::AlwaysAdvance);

        assert_eq!(plan.bounds[0], (0, 3));
        for pair in plan.bounds.windows(2) {
            let (_, prev_end) = pair[0];
            let (start, end) = pair[1];
            assert!(end > prev_end, "window must expose a new segment");
            assert!(start > pair[0].0, "window must shed from the front");
        }
        let (_, last_end) = *plan.bounds.last().unwrap();
        assert_eq!(last_end, 12);
    }

    #[test]
    fn always_advance_skips_markers_when_shedding() {
        let mut timeline = content_timeline(8, 6.0);
        timeline.insert(2, Segment::marker());
        let plan = plan_windows(&timeline, 18.0, WindowPolicy::AlwaysAdvance);
        let counters = counters_for(&timeline, &plan);

        // the marker slides out together with the content ahead of it and
        // lands in the discontinuity sequence, not the media sequence
        for (index, &(start, _)) in plan.bounds.iter().enumerate() {
            let content = timeline[..start].iter().filter(|s| s.is_content()).count() as u64;
            let markers = timeline[..start].iter().filter(|s| s.is_marker()).count() as u64;
            assert_eq!(counters.media_sequence_values[index], content);
            assert!(counters.discontinuity_sequences[index] >= markers);
        }
        assert!(*counters.discontinuity_sequences.last().unwrap() >= 1);
    }

    #[test]
    fn delta_times_start_at_zero_and_accumulate() {
        let timeline = content_timeline(30, 6.0);
        let plan = plan_windows(&timeline, 18.0, WindowPolicy::DurationThreshold);
        let counters = counters_for(&timeline, &plan);

        assert_eq!(counters.delta_times[0], DeltaTime::default());
        assert_eq!(counters.delta_times[1].position, 18.0);
        assert_eq!(counters.delta_times[1].interval, 18.0);
        assert_eq!(counters.delta_times[2].interval, 0.0);
        assert_eq!(counters.delta_times[2].position, 36.0);
    }

    #[test]
    fn short_prefix_bandwidth_is_aligned_at_the_tail() {
        // rung 2000 started standalone: it misses the first two entries
        // but shares the suffix with rung 1000
        let mut video = BTreeMap::new();
        video.insert(1000_u64, content_timeline(10, 6.0));
        video.insert(2000_u64, content_timeline(10, 6.0)[2..].to_vec());
        let plan = plan_windows(&video[&1000], 30.0, WindowPolicy::DurationThreshold);

        let sequences = materialize_video(&plan, &video).unwrap();
        // first window: rung 2000 holds only its own three entries
        assert_eq!(sequences[0].segments[&1000].len(), 5);
        assert_eq!(sequences[0].segments[&2000].len(), 3);
        // later windows line up exactly
        assert_eq!(
            sequences[1].segments[&1000], sequences[1].segments[&2000],
        );
    }

    #[test]
    fn plan_past_the_reference_aborts_materialization() {
        let mut video = BTreeMap::new();
        video.insert(1000_u64, content_timeline(10, 6.0));
        let plan = WindowPlan {
            bounds: vec![(0, 12)],
        };

        assert!(matches!(
            materialize_video(&plan, &video),
            Err(VodError::Structural(_))
        ));
    }
}
