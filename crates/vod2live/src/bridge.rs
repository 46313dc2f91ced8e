// Predecessor bridging: before a chained asset ingests its own manifests,
// the tail of the predecessor's last window is copied into the new store so
// the first windows play out continuously across the asset boundary.

use std::collections::{BTreeMap, BTreeSet};

use hls_vod::{Segment, TimedMetadata};
use tracing::{debug, info};

use crate::store::{SegmentStore, TrackMap};
use crate::window::{MediaSequence, TrackSequence};

/// Copy the predecessor's last video window into the new store, one tail
/// per new-ladder bandwidth. When the ladders differ, each new rung claims
/// the nearest unclaimed predecessor rung (searched in descending
/// bandwidth order, so ties resolve upward and no two new rungs collapse
/// onto one). A new rung above the predecessor's highest gets no tail and
/// starts standalone. Ladders of equal size additionally establish the
/// remap table reused by ad-splice bandwidth selection.
pub fn bridge_video(
    store: &mut SegmentStore,
    ladder_remap: &mut BTreeMap<u64, u64>,
    predecessor_tail: &MediaSequence,
    new_bandwidths: &[u64],
    metadata: &TimedMetadata,
) {
    let pred_bandwidths: Vec<u64> = predecessor_tail.segments.keys().copied().collect();
    let Some(pred_highest) = pred_bandwidths.last().copied() else {
        return;
    };

    if pred_bandwidths.len() == new_bandwidths.len() {
        // exact-count ladders map rung to rung, in ascending order
        let mut new_sorted = new_bandwidths.to_vec();
        new_sorted.sort_unstable();
        for (new_bw, pred_bw) in new_sorted.iter().zip(&pred_bandwidths) {
            if new_bw != pred_bw {
                ladder_remap.insert(*new_bw, *pred_bw);
            }
        }
        if !ladder_remap.is_empty() {
            debug!("Established ladder remap: {ladder_remap:?}");
        }
    }

    // search order: predecessor rungs descending, highest-first claims
    let mut pred_descending = pred_bandwidths.clone();
    pred_descending.sort_unstable_by(|a, b| b.cmp(a));

    let mut new_descending = new_bandwidths.to_vec();
    new_descending.sort_unstable_by(|a, b| b.cmp(a));

    let mut claimed: BTreeSet<u64> = BTreeSet::new();
    for new_bw in new_descending {
        let matched = if pred_bandwidths.contains(&new_bw) && !claimed.contains(&new_bw) {
            Some(new_bw)
        } else if let Some(mapped) = ladder_remap
            .get(&new_bw)
            .copied()
            .filter(|bw| !claimed.contains(bw))
        {
            Some(mapped)
        } else if new_bw > pred_highest {
            // no forced match above the predecessor's ladder
            None
        } else {
            pred_descending
                .iter()
                .copied()
                .filter(|bw| !claimed.contains(bw))
                .min_by_key(|bw| bw.abs_diff(new_bw))
        };

        match matched {
            Some(pred_bw) => {
                claimed.insert(pred_bw);
                let tail = &predecessor_tail.segments[&pred_bw];
                append_tail(store.video_timeline_mut(new_bw), tail, metadata);
                debug!("Bridged bandwidth {new_bw} from predecessor rung {pred_bw}");
            }
            None => {
                info!("Bandwidth {new_bw} exceeds the predecessor ladder, ingesting standalone");
            }
        }
    }
}

/// Copy the predecessor's last audio or subtitle window for every track
/// the new asset will carry. A missing language falls back to the first
/// language of the same predecessor group; a missing group bridges
/// nothing for that track.
pub fn bridge_tracks(
    target: &mut TrackMap,
    predecessor_tail: &TrackSequence,
    new_tracks: &[(String, String)],
    metadata: &TimedMetadata,
) {
    for (group_id, language) in new_tracks {
        let Some(languages) = predecessor_tail.segments.get(group_id) else {
            debug!("Predecessor has no {group_id} group, track {group_id}/{language} starts standalone");
            continue;
        };
        let tail = languages
            .get(language)
            .or_else(|| languages.values().next());
        if let Some(tail) = tail {
            let timeline = target
                .entry(group_id.clone())
                .or_default()
                .entry(language.clone())
                .or_default();
            append_tail(timeline, tail, metadata);
        }
    }
}

/// Append one copied tail: a lone leading marker is dropped (it was the
/// previous boundary, not carried content), copied markers lose any
/// inherited transition flag, and the tail closes with a fresh boundary
/// marker carrying the new asset's staged metadata.
fn append_tail(timeline: &mut Vec<Segment>, tail: &[Segment], metadata: &TimedMetadata) {
    let mut copied: Vec<Segment> = tail.to_vec();
    if copied.first().is_some_and(Segment::is_marker) {
        copied.remove(0);
    }
    for seg in &mut copied {
        if let Segment::Marker(marker) = seg {
            marker.vod_transition = false;
        }
    }
    timeline.extend(copied);
    timeline.push(Segment::vod_transition(
        (!metadata.is_empty()).then(|| metadata.clone()),
    ));
}
