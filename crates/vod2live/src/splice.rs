// Ad-splice insertion: rewrites one rendition's flat timeline while it is
// ingested, inserting discontinuity-wrapped ad blocks at the requested
// offsets.

use std::collections::BTreeMap;

use hls_vod::{PlaylistItem, Segment};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One ad-insertion instruction: an offset into the unspliced timeline
/// plus replacement content per bandwidth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSplice {
    /// Seconds from the start of the unspliced timeline.
    pub position: f64,
    pub segments: BTreeMap<u64, Vec<AdSegment>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSegment {
    pub duration: f64,
    pub uri: String,
}

/// Walk one rendition's parsed items, appending them to `out` with ad
/// breaks spliced in. `splices` is shared across renditions and mutated in
/// place: back-to-back positions are adjusted so every rendition observes
/// the same resolved list. `out` may already hold a bridged predecessor
/// tail; the walk appends after it.
///
/// A splice at position 0 produces no leading marker (or reuses the
/// bridge's trailing marker), and a splice beyond the asset's total
/// duration is silently dropped.
pub fn insert_splices(
    items: &[PlaylistItem],
    bandwidth: u64,
    splices: &mut [AdSplice],
    ladder_remap: &BTreeMap<u64, u64>,
    out: &mut Vec<Segment>,
) {
    let mut splice_idx = 0usize;
    let mut position = 0.0f64;
    let mut folding = false;
    let mut i = 0usize;

    while i < items.len() {
        let item = &items[i];
        let triggered = splices
            .get(splice_idx)
            .is_some_and(|splice| position + item.duration > splice.position);

        if triggered {
            let splice_position = splices[splice_idx].position;
            let ads = nearest_ad_segments(&splices[splice_idx], bandwidth, ladder_remap);
            if ads.is_empty() {
                debug!("Splice at {splice_position}s has no segments for bandwidth {bandwidth}, skipping");
                splice_idx += 1;
                if folding {
                    // restore the trailing marker the fold removed
                    if i != items.len() - 1 && !matches!(out.last(), Some(Segment::Marker(_))) {
                        out.push(Segment::marker());
                    }
                    folding = false;
                }
                continue;
            }

            // Open the break, unless we are folding a back-to-back splice
            // into the previous one or the break lands at the very start
            // (right behind a bridged boundary marker counts as covered).
            if !folding && !matches!(out.last(), None | Some(Segment::Marker(_))) {
                out.push(Segment::marker());
            }

            for ad in &ads {
                out.push(Segment::content(ad.duration, ad.uri.clone()));
            }

            let is_final_item = i == items.len() - 1;
            if !is_final_item {
                out.push(Segment::marker());
            }
            splice_idx += 1;
            folding = false;

            // Back-to-back rule: a following splice still at or before the
            // current playhead folds into the same break. The trailing
            // marker just pushed is removed so both ad blocks share one
            // discontinuity pair, and the folded splice's position is
            // adjusted to the resolved break position in the shared list.
            if let Some(next) = splices.get_mut(splice_idx) {
                if next.position <= position {
                    next.position = splice_position;
                    if !is_final_item {
                        out.pop();
                    }
                    folding = true;
                    continue;
                }
            }
        }

        if item.discontinuity && !matches!(out.last(), None | Some(Segment::Marker(_))) {
            out.push(Segment::marker());
        }
        out.push(item.to_segment());
        position += item.duration;
        folding = false;
        i += 1;
    }

    if splice_idx < splices.len() {
        debug!(
            "Dropping {} splice(s) positioned beyond the asset duration ({position:.3}s)",
            splices.len() - splice_idx
        );
    }
}

/// Ad list for the bandwidth nearest the rendition's, preferring an
/// established ladder remap when one exists.
fn nearest_ad_segments(
    splice: &AdSplice,
    bandwidth: u64,
    ladder_remap: &BTreeMap<u64, u64>,
) -> Vec<AdSegment> {
    let target = ladder_remap.get(&bandwidth).copied().unwrap_or(bandwidth);
    splice
        .segments
        .iter()
        .min_by_key(|(bw, _)| bw.abs_diff(target))
        .map(|(_, ads)| ads.clone())
        .unwrap_or_default()
}
