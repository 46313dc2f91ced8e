// Manifest rendering: serializes one window of one rendition into live
// HLS playlist text. Pure; rendering the same window twice yields
// byte-identical output, and consumers diff that output in tests, so tag
// order and suppression rules here are load-bearing.

use chrono::SecondsFormat;
use hls_vod::{ContentSegment, Segment, TimedMetadata};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Added to the window's media-sequence value.
    pub sequence_offset: u64,
    /// Added to the window's discontinuity-sequence value.
    pub discontinuity_offset: u64,
    /// Replaces the computed target duration when set.
    pub forced_target_duration: Option<u64>,
    /// Added on top of the computed target duration.
    pub target_duration_padding: u64,
    pub version: u8,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            sequence_offset: 0,
            discontinuity_offset: 0,
            forced_target_duration: None,
            target_duration_padding: 0,
            version: 6,
        }
    }
}

pub fn render_playlist(
    segments: &[Segment],
    media_sequence_value: u64,
    discontinuity_sequence: u64,
    opts: &RenderOptions,
) -> String {
    let mut out = String::with_capacity(256 + segments.len() * 64);

    out.push_str("#EXTM3U\n");
    out.push_str(&format!("#EXT-X-VERSION:{}\n", opts.version));
    out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
    out.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        target_duration(segments, opts)
    ));
    out.push_str(&format!(
        "#EXT-X-MEDIA-SEQUENCE:{}\n",
        opts.sequence_offset + media_sequence_value
    ));
    out.push_str(&format!(
        "#EXT-X-DISCONTINUITY-SEQUENCE:{}\n",
        opts.discontinuity_offset + discontinuity_sequence
    ));

    let last = segments.len().saturating_sub(1);
    for (idx, seg) in segments.iter().enumerate() {
        match seg {
            Segment::Marker(marker) => {
                // Boundary markers are implied by the sequence headers and
                // not re-emitted inline.
                if idx != 0 && idx != last {
                    out.push_str("#EXT-X-DISCONTINUITY\n");
                }
                if idx != last {
                    if let Some(meta) = &marker.daterange {
                        push_daterange(&mut out, meta);
                    } else if let Some(Segment::Content(next)) = segments.get(idx + 1) {
                        if let Some(ms) = next.timeline_position {
                            push_program_date_time(&mut out, ms);
                        }
                    }
                }
            }
            Segment::Content(content) => {
                push_content(&mut out, content);
                if content.cue.as_ref().is_some_and(|cue| cue.r#in) {
                    // suppress a dangling cue-in right before the window's
                    // trailing discontinuity marker
                    let next_is_trailing_marker =
                        idx + 1 == last && segments[last].is_marker();
                    if !next_is_trailing_marker {
                        out.push_str("#EXT-X-CUE-IN\n");
                    }
                }
            }
        }
    }

    out
}

fn target_duration(segments: &[Segment], opts: &RenderOptions) -> u64 {
    let max = segments
        .iter()
        .map(Segment::duration)
        .fold(0.0f64, f64::max);
    let computed = max.ceil() as u64 + opts.target_duration_padding;
    match opts.forced_target_duration {
        Some(forced) => {
            if forced < computed {
                warn!("Forced target duration {forced} is below the computed value {computed}");
            }
            forced
        }
        None => computed,
    }
}

fn push_content(out: &mut String, content: &ContentSegment) {
    if let Some(meta) = &content.daterange {
        push_daterange(out, meta);
    }

    if let Some(cue) = &content.cue {
        if cue.out {
            if let Some(scte) = &cue.scte_data {
                out.push_str("#EXT-OATCLS-SCTE35:");
                out.push_str(scte);
                out.push('\n');
            }
            if let Some(asset) = &cue.asset_data {
                out.push_str("#EXT-X-ASSET:");
                out.push_str(asset);
                out.push('\n');
            }
            out.push_str(&format!(
                "#EXT-X-CUE-OUT:DURATION={}\n",
                cue.duration.unwrap_or(0.0)
            ));
        }
        if let Some(offset) = cue.cont {
            out.push_str(&format!(
                "#EXT-X-CUE-OUT-CONT:{}/{}\n",
                offset,
                cue.duration.unwrap_or(0.0)
            ));
        }
    }

    for key in &content.keys {
        out.push_str(&format!("#EXT-X-KEY:METHOD={}", key.method));
        if let Some(uri) = &key.uri {
            out.push_str(&format!(",URI=\"{uri}\""));
        }
        if let Some(iv) = &key.iv {
            out.push_str(&format!(",IV={iv}"));
        }
        if let Some(format) = &key.key_format {
            out.push_str(&format!(",KEYFORMAT=\"{format}\""));
        }
        if let Some(versions) = &key.key_format_versions {
            out.push_str(&format!(",KEYFORMATVERSIONS=\"{versions}\""));
        }
        out.push('\n');
    }

    if let Some(init) = &content.init_segment {
        out.push_str(&format!("#EXT-X-MAP:URI=\"{}\"", init.uri));
        if let Some(range) = &init.byte_range {
            out.push_str(&format!(",BYTERANGE=\"{range}\""));
        }
        out.push('\n');
    }

    out.push_str(&format!("#EXTINF:{:.3},\n", content.duration));
    if let Some(range) = &content.byte_range {
        out.push_str(&format!("#EXT-X-BYTERANGE:{range}\n"));
    }
    out.push_str(&content.uri);
    out.push('\n');
}

fn push_daterange(out: &mut String, meta: &TimedMetadata) {
    if let Some(start) = meta.get("start-date") {
        out.push_str("#EXT-X-PROGRAM-DATE-TIME:");
        out.push_str(start);
        out.push('\n');
    }
    let attrs: Vec<String> = meta
        .iter()
        .map(|(key, value)| format!("{}=\"{value}\"", key.to_uppercase()))
        .collect();
    out.push_str("#EXT-X-DATERANGE:");
    out.push_str(&attrs.join(","));
    out.push('\n');
}

fn push_program_date_time(out: &mut String, timeline_position_ms: i64) {
    if let Some(datetime) = chrono::DateTime::from_timestamp_millis(timeline_position_ms) {
        out.push_str("#EXT-X-PROGRAM-DATE-TIME:");
        out.push_str(&datetime.to_rfc3339_opts(SecondsFormat::Millis, true));
        out.push('\n');
    }
}
