// Typed facade over the external m3u8 parser. Everything downstream of this
// module works with closed records; m3u8_rs types never leak past it.

use m3u8_rs::{AlternativeMediaType, Playlist, parse_playlist_res};

use crate::segment::{ByteRange, ContentSegment, Cue, InitSegment, Segment, SegmentKey};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse playlist: {0}")]
    Parse(String),
    #[error("expected a master playlist, got a media playlist")]
    ExpectedMaster,
    #[error("expected a media playlist, got a master playlist")]
    ExpectedMedia,
}

/// A master manifest: the stream variants and the named media groups.
#[derive(Debug, Clone)]
pub struct MasterManifest {
    pub variants: Vec<VariantStream>,
    pub groups: Vec<MediaGroupEntry>,
}

#[derive(Debug, Clone)]
pub struct VariantStream {
    pub uri: String,
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
    pub codecs: Option<String>,
    pub audio: Option<String>,
    pub subtitles: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaGroupType {
    Audio,
    Subtitles,
}

/// One `EXT-X-MEDIA` entry of the master manifest.
#[derive(Debug, Clone)]
pub struct MediaGroupEntry {
    pub media_type: MediaGroupType,
    pub group_id: String,
    pub language: Option<String>,
    pub name: String,
    pub uri: Option<String>,
    pub channels: Option<String>,
    pub default: bool,
    pub autoselect: bool,
}

impl MediaGroupEntry {
    /// Language tag, falling back to the display name when absent.
    pub fn language_or_name(&self) -> &str {
        self.language.as_deref().unwrap_or(&self.name)
    }
}

impl MasterManifest {
    /// Distinct group ids of the given type that reference a playlist.
    pub fn group_ids(&self, media_type: MediaGroupType) -> Vec<String> {
        let mut ids = Vec::new();
        for entry in &self.groups {
            if entry.media_type == media_type
                && entry.uri.is_some()
                && !ids.contains(&entry.group_id)
            {
                ids.push(entry.group_id.clone());
            }
        }
        ids
    }

    pub fn entries(
        &self,
        media_type: MediaGroupType,
        group_id: &str,
    ) -> impl Iterator<Item = &MediaGroupEntry> {
        self.groups.iter().filter(move |entry| {
            entry.media_type == media_type && entry.group_id == group_id && entry.uri.is_some()
        })
    }
}

/// A media manifest: the ordered playlist items of one rendition.
#[derive(Debug, Clone)]
pub struct MediaManifest {
    pub target_duration: u64,
    pub items: Vec<PlaylistItem>,
    pub end_list: bool,
}

/// One parsed playlist entry with all attributes the engine consumes.
#[derive(Debug, Clone)]
pub struct PlaylistItem {
    pub duration: f64,
    pub uri: String,
    pub discontinuity: bool,
    pub timeline_position: Option<i64>,
    pub byte_range: Option<ByteRange>,
    pub map_uri: Option<String>,
    pub map_byte_range: Option<ByteRange>,
    pub key: Option<SegmentKey>,
    pub cue: Option<Cue>,
}

impl From<&PlaylistItem> for ContentSegment {
    fn from(item: &PlaylistItem) -> Self {
        ContentSegment {
            duration: item.duration,
            uri: item.uri.clone(),
            timeline_position: item.timeline_position,
            cue: item.cue.clone(),
            byte_range: item.byte_range,
            init_segment: item.map_uri.as_ref().map(|uri| InitSegment {
                uri: uri.clone(),
                byte_range: item.map_byte_range,
            }),
            keys: item.key.clone().into_iter().collect(),
            daterange: None,
        }
    }
}

impl PlaylistItem {
    pub fn to_segment(&self) -> Segment {
        Segment::Content(self.into())
    }
}

pub fn parse_master(bytes: &[u8]) -> Result<MasterManifest, ManifestError> {
    match parse_playlist_res(bytes) {
        Ok(Playlist::MasterPlaylist(master)) => {
            let variants = master
                .variants
                .iter()
                .filter(|v| !v.is_i_frame)
                .map(|v| VariantStream {
                    uri: v.uri.clone(),
                    bandwidth: v.bandwidth,
                    resolution: v.resolution.map(|r| (r.width, r.height)),
                    codecs: v.codecs.clone(),
                    audio: v.audio.clone(),
                    subtitles: v.subtitles.clone(),
                })
                .collect();

            let groups = master
                .alternatives
                .iter()
                .filter_map(|alt| {
                    let media_type = match alt.media_type {
                        AlternativeMediaType::Audio => MediaGroupType::Audio,
                        AlternativeMediaType::Subtitles => MediaGroupType::Subtitles,
                        _ => return None,
                    };
                    Some(MediaGroupEntry {
                        media_type,
                        group_id: alt.group_id.clone(),
                        language: alt.language.clone(),
                        name: alt.name.clone(),
                        uri: alt.uri.clone(),
                        channels: alt.channels.clone(),
                        default: alt.default,
                        autoselect: alt.autoselect,
                    })
                })
                .collect();

            Ok(MasterManifest { variants, groups })
        }
        Ok(Playlist::MediaPlaylist(_)) => Err(ManifestError::ExpectedMaster),
        Err(e) => Err(ManifestError::Parse(e.to_string())),
    }
}

pub fn parse_media(bytes: &[u8]) -> Result<MediaManifest, ManifestError> {
    match parse_playlist_res(bytes) {
        Ok(Playlist::MediaPlaylist(media)) => {
            let mut items: Vec<PlaylistItem> = media
                .segments
                .iter()
                .map(|seg| PlaylistItem {
                    duration: f64::from(seg.duration),
                    uri: seg.uri.clone(),
                    discontinuity: seg.discontinuity,
                    timeline_position: seg.program_date_time.map(|pdt| pdt.timestamp_millis()),
                    byte_range: seg.byte_range.as_ref().map(|range| ByteRange {
                        length: range.length,
                        offset: range.offset,
                    }),
                    map_uri: seg.map.as_ref().map(|map| map.uri.clone()),
                    map_byte_range: seg.map.as_ref().and_then(|map| {
                        map.byte_range.as_ref().map(|range| ByteRange {
                            length: range.length,
                            offset: range.offset,
                        })
                    }),
                    key: seg.key.as_ref().map(|key| SegmentKey {
                        method: key_method(&key.method),
                        uri: key.uri.clone(),
                        iv: key.iv.clone(),
                        key_format: key.keyformat.clone(),
                        key_format_versions: key.keyformatversions.clone(),
                    }),
                    cue: cue_from_tags(seg),
                })
                .collect();

            // An EXT-X-CUE-IN tag precedes the first segment after a
            // break, so the parser hangs it on that segment; the rendered
            // protocol closes the break after the last break segment
            // instead. Shift the flag back one item so a parse/render
            // round trip keeps the tag in place.
            for index in 1..items.len() {
                if !items[index].cue.as_ref().is_some_and(|cue| cue.r#in) {
                    continue;
                }
                if let Some(cue) = items[index].cue.as_mut() {
                    cue.r#in = false;
                }
                if items[index].cue.as_ref() == Some(&Cue::default()) {
                    items[index].cue = None;
                }
                items[index - 1].cue.get_or_insert_with(Cue::default).r#in = true;
            }

            Ok(MediaManifest {
                target_duration: media.target_duration,
                items,
                end_list: media.end_list,
            })
        }
        Ok(Playlist::MasterPlaylist(_)) => Err(ManifestError::ExpectedMedia),
        Err(e) => Err(ManifestError::Parse(e.to_string())),
    }
}

fn key_method(method: &m3u8_rs::KeyMethod) -> String {
    match method {
        m3u8_rs::KeyMethod::None => "NONE".to_string(),
        m3u8_rs::KeyMethod::AES128 => "AES-128".to_string(),
        m3u8_rs::KeyMethod::SampleAES => "SAMPLE-AES".to_string(),
        m3u8_rs::KeyMethod::Other(other) => other.clone(),
    }
}

// The parser does not model SCTE-35 cue tags; they arrive as unknown tags
// attached to the following segment.
fn cue_from_tags(seg: &m3u8_rs::MediaSegment) -> Option<Cue> {
    let mut cue = Cue::default();
    let mut present = false;

    for tag in &seg.unknown_tags {
        match tag.tag.as_str() {
            "X-CUE-OUT" => {
                cue.out = true;
                cue.duration = tag.rest.as_deref().and_then(parse_cue_out_duration);
                present = true;
            }
            "X-CUE-OUT-CONT" => {
                if let Some((offset, duration)) = tag.rest.as_deref().and_then(parse_cue_cont) {
                    cue.cont = Some(offset);
                    cue.duration = Some(duration);
                    present = true;
                }
            }
            "X-CUE-IN" => {
                cue.r#in = true;
                present = true;
            }
            "OATCLS-SCTE35" => {
                cue.scte_data = tag.rest.clone();
                present = true;
            }
            "X-ASSET" => {
                cue.asset_data = tag.rest.clone();
                present = true;
            }
            _ => {}
        }
    }

    present.then_some(cue)
}

/// `DURATION=30` or a bare `30`.
fn parse_cue_out_duration(rest: &str) -> Option<f64> {
    let value = rest
        .strip_prefix("DURATION=")
        .or_else(|| rest.strip_prefix("duration="))
        .unwrap_or(rest);
    value.trim().parse().ok()
}

/// `15/30` or `ElapsedTime=15,Duration=30`.
fn parse_cue_cont(rest: &str) -> Option<(f64, f64)> {
    if let Some((elapsed, total)) = rest.split_once('/') {
        return Some((elapsed.trim().parse().ok()?, total.trim().parse().ok()?));
    }
    let mut elapsed = None;
    let mut total = None;
    for attr in rest.split(',') {
        let (name, value) = attr.split_once('=')?;
        match name.trim().to_ascii_lowercase().as_str() {
            "elapsedtime" => elapsed = value.trim().parse().ok(),
            "duration" => total = value.trim().parse().ok(),
            _ => {}
        }
    }
    Some((elapsed?, total?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",LANGUAGE=\"en\",NAME=\"English\",DEFAULT=YES,AUTOSELECT=YES,CHANNELS=\"2\",URI=\"audio-en.m3u8\"\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",LANGUAGE=\"sv\",NAME=\"Svenska\",DEFAULT=NO,AUTOSELECT=YES,URI=\"audio-sv.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=1212000,RESOLUTION=1280x720,CODECS=\"avc1.4d001f,mp4a.40.2\",AUDIO=\"aac\"\n\
video-1212.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2424000,RESOLUTION=1920x1080,CODECS=\"avc1.4d0028,mp4a.40.2\",AUDIO=\"aac\"\n\
video-2424.m3u8\n";

    const MEDIA: &str = "#EXTM3U\n\
#EXT-X-VERSION:6\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-OATCLS-SCTE35:/DAlAAAAAAAA\n\
#EXT-X-CUE-OUT:DURATION=30\n\
#EXTINF:9.000,\n\
ad_001.ts\n\
#EXT-X-CUE-OUT-CONT:9/30\n\
#EXTINF:9.000,\n\
ad_002.ts\n\
#EXT-X-CUE-IN\n\
#EXTINF:9.000,\n\
seg_001.ts\n\
#EXT-X-ENDLIST\n";

    #[test]
    fn parses_master_variants_and_groups() {
        let master = parse_master(MASTER.as_bytes()).unwrap();
        assert_eq!(master.variants.len(), 2);
        assert_eq!(master.variants[0].bandwidth, 1212000);
        assert_eq!(master.variants[0].resolution, Some((1280, 720)));
        assert_eq!(master.variants[0].audio.as_deref(), Some("aac"));

        assert_eq!(master.group_ids(MediaGroupType::Audio), vec!["aac"]);
        let langs: Vec<&str> = master
            .entries(MediaGroupType::Audio, "aac")
            .map(|e| e.language_or_name())
            .collect();
        assert_eq!(langs, vec!["en", "sv"]);
    }

    #[test]
    fn extracts_cue_attributes_from_unknown_tags() {
        let media = parse_media(MEDIA.as_bytes()).unwrap();
        assert_eq!(media.items.len(), 3);

        let out = media.items[0].cue.as_ref().unwrap();
        assert!(out.out);
        assert_eq!(out.duration, Some(30.0));
        assert_eq!(out.scte_data.as_deref(), Some("/DAlAAAAAAAA"));

        // the cue-in flag lands on the last break segment, where the
        // renderer closes the break
        let cont = media.items[1].cue.as_ref().unwrap();
        assert_eq!(cont.cont, Some(9.0));
        assert_eq!(cont.duration, Some(30.0));
        assert!(cont.r#in);

        assert!(media.items[2].cue.is_none());
    }

    #[test]
    fn media_given_to_parse_master_is_rejected() {
        assert!(matches!(
            parse_master(MEDIA.as_bytes()),
            Err(ManifestError::ExpectedMaster)
        ));
    }
}
