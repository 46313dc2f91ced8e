// The asset aggregate: owns one segment store, drives ingestion (bridging,
// splicing, windowing) and serves the generated live windows. Ingestion
// builds into a staging value that only replaces the asset's state on
// success; a failed load leaves the asset in the same empty, reloadable
// state as freshly constructed.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use hls_vod::{
    MasterManifest, MediaGroupType, PlaylistItem, Segment, TimedMetadata, parse_master,
    parse_media,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::bridge;
use crate::config::VodConfig;
use crate::error::VodError;
use crate::fetch::ManifestFetcher;
use crate::render::{RenderOptions, render_playlist};
use crate::splice::{self, AdSplice};
use crate::store::{SegmentStore, TrackMap};
use crate::window::{
    self, DeltaTime, MediaSequence, SequenceCounters, TrackSequence, WindowPlan, WindowPolicy,
};

/// One master-manifest variant as seen by capacity planning: bandwidth,
/// resolution and codec string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageProfile {
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
    pub codecs: Option<String>,
}

/// A VOD asset rewritten into a continuously-advancing live presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsVod {
    uri: String,
    config: VodConfig,
    splices: Vec<AdSplice>,
    pending_metadata: TimedMetadata,
    store: SegmentStore,
    usage_profiles: Vec<UsageProfile>,
    target_durations: BTreeMap<u64, u64>,
    audio_target_durations: BTreeMap<String, BTreeMap<String, u64>>,
    subtitle_target_durations: BTreeMap<String, BTreeMap<String, u64>>,
    ladder_remap: BTreeMap<u64, u64>,
    sequences: Vec<MediaSequence>,
    audio_sequences: Vec<TrackSequence>,
    subtitle_sequences: Vec<TrackSequence>,
    video_plan: WindowPlan,
    audio_plan: WindowPlan,
    subtitle_plan: WindowPlan,
    video_counters: SequenceCounters,
    audio_counters: SequenceCounters,
    subtitle_counters: SequenceCounters,
}

/// Everything one load produces before it is committed onto the asset.
#[derive(Debug, Default)]
struct Ingested {
    store: SegmentStore,
    splices: Vec<AdSplice>,
    usage_profiles: Vec<UsageProfile>,
    target_durations: BTreeMap<u64, u64>,
    audio_target_durations: BTreeMap<String, BTreeMap<String, u64>>,
    subtitle_target_durations: BTreeMap<String, BTreeMap<String, u64>>,
    ladder_remap: BTreeMap<u64, u64>,
}

#[derive(Debug, Default)]
struct Windows {
    sequences: Vec<MediaSequence>,
    audio_sequences: Vec<TrackSequence>,
    subtitle_sequences: Vec<TrackSequence>,
    video_plan: WindowPlan,
    audio_plan: WindowPlan,
    subtitle_plan: WindowPlan,
    video_counters: SequenceCounters,
    audio_counters: SequenceCounters,
    subtitle_counters: SequenceCounters,
}

impl HlsVod {
    pub fn new(uri: impl Into<String>, splices: Vec<AdSplice>, config: VodConfig) -> Self {
        Self {
            uri: uri.into(),
            config,
            splices,
            pending_metadata: TimedMetadata::new(),
            store: SegmentStore::default(),
            usage_profiles: Vec::new(),
            target_durations: BTreeMap::new(),
            audio_target_durations: BTreeMap::new(),
            subtitle_target_durations: BTreeMap::new(),
            ladder_remap: BTreeMap::new(),
            sequences: Vec::new(),
            audio_sequences: Vec::new(),
            subtitle_sequences: Vec::new(),
            video_plan: WindowPlan::default(),
            audio_plan: WindowPlan::default(),
            subtitle_plan: WindowPlan::default(),
            video_counters: SequenceCounters::default(),
            audio_counters: SequenceCounters::default(),
            subtitle_counters: SequenceCounters::default(),
        }
    }

    /// Ingest the asset's manifests and generate the live window list.
    pub async fn load(&mut self, fetcher: &dyn ManifestFetcher) -> Result<(), VodError> {
        self.load_inner(fetcher, None).await
    }

    /// Like [`load`](Self::load), but first copies the tail of the
    /// predecessor's last window into this asset so playback is seamless
    /// across the asset boundary. The predecessor is only borrowed for the
    /// duration of the call; no link to it is retained.
    pub async fn load_after(
        &mut self,
        predecessor: &HlsVod,
        fetcher: &dyn ManifestFetcher,
    ) -> Result<(), VodError> {
        self.load_inner(fetcher, Some(predecessor)).await
    }

    /// Stage timed metadata for the next load. It surfaces as a daterange
    /// on the first content segment of each track, or on the boundary
    /// marker when the asset is chained after a predecessor.
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pending_metadata.set(key, value);
    }

    async fn load_inner(
        &mut self,
        fetcher: &dyn ManifestFetcher,
        predecessor: Option<&HlsVod>,
    ) -> Result<(), VodError> {
        let staged = match self.ingest(fetcher, predecessor).await {
            Ok(staged) => staged,
            Err(e) => {
                self.clear_loaded();
                return Err(e);
            }
        };
        let windows = match build_windows(&staged.store, &self.config) {
            Ok(windows) => windows,
            Err(e) => {
                self.clear_loaded();
                return Err(e);
            }
        };

        self.store = staged.store;
        self.splices = staged.splices;
        self.usage_profiles = staged.usage_profiles;
        self.target_durations = staged.target_durations;
        self.audio_target_durations = staged.audio_target_durations;
        self.subtitle_target_durations = staged.subtitle_target_durations;
        self.ladder_remap = staged.ladder_remap;
        self.apply_windows(windows);
        self.pending_metadata = TimedMetadata::new();
        info!(
            "Loaded {} with {} media sequence(s) across {} bandwidth(s)",
            self.uri,
            self.sequences.len(),
            self.store.video.len()
        );
        Ok(())
    }

    async fn ingest(
        &self,
        fetcher: &dyn ManifestFetcher,
        predecessor: Option<&HlsVod>,
    ) -> Result<Ingested, VodError> {
        debug!("Fetching master manifest {}", self.uri);
        let master_url = Url::parse(&self.uri)?;
        let master_bytes = fetcher.fetch(self.uri.as_str()).await?;
        let master = parse_master(&master_bytes)?;
        if master.variants.is_empty() {
            return Err(VodError::Playlist("master playlist has no variants".into()));
        }

        let subtitle_tracks = subtitle_track_list(&master);
        if !subtitle_tracks.is_empty() && self.config.expected_subtitle_tracks.is_empty() {
            return Err(VodError::Configuration(
                "master offers subtitle tracks but no expected subtitle tracks are configured"
                    .into(),
            ));
        }

        let mut staged = Ingested {
            splices: self.splices.clone(),
            ..Ingested::default()
        };

        // deduped bandwidth ladder, master order
        let mut bandwidths: Vec<u64> = Vec::new();
        let mut ladder = Vec::new();
        for variant in &master.variants {
            if bandwidths.contains(&variant.bandwidth) {
                continue;
            }
            bandwidths.push(variant.bandwidth);
            staged.usage_profiles.push(UsageProfile {
                bandwidth: variant.bandwidth,
                resolution: variant.resolution,
                codecs: variant.codecs.clone(),
            });
            ladder.push((variant.bandwidth, variant.uri.clone()));
        }
        let audio_tracks = audio_track_list(&master);

        // The bridge runs before any new-manifest ingestion: splicing and
        // appending below assume the store already holds the carried tail.
        if let Some(prev) = predecessor {
            if let Some(tail) = prev.sequences.last() {
                bridge::bridge_video(
                    &mut staged.store,
                    &mut staged.ladder_remap,
                    tail,
                    &bandwidths,
                    &self.pending_metadata,
                );
            }
            if let Some(tail) = prev.audio_sequences.last() {
                let tracks: Vec<(String, String)> = audio_tracks
                    .iter()
                    .map(|(group, lang, _)| (group.clone(), lang.clone()))
                    .collect();
                bridge::bridge_tracks(&mut staged.store.audio, tail, &tracks, &self.pending_metadata);
            }
            if let Some(tail) = prev.subtitle_sequences.last() {
                let tracks: Vec<(String, String)> = subtitle_tracks
                    .iter()
                    .map(|(group, lang, _)| (group.clone(), lang.clone()))
                    .collect();
                bridge::bridge_tracks(
                    &mut staged.store.subtitles,
                    tail,
                    &tracks,
                    &self.pending_metadata,
                );
            }
        }

        // Video manifests are fetched concurrently; splice insertion walks
        // a shared cursor, so ingestion itself applies in ladder order.
        let master_url_ref = &master_url;
        let video_manifests = try_join_all(ladder.iter().map(|(bandwidth, uri)| {
            let bandwidth = *bandwidth;
            async move {
                let url = master_url_ref.join(uri)?;
                let bytes = fetcher.fetch(url.as_str()).await?;
                Ok::<_, VodError>((bandwidth, bytes))
            }
        }))
        .await?;

        let mut expected_items: Option<(u64, usize)> = None;
        for (bandwidth, bytes) in &video_manifests {
            let media = parse_media(bytes)?;
            match expected_items {
                None => expected_items = Some((*bandwidth, media.items.len())),
                Some((first_bw, count)) if media.items.len() != count => {
                    return Err(VodError::Structural(format!(
                        "misaligned variants: bandwidth {bandwidth} has {} playlist items, bandwidth {first_bw} has {count}",
                        media.items.len()
                    )));
                }
                Some(_) => {}
            }
            staged
                .target_durations
                .insert(*bandwidth, media.target_duration);
            let timeline = staged.store.video.entry(*bandwidth).or_default();
            splice::insert_splices(
                &media.items,
                *bandwidth,
                &mut staged.splices,
                &staged.ladder_remap,
                timeline,
            );
        }

        // Audio and subtitles only start once every video rendition is in.
        let audio_manifests = try_join_all(audio_tracks.iter().map(|(group, lang, uri)| {
            async move {
                let url = master_url_ref.join(uri)?;
                let bytes = fetcher.fetch(url.as_str()).await?;
                Ok::<_, VodError>((group.clone(), lang.clone(), bytes))
            }
        }))
        .await?;
        for (group, lang, bytes) in &audio_manifests {
            let media = parse_media(bytes)?;
            staged
                .audio_target_durations
                .entry(group.clone())
                .or_default()
                .insert(lang.clone(), media.target_duration);
            ingest_plain(&media.items, staged.store.audio_timeline_mut(group, lang));
        }

        let subtitle_manifests =
            try_join_all(subtitle_tracks.iter().map(|(group, lang, uri)| {
                async move {
                    let url = master_url_ref.join(uri)?;
                    let bytes = fetcher.fetch(url.as_str()).await?;
                    Ok::<_, VodError>((group.clone(), lang.clone(), bytes))
                }
            }))
            .await?;
        for (group, lang, bytes) in &subtitle_manifests {
            let media = parse_media(bytes)?;
            staged
                .subtitle_target_durations
                .entry(group.clone())
                .or_default()
                .insert(lang.clone(), media.target_duration);
            ingest_plain(
                &media.items,
                staged.store.subtitle_timeline_mut(group, lang),
            );
        }

        // Without a predecessor there is no boundary marker to carry the
        // staged metadata; it lands on each track's first content segment.
        if predecessor.is_none() && !self.pending_metadata.is_empty() {
            attach_metadata(&mut staged.store, &self.pending_metadata);
        }

        staged.store.collapse_markers();
        Ok(staged)
    }

    fn apply_windows(&mut self, windows: Windows) {
        self.sequences = windows.sequences;
        self.audio_sequences = windows.audio_sequences;
        self.subtitle_sequences = windows.subtitle_sequences;
        self.video_plan = windows.video_plan;
        self.audio_plan = windows.audio_plan;
        self.subtitle_plan = windows.subtitle_plan;
        self.video_counters = windows.video_counters;
        self.audio_counters = windows.audio_counters;
        self.subtitle_counters = windows.subtitle_counters;
    }

    fn clear_loaded(&mut self) {
        self.store = SegmentStore::default();
        self.usage_profiles.clear();
        self.target_durations.clear();
        self.audio_target_durations.clear();
        self.subtitle_target_durations.clear();
        self.ladder_remap.clear();
        self.apply_windows(Windows::default());
    }

    /// Rebuild the timeline from the given window onward, inserting the
    /// additional segments before the retained timeline or after the given
    /// window's elements, then re-window. The reload point's counters are
    /// folded into the regenerated series so `EXT-X-MEDIA-SEQUENCE` and
    /// `EXT-X-DISCONTINUITY-SEQUENCE` stay monotonic for clients.
    pub fn reload(
        &mut self,
        window_index: usize,
        additional_segments: BTreeMap<u64, Vec<Segment>>,
        additional_audio_segments: TrackMap,
        insert_after: bool,
    ) -> Result<(), VodError> {
        if window_index >= self.sequences.len() {
            return Err(VodError::Structural(format!(
                "no media sequence at index {window_index}"
            )));
        }
        let base_msv = self.video_counters.media_sequence_values[window_index];
        let base_disc = self.video_counters.discontinuity_sequences[window_index];
        let audio_index = window_index.min(self.audio_sequences.len().saturating_sub(1));
        let audio_bases = self
            .audio_counters
            .media_sequence_values
            .get(audio_index)
            .copied()
            .zip(
                self.audio_counters
                    .discontinuity_sequences
                    .get(audio_index)
                    .copied(),
            )
            .unwrap_or((0, 0));

        let (start, end) = self.video_plan.bounds[window_index];
        let reference_len = self.store.reference_video().map(Vec::len).unwrap_or(0);
        for (bandwidth, timeline) in &mut self.store.video {
            let deficit = reference_len - timeline.len();
            let additional = nearest_additional(&additional_segments, *bandwidth);
            rebuild_timeline(
                timeline,
                start.saturating_sub(deficit),
                end.saturating_sub(deficit),
                additional,
                insert_after,
            );
        }

        if !self.audio_sequences.is_empty() {
            let (astart, aend) = self.audio_plan.bounds[audio_index];
            let reference_len = SegmentStore::reference_track(&self.store.audio)
                .map(Vec::len)
                .unwrap_or(0);
            for (group, languages) in &mut self.store.audio {
                for (lang, timeline) in languages {
                    let deficit = reference_len - timeline.len();
                    let additional = additional_audio_segments
                        .get(group)
                        .and_then(|langs| langs.get(lang).or_else(|| langs.values().next()))
                        .cloned()
                        .unwrap_or_default();
                    rebuild_timeline(
                        timeline,
                        astart.saturating_sub(deficit),
                        aend.saturating_sub(deficit),
                        additional,
                        insert_after,
                    );
                }
            }
        }

        self.store.collapse_markers();
        let windows = build_windows(&self.store, &self.config)?;
        self.apply_windows(windows);

        for value in &mut self.video_counters.media_sequence_values {
            *value += base_msv;
        }
        for value in &mut self.video_counters.discontinuity_sequences {
            *value += base_disc;
        }
        for value in &mut self.audio_counters.media_sequence_values {
            *value += audio_bases.0;
        }
        for value in &mut self.audio_counters.discontinuity_sequences {
            *value += audio_bases.1;
        }
        Ok(())
    }

    // --- accessors ---

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn sequence_duration(&self) -> f64 {
        self.config.sequence_duration
    }

    /// Total content duration of the lowest-bandwidth timeline, in
    /// seconds (including a bridged predecessor tail).
    pub fn duration(&self) -> f64 {
        self.bandwidths()
            .first()
            .map(|bw| self.store.video_duration(*bw))
            .unwrap_or(0.0)
    }

    pub fn bandwidths(&self) -> Vec<u64> {
        self.store.bandwidths()
    }

    pub fn usage_profiles(&self) -> &[UsageProfile] {
        &self.usage_profiles
    }

    pub fn audio_groups(&self) -> Vec<&str> {
        self.store.audio.keys().map(String::as_str).collect()
    }

    pub fn audio_languages(&self, group_id: &str) -> Vec<&str> {
        self.store
            .audio
            .get(group_id)
            .map(|langs| langs.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn subtitle_groups(&self) -> Vec<&str> {
        self.store.subtitles.keys().map(String::as_str).collect()
    }

    pub fn subtitle_languages(&self, group_id: &str) -> Vec<&str> {
        self.store
            .subtitles
            .get(group_id)
            .map(|langs| langs.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    pub fn audio_sequence_count(&self) -> usize {
        self.audio_sequences.len()
    }

    pub fn subtitle_sequence_count(&self) -> usize {
        self.subtitle_sequences.len()
    }

    pub fn media_sequence_segments(&self, bandwidth: u64, index: usize) -> Option<&[Segment]> {
        self.sequences
            .get(index)
            .and_then(|seq| seq.segments.get(&bandwidth))
            .map(Vec::as_slice)
    }

    /// Audio window lookup. A missing language falls back to the first
    /// available language of the group; a missing group yields an empty
    /// slice. Lookup misses never fail.
    pub fn audio_sequence_segments(&self, group_id: &str, language: &str, index: usize) -> &[Segment] {
        track_lookup(&self.audio_sequences, group_id, language, index)
    }

    pub fn subtitle_sequence_segments(
        &self,
        group_id: &str,
        language: &str,
        index: usize,
    ) -> &[Segment] {
        track_lookup(&self.subtitle_sequences, group_id, language, index)
    }

    /// Render one window of one video rendition as live playlist text.
    pub fn media_playlist(
        &self,
        sequence_offset: u64,
        bandwidth: u64,
        index: usize,
        discontinuity_offset: u64,
    ) -> Option<String> {
        let segments = self.media_sequence_segments(bandwidth, index)?;
        Some(render_playlist(
            segments,
            self.video_counters.media_sequence_values[index],
            self.video_counters.discontinuity_sequences[index],
            &self.render_options(sequence_offset, discontinuity_offset),
        ))
    }

    pub fn audio_playlist(
        &self,
        sequence_offset: u64,
        group_id: &str,
        language: &str,
        index: usize,
        discontinuity_offset: u64,
    ) -> Option<String> {
        if index >= self.audio_sequences.len() {
            return None;
        }
        let segments = self.audio_sequence_segments(group_id, language, index);
        Some(render_playlist(
            segments,
            self.audio_counters.media_sequence_values[index],
            self.audio_counters.discontinuity_sequences[index],
            &self.render_options(sequence_offset, discontinuity_offset),
        ))
    }

    pub fn subtitle_playlist(
        &self,
        sequence_offset: u64,
        group_id: &str,
        language: &str,
        index: usize,
        discontinuity_offset: u64,
    ) -> Option<String> {
        if index >= self.subtitle_sequences.len() {
            return None;
        }
        let segments = self.subtitle_sequence_segments(group_id, language, index);
        Some(render_playlist(
            segments,
            self.subtitle_counters.media_sequence_values[index],
            self.subtitle_counters.discontinuity_sequences[index],
            &self.render_options(sequence_offset, discontinuity_offset),
        ))
    }

    pub fn delta_times(&self) -> &[DeltaTime] {
        &self.video_counters.delta_times
    }

    pub fn audio_delta_times(&self) -> &[DeltaTime] {
        &self.audio_counters.delta_times
    }

    pub fn subtitle_delta_times(&self) -> &[DeltaTime] {
        &self.subtitle_counters.delta_times
    }

    pub fn playhead_positions(&self) -> Vec<f64> {
        self.video_counters
            .delta_times
            .iter()
            .map(|delta| delta.position)
            .collect()
    }

    pub fn audio_playhead_positions(&self) -> Vec<f64> {
        self.audio_counters
            .delta_times
            .iter()
            .map(|delta| delta.position)
            .collect()
    }

    /// The discontinuity-sequence value a follower chained after this
    /// asset should offset from.
    pub fn last_discontinuity(&self) -> u64 {
        self.video_counters
            .discontinuity_sequences
            .last()
            .copied()
            .unwrap_or(0)
    }

    pub fn media_sequence_value(&self, index: usize) -> Option<u64> {
        self.video_counters.media_sequence_values.get(index).copied()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn render_options(&self, sequence_offset: u64, discontinuity_offset: u64) -> RenderOptions {
        RenderOptions {
            sequence_offset,
            discontinuity_offset,
            forced_target_duration: self.config.forced_target_duration,
            target_duration_padding: self.config.target_duration_padding,
            ..RenderOptions::default()
        }
    }
}

fn build_windows(store: &SegmentStore, config: &VodConfig) -> Result<Windows, VodError> {
    let target = config.sequence_duration;
    let empty: Vec<Segment> = Vec::new();

    let video_ref = store.reference_video().unwrap_or(&empty);
    let video_plan = window::plan_windows(video_ref, target, config.policy);
    let sequences = window::materialize_video(&video_plan, &store.video)?;
    let video_counters = window::counters_for(video_ref, &video_plan);

    let audio_ref = SegmentStore::reference_track(&store.audio).unwrap_or(&empty);
    let audio_plan = family_plan(audio_ref, &video_plan, target, config.policy);
    let audio_sequences = window::materialize_tracks(&audio_plan, &store.audio);
    let audio_counters = window::counters_for(audio_ref, &audio_plan);

    let subtitle_ref = SegmentStore::reference_track(&store.subtitles).unwrap_or(&empty);
    let subtitle_plan = family_plan(subtitle_ref, &video_plan, target, config.policy);
    let subtitle_sequences = window::materialize_tracks(&subtitle_plan, &store.subtitles);
    let subtitle_counters = window::counters_for(subtitle_ref, &subtitle_plan);

    Ok(Windows {
        sequences,
        audio_sequences,
        subtitle_sequences,
        video_plan,
        audio_plan,
        subtitle_plan,
        video_counters,
        audio_counters,
        subtitle_counters,
    })
}

/// Under the duration-threshold policy every family shares the video
/// window boundaries (windows stay index-aligned); the always-advance
/// policy windows each family over its own timeline, so counts may differ
/// and a consumer picks the nearest window by playhead position.
fn family_plan(
    reference: &[Segment],
    video_plan: &WindowPlan,
    target: f64,
    policy: WindowPolicy,
) -> WindowPlan {
    if reference.is_empty() {
        return WindowPlan::default();
    }
    match policy {
        WindowPolicy::DurationThreshold => video_plan.clone(),
        WindowPolicy::AlwaysAdvance => window::plan_windows(reference, target, policy),
    }
}

fn audio_track_list(master: &MasterManifest) -> Vec<(String, String, String)> {
    track_list(master, MediaGroupType::Audio)
}

fn subtitle_track_list(master: &MasterManifest) -> Vec<(String, String, String)> {
    track_list(master, MediaGroupType::Subtitles)
}

fn track_list(master: &MasterManifest, media_type: MediaGroupType) -> Vec<(String, String, String)> {
    let mut tracks: Vec<(String, String, String)> = Vec::new();
    for group in master.group_ids(media_type) {
        for entry in master.entries(media_type, &group) {
            let language = entry.language_or_name().to_string();
            if tracks
                .iter()
                .any(|(g, l, _)| *g == group && *l == language)
            {
                continue;
            }
            let Some(uri) = entry.uri.clone() else { continue };
            tracks.push((group.clone(), language, uri));
        }
    }
    tracks
}

fn ingest_plain(items: &[PlaylistItem], out: &mut Vec<Segment>) {
    for item in items {
        if item.discontinuity && !matches!(out.last(), None | Some(Segment::Marker(_))) {
            out.push(Segment::marker());
        }
        out.push(item.to_segment());
    }
}

fn attach_metadata(store: &mut SegmentStore, metadata: &TimedMetadata) {
    for timeline in store.timelines_mut() {
        if let Some(first) = timeline.iter_mut().find_map(Segment::as_content_mut) {
            if first.daterange.is_none() {
                first.daterange = Some(metadata.clone());
            }
        }
    }
}

fn nearest_additional(map: &BTreeMap<u64, Vec<Segment>>, bandwidth: u64) -> Vec<Segment> {
    if let Some(exact) = map.get(&bandwidth) {
        return exact.clone();
    }
    map.iter()
        .min_by_key(|(bw, _)| bw.abs_diff(bandwidth))
        .map(|(_, segments)| segments.clone())
        .unwrap_or_default()
}

fn rebuild_timeline(
    timeline: &mut Vec<Segment>,
    start: usize,
    end: usize,
    additional: Vec<Segment>,
    insert_after: bool,
) {
    let start = start.min(timeline.len());
    let end = end.min(timeline.len());
    let retained: Vec<Segment> = timeline[start..].to_vec();
    if additional.is_empty() {
        *timeline = retained;
        return;
    }
    let window_len = end - start;
    let mut rebuilt = Vec::with_capacity(retained.len() + additional.len() + 2);
    if insert_after {
        rebuilt.extend_from_slice(&retained[..window_len]);
        rebuilt.push(Segment::marker());
        rebuilt.extend(additional);
        if window_len < retained.len() {
            rebuilt.push(Segment::marker());
            rebuilt.extend_from_slice(&retained[window_len..]);
        }
    } else {
        rebuilt.extend(additional);
        rebuilt.push(Segment::marker());
        rebuilt.extend(retained);
    }
    *timeline = rebuilt;
}

fn track_lookup<'a>(
    sequences: &'a [TrackSequence],
    group_id: &str,
    language: &str,
    index: usize,
) -> &'a [Segment] {
    let Some(sequence) = sequences.get(index) else {
        return &[];
    };
    let Some(languages) = sequence.segments.get(group_id) else {
        return &[];
    };
    languages
        .get(language)
        .or_else(|| languages.values().next())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubtitleTrack;
    use crate::fetch::FetchError;
    use crate::splice::AdSegment;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;

    const BASE: &str = "https://vod.example.com/";

    struct MockFetcher {
        responses: HashMap<String, String>,
    }

    impl MockFetcher {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
            }
        }

        fn with(mut self, uri: &str, body: String) -> Self {
            self.responses.insert(uri.to_string(), body);
            self
        }
    }

    #[async_trait]
    impl ManifestFetcher for MockFetcher {
        async fn fetch(&self, uri: &str) -> Result<Bytes, FetchError> {
            self.responses
                .get(uri)
                .map(|body| Bytes::from(body.clone()))
                .ok_or_else(|| FetchError::Status {
                    status: 404,
                    uri: uri.to_string(),
                })
        }
    }

    fn master_named(bandwidths: &[u64], stem: &str) -> String {
        let mut out = String::from("#EXTM3U\n");
        for bw in bandwidths {
            out.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={bw},RESOLUTION=1280x720,CODECS=\"avc1.4d001f,mp4a.40.2\"\n{stem}-{bw}.m3u8\n"
            ));
        }
        out
    }

    fn master(bandwidths: &[u64]) -> String {
        master_named(bandwidths, "video")
    }

    fn master_with_audio(bandwidths: &[u64], languages: &[&str]) -> String {
        let mut out = String::from("#EXTM3U\n");
        for lang in languages {
            out.push_str(&format!(
                "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",LANGUAGE=\"{lang}\",NAME=\"{lang}\",DEFAULT=NO,AUTOSELECT=YES,URI=\"audio-{lang}.m3u8\"\n"
            ));
        }
        for bw in bandwidths {
            out.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={bw},RESOLUTION=1280x720,CODECS=\"avc1.4d001f,mp4a.40.2\",AUDIO=\"aac\"\nvideo-{bw}.m3u8\n"
            ));
        }
        out
    }

    fn media(count: usize, duration: f64, prefix: &str) -> String {
        let mut out = format!(
            "#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-TARGETDURATION:{}\n#EXT-X-MEDIA-SEQUENCE:0\n",
            duration.ceil() as u64
        );
        for n in 0..count {
            out.push_str(&format!("#EXTINF:{duration:.3},\n{prefix}_{n}.ts\n"));
        }
        out.push_str("#EXT-X-ENDLIST\n");
        out
    }

    fn fetcher_for(bandwidths: &[u64], count: usize, duration: f64) -> MockFetcher {
        let mut fetcher =
            MockFetcher::new().with(&format!("{BASE}master.m3u8"), master(bandwidths));
        for bw in bandwidths {
            fetcher = fetcher.with(
                &format!("{BASE}video-{bw}.m3u8"),
                media(count, duration, &format!("v{bw}")),
            );
        }
        fetcher
    }

    fn chained_fetcher(pred_bws: &[u64], succ_bws: &[u64], count: usize) -> MockFetcher {
        let mut fetcher = MockFetcher::new()
            .with(&format!("{BASE}master.m3u8"), master_named(pred_bws, "video"))
            .with(&format!("{BASE}next.m3u8"), master_named(succ_bws, "next"));
        for bw in pred_bws {
            fetcher = fetcher.with(
                &format!("{BASE}video-{bw}.m3u8"),
                media(count, 6.0, &format!("v{bw}")),
            );
        }
        for bw in succ_bws {
            fetcher = fetcher.with(
                &format!("{BASE}next-{bw}.m3u8"),
                media(count, 6.0, &format!("w{bw}")),
            );
        }
        fetcher
    }

    #[tokio::test]
    async fn partitions_a_vod_into_bounded_windows() {
        // 2646 s of 6 s segments at a 60 s target: 44 full windows plus
        // the final partial one.
        let fetcher = fetcher_for(&[1212000], 441, 6.0);
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        vod.load(&fetcher).await.unwrap();

        assert_eq!(vod.sequence_count(), 45);
        assert_eq!(vod.duration(), 2646.0);
        let window0 = vod.media_sequence_segments(1212000, 0).unwrap();
        assert_eq!(window0.len(), 10);
        assert_eq!(window0[0].uri(), Some("v1212000_0.ts"));

        let text = vod.media_playlist(0, 1212000, 0, 0).unwrap();
        assert!(text.contains("#EXT-X-TARGETDURATION:6\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(text.contains("#EXTINF:6.000,\nv1212000_0.ts\n"));

        let profiles = vod.usage_profiles();
        assert_eq!(profiles[0].bandwidth, 1212000);
        assert_eq!(profiles[0].resolution, Some((1280, 720)));
    }

    #[tokio::test]
    async fn adjacent_windows_share_no_content_segment() {
        let fetcher = fetcher_for(&[1000], 50, 6.0);
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        vod.load(&fetcher).await.unwrap();

        for index in 0..vod.sequence_count() - 1 {
            let current = vod.media_sequence_segments(1000, index).unwrap();
            let next = vod.media_sequence_segments(1000, index + 1).unwrap();
            let last_uri = current.iter().rev().find_map(Segment::uri).unwrap();
            let first_uri = next.iter().find_map(Segment::uri).unwrap();
            assert_ne!(last_uri, first_uri);
        }
    }

    #[tokio::test]
    async fn ad_splice_wraps_break_and_bumps_discontinuity_sequence() {
        let mut ads = BTreeMap::new();
        ads.insert(
            1000_u64,
            vec![
                AdSegment { duration: 3.0, uri: "ad_1.ts".into() },
                AdSegment { duration: 3.0, uri: "ad_2.ts".into() },
                AdSegment { duration: 3.0, uri: "ad_3.ts".into() },
            ],
        );
        let splices = vec![AdSplice { position: 10.0, segments: ads }];
        let fetcher = fetcher_for(&[1000], 6, 9.0);
        let config = VodConfig {
            sequence_duration: 12.0,
            ..VodConfig::default()
        };
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), splices, config);
        vod.load(&fetcher).await.unwrap();

        // break lands after the first 9 s segment
        let window0 = vod.media_sequence_segments(1000, 0).unwrap();
        assert_eq!(window0[0].uri(), Some("v1000_0.ts"));
        assert!(window0[1].is_marker());
        assert_eq!(window0[2].uri(), Some("ad_1.ts"));

        // the window with the resumed source sits one discontinuity ahead
        // of the window before the break
        let before = vod.media_playlist(0, 1000, 0, 0).unwrap();
        let resumed = vod.media_playlist(0, 1000, 1, 0).unwrap();
        assert!(before.contains("#EXT-X-DISCONTINUITY-SEQUENCE:0\n"));
        assert!(resumed.contains("#EXT-X-DISCONTINUITY-SEQUENCE:1\n"));
        assert!(resumed.contains("#EXT-X-DISCONTINUITY\n"));
        assert!(resumed.contains("#EXTINF:3.000,\nad_3.ts\n"));
        assert!(resumed.contains("#EXTINF:9.000,\nv1000_1.ts\n"));
    }

    #[tokio::test]
    async fn chaining_carries_predecessor_tail() {
        let fetcher = chained_fetcher(&[1000, 2000], &[1000, 2000], 30);
        let mut pred = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        pred.load(&fetcher).await.unwrap();
        assert_eq!(pred.sequence_count(), 3);

        let mut next = HlsVod::new(format!("{BASE}next.m3u8"), vec![], VodConfig::default());
        next.load_after(&pred, &fetcher).await.unwrap();

        assert_eq!(next.bandwidths(), vec![1000, 2000]);
        // first window replays the predecessor's last window tail
        let window0 = next.media_sequence_segments(1000, 0).unwrap();
        assert_eq!(window0[0].uri(), Some("v1000_20.ts"));
        // the boundary marker opens the following window and bumps the
        // discontinuity sequence
        let window1 = next.media_sequence_segments(1000, 1).unwrap();
        assert!(window1[0].is_marker());
        assert!(window1[0].as_marker().unwrap().vod_transition);
        let text = next.media_playlist(0, 1000, 1, 0).unwrap();
        assert!(text.contains("#EXT-X-DISCONTINUITY-SEQUENCE:1\n"));
        assert_eq!(window1[1].uri(), Some("w1000_0.ts"));
    }

    #[tokio::test]
    async fn ladder_shrink_drops_the_extra_predecessor_rung() {
        let fetcher = chained_fetcher(&[1000, 2000, 3000, 4000], &[1000, 2000, 3000], 30);
        let mut pred = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        pred.load(&fetcher).await.unwrap();

        let mut next = HlsVod::new(format!("{BASE}next.m3u8"), vec![], VodConfig::default());
        next.load_after(&pred, &fetcher).await.unwrap();

        assert_eq!(next.bandwidths(), vec![1000, 2000, 3000]);
        for bw in [1000_u64, 2000, 3000] {
            let window0 = next.media_sequence_segments(bw, 0).unwrap();
            assert_eq!(window0[0].uri(), Some(format!("v{bw}_20.ts").as_str()));
        }
    }

    #[tokio::test]
    async fn ladder_growth_ingests_new_top_rung_standalone() {
        let fetcher = chained_fetcher(&[1000, 2000, 3000], &[1000, 2000, 3000, 4000], 30);
        let mut pred = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        pred.load(&fetcher).await.unwrap();

        let mut next = HlsVod::new(format!("{BASE}next.m3u8"), vec![], VodConfig::default());
        next.load_after(&pred, &fetcher).await.unwrap();

        assert_eq!(next.bandwidths(), vec![1000, 2000, 3000, 4000]);
        // inherited rungs replay the predecessor tail in window 0; the new
        // top rung has nothing there and joins with its own content later
        assert_eq!(
            next.media_sequence_segments(1000, 0).unwrap()[0].uri(),
            Some("v1000_20.ts")
        );
        assert!(next.media_sequence_segments(4000, 0).unwrap().is_empty());
        let window1 = next.media_sequence_segments(4000, 1).unwrap();
        assert_eq!(window1[0].uri(), Some("w4000_0.ts"));
    }

    #[tokio::test]
    async fn timed_metadata_renders_on_the_first_window() {
        let fetcher = fetcher_for(&[1000], 20, 6.0);
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        vod.add_metadata("start-date", "2024-05-01T12:00:00.000Z");
        vod.add_metadata("end-date", "2024-05-01T12:00:30.000Z");
        vod.load(&fetcher).await.unwrap();

        let text = vod.media_playlist(0, 1000, 0, 0).unwrap();
        assert!(text.contains(
            "#EXT-X-PROGRAM-DATE-TIME:2024-05-01T12:00:00.000Z\n\
#EXT-X-DATERANGE:START-DATE=\"2024-05-01T12:00:00.000Z\",END-DATE=\"2024-05-01T12:00:30.000Z\"\n\
#EXTINF:6.000,\nv1000_0.ts\n"
        ));
        // consumed by the load; later windows carry no daterange
        let later = vod.media_playlist(0, 1000, 1, 0).unwrap();
        assert!(!later.contains("#EXT-X-DATERANGE"));
    }

    #[tokio::test]
    async fn chained_metadata_rides_the_boundary_marker() {
        let fetcher = chained_fetcher(&[1000], &[1000], 30);
        let mut pred = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        pred.load(&fetcher).await.unwrap();

        let mut next = HlsVod::new(format!("{BASE}next.m3u8"), vec![], VodConfig::default());
        next.add_metadata("start-date", "2024-05-01T12:00:00.000Z");
        next.load_after(&pred, &fetcher).await.unwrap();

        // the marker leads window 1: suppressed inline, daterange kept
        let text = next.media_playlist(0, 1000, 1, 0).unwrap();
        assert!(!text.contains("#EXT-X-DISCONTINUITY\n"));
        assert!(text.contains(
            "#EXT-X-PROGRAM-DATE-TIME:2024-05-01T12:00:00.000Z\n\
#EXT-X-DATERANGE:START-DATE=\"2024-05-01T12:00:00.000Z\"\n"
        ));
    }

    #[tokio::test]
    async fn failed_load_resets_to_an_empty_reusable_state() {
        // master resolves but one variant is missing
        let fetcher = MockFetcher::new()
            .with(&format!("{BASE}master.m3u8"), master(&[1000, 2000]))
            .with(&format!("{BASE}video-1000.m3u8"), media(10, 6.0, "v1000"));
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());

        assert!(matches!(
            vod.load(&fetcher).await,
            Err(VodError::Transport { .. })
        ));
        assert_eq!(vod.sequence_count(), 0);
        assert!(vod.bandwidths().is_empty());

        // the asset stays reusable after the rollback
        let fetcher = fetcher_for(&[1000], 10, 6.0);
        vod.load(&fetcher).await.unwrap();
        assert_eq!(vod.bandwidths(), vec![1000]);
        assert!(vod.sequence_count() > 0);
    }

    #[tokio::test]
    async fn misaligned_variant_counts_fail_structurally() {
        let fetcher = MockFetcher::new()
            .with(&format!("{BASE}master.m3u8"), master(&[1000, 2000]))
            .with(&format!("{BASE}video-1000.m3u8"), media(10, 6.0, "v1000"))
            .with(&format!("{BASE}video-2000.m3u8"), media(11, 6.0, "v2000"));
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());

        assert!(matches!(
            vod.load(&fetcher).await,
            Err(VodError::Structural(_))
        ));
        assert_eq!(vod.sequence_count(), 0);
    }

    #[tokio::test]
    async fn audio_lookup_falls_back_to_the_first_language() {
        let fetcher = MockFetcher::new()
            .with(
                &format!("{BASE}master.m3u8"),
                master_with_audio(&[1000], &["en", "sv"]),
            )
            .with(&format!("{BASE}video-1000.m3u8"), media(20, 6.0, "v1000"))
            .with(&format!("{BASE}audio-en.m3u8"), media(20, 6.0, "a_en"))
            .with(&format!("{BASE}audio-sv.m3u8"), media(20, 6.0, "a_sv"));
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        vod.load(&fetcher).await.unwrap();

        assert_eq!(vod.audio_groups(), vec!["aac"]);
        assert_eq!(vod.audio_languages("aac"), vec!["en", "sv"]);
        // same index boundaries as video under the duration-threshold policy
        assert_eq!(vod.audio_sequence_count(), vod.sequence_count());

        // unknown language degrades to the group's first language
        let fallback = vod.audio_sequence_segments("aac", "de", 0);
        assert_eq!(fallback[0].uri(), Some("a_en_0.ts"));
        // unknown group degrades to an empty result, never an error
        assert!(vod.audio_sequence_segments("other", "en", 0).is_empty());

        let text = vod.audio_playlist(0, "aac", "sv", 0, 0).unwrap();
        assert!(text.contains("#EXTINF:6.000,\na_sv_0.ts\n"));
    }

    #[tokio::test]
    async fn subtitles_without_track_configuration_fail_fast() {
        let master_text = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",LANGUAGE=\"en\",NAME=\"English\",URI=\"subs-en.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000,RESOLUTION=1280x720,SUBTITLES=\"subs\"\nvideo-1000.m3u8\n"
            .to_string();
        let fetcher = MockFetcher::new()
            .with(&format!("{BASE}master.m3u8"), master_text)
            .with(&format!("{BASE}video-1000.m3u8"), media(10, 6.0, "v1000"))
            .with(&format!("{BASE}subs-en.m3u8"), media(10, 6.0, "s_en"));

        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        assert!(matches!(
            vod.load(&fetcher).await,
            Err(VodError::Configuration(_))
        ));

        let config = VodConfig {
            expected_subtitle_tracks: vec![SubtitleTrack {
                group_id: "subs".into(),
                language: "en".into(),
            }],
            ..VodConfig::default()
        };
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], config);
        vod.load(&fetcher).await.unwrap();
        assert_eq!(vod.subtitle_groups(), vec!["subs"]);
        let text = vod.subtitle_playlist(0, "subs", "en", 0, 0).unwrap();
        assert!(text.contains("s_en_0.ts\n"));
    }

    #[tokio::test]
    async fn always_advance_windows_each_expose_new_content() {
        let fetcher = MockFetcher::new()
            .with(
                &format!("{BASE}master.m3u8"),
                master_with_audio(&[1000], &["en"]),
            )
            .with(&format!("{BASE}video-1000.m3u8"), media(12, 6.0, "v1000"))
            .with(&format!("{BASE}audio-en.m3u8"), media(16, 4.5, "a_en"));
        let config = VodConfig {
            sequence_duration: 18.0,
            policy: WindowPolicy::AlwaysAdvance,
            ..VodConfig::default()
        };
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], config);
        vod.load(&fetcher).await.unwrap();

        assert!(vod.sequence_count() > 1);
        assert!(vod.audio_sequence_count() > 1);

        // each window appends at least one new segment and the media
        // sequence advances strictly
        for index in 1..vod.sequence_count() {
            let prev = vod.media_sequence_segments(1000, index - 1).unwrap();
            let current = vod.media_sequence_segments(1000, index).unwrap();
            let prev_last = prev.last().and_then(Segment::uri).unwrap();
            let current_last = current.last().and_then(Segment::uri).unwrap();
            assert_ne!(prev_last, current_last, "window must expose new content");
            assert!(
                vod.media_sequence_value(index).unwrap()
                    > vod.media_sequence_value(index - 1).unwrap()
            );
        }

        // all content is eventually exposed
        let last = vod
            .media_sequence_segments(1000, vod.sequence_count() - 1)
            .unwrap();
        assert_eq!(last.last().unwrap().uri(), Some("v1000_11.ts"));

        // delta-time series starts at the origin and only moves forward
        assert_eq!(vod.delta_times()[0], DeltaTime::default());
        let positions = vod.playhead_positions();
        assert!(positions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(!vod.audio_playhead_positions().is_empty());
    }

    #[tokio::test]
    async fn state_round_trips_through_json() {
        let fetcher = chained_fetcher(&[1000], &[1000], 30);
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        vod.load(&fetcher).await.unwrap();

        let json = vod.to_json().unwrap();
        let restored = HlsVod::from_json(&json).unwrap();
        assert_eq!(restored.sequence_count(), vod.sequence_count());
        assert_eq!(
            restored.media_playlist(0, 1000, 1, 0),
            vod.media_playlist(0, 1000, 1, 0)
        );

        // a follower process can chain after the restored predecessor
        let mut next = HlsVod::new(format!("{BASE}next.m3u8"), vec![], VodConfig::default());
        next.load_after(&restored, &fetcher).await.unwrap();
        assert_eq!(
            next.media_sequence_segments(1000, 0).unwrap()[0].uri(),
            Some("v1000_20.ts")
        );
    }

    #[tokio::test]
    async fn reload_inserts_segments_and_keeps_counters_monotonic() {
        let fetcher = fetcher_for(&[1000], 30, 6.0);
        let mut vod = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        vod.load(&fetcher).await.unwrap();
        assert_eq!(vod.sequence_count(), 3);

        let mut additional = BTreeMap::new();
        additional.insert(
            1000_u64,
            vec![
                Segment::content(6.0, "live_0.ts"),
                Segment::content(6.0, "live_1.ts"),
            ],
        );
        vod.reload(1, additional, TrackMap::default(), false).unwrap();

        let window0 = vod.media_sequence_segments(1000, 0).unwrap();
        assert_eq!(window0[0].uri(), Some("live_0.ts"));
        // retained timeline resumes behind a collapsible marker
        assert!(window0.iter().any(Segment::is_marker));

        // the reload point's media-sequence value is folded in, so the
        // header counter never moves backwards for clients
        let text = vod.media_playlist(0, 1000, 0, 0).unwrap();
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:10\n"));
    }

    #[tokio::test]
    async fn last_discontinuity_feeds_the_next_offset() {
        let fetcher = chained_fetcher(&[1000], &[1000], 30);
        let mut pred = HlsVod::new(format!("{BASE}master.m3u8"), vec![], VodConfig::default());
        pred.load(&fetcher).await.unwrap();
        assert_eq!(pred.last_discontinuity(), 0);

        let mut next = HlsVod::new(format!("{BASE}next.m3u8"), vec![], VodConfig::default());
        next.load_after(&pred, &fetcher).await.unwrap();
        assert_eq!(next.last_discontinuity(), 1);

        // offsets land verbatim in the rendered headers
        let text = next
            .media_playlist(100, 1000, 0, pred.last_discontinuity())
            .unwrap();
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:100\n"));
    }
}
