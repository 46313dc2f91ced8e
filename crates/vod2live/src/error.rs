use crate::fetch::FetchError;

/// Fatal load errors. Any of these discards all partially-ingested state
/// and leaves the asset in the same empty, reloadable state as freshly
/// constructed. Audio/subtitle lookup misses are not errors; they degrade
/// to a documented fallback at the accessor level.
#[derive(Debug, thiserror::Error)]
pub enum VodError {
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: FetchError,
    },
    #[error("playlist error: {0}")]
    Playlist(String),
    #[error("structural error: {0}")]
    Structural(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<hls_vod::ManifestError> for VodError {
    fn from(err: hls_vod::ManifestError) -> Self {
        VodError::Playlist(err.to_string())
    }
}

impl From<url::ParseError> for VodError {
    fn from(err: url::ParseError) -> Self {
        VodError::Playlist(format!("invalid URL: {err}"))
    }
}
