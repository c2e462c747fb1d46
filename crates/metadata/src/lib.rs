use std::path::Path;

use common::Track;
use lofty::error::LoftyError;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::{ItemKey, TaggedFileExt};

/// Best-effort view of a file's embedded tags. Every field is optional; the
/// caller fills gaps from the previous record or the filename.
#[derive(Debug, Default, Clone)]
pub struct PartialMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    /// Raw bytes of the embedded front cover, if any.
    pub artwork: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Reads embedded tags from an audio file. Unsupported formats and corrupt
/// headers come back as `Err`; the indexer treats that as an empty partial
/// so one unreadable file never takes down a batch.
pub fn extract(path: &Path) -> Result<PartialMetadata, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;

    let mut info = PartialMetadata::default();
    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag.get_string(&ItemKey::TrackTitle).map(|v| v.to_string());
        let album_artist = tag.get_string(&ItemKey::AlbumArtist).map(|v| v.to_string());
        let track_artist = tag.get_string(&ItemKey::TrackArtist).map(|v| v.to_string());
        info.artist = track_artist.or(album_artist);
        info.album = tag.get_string(&ItemKey::AlbumTitle).map(|v| v.to_string());
        info.genre = tag.get_string(&ItemKey::Genre).and_then(first_genre);
        info.artwork = pick_picture(tag.pictures()).map(|picture| picture.data().to_vec());
    }

    Ok(info)
}

/// The descriptive fields of a track after merging, ready to drop into a
/// record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFields {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
}

/// Merges extracted tags against the previous record with fixed precedence:
/// extracted value > previous record's value > filename-derived default.
/// Pure; independent of any I/O so the precedence table is testable on its
/// own.
pub fn resolve_fields(
    extracted: &PartialMetadata,
    previous: Option<&Track>,
    filename: &str,
) -> ResolvedFields {
    let title = extracted
        .title
        .clone()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| {
            previous
                .map(|track| track.title.clone())
                .filter(|value| !value.trim().is_empty())
        })
        .unwrap_or_else(|| file_stem_title(filename));

    ResolvedFields {
        title,
        artist: merge_optional(&extracted.artist, previous.and_then(|t| t.artist.as_deref())),
        album: merge_optional(&extracted.album, previous.and_then(|t| t.album.as_deref())),
        genre: merge_optional(&extracted.genre, previous.and_then(|t| t.genre.as_deref())),
    }
}

/// Filename-derived title: the stem, with a fixed fallback when even that is
/// empty.
pub fn file_stem_title(filename: &str) -> String {
    let stem = match filename.rfind('.') {
        Some(idx) if idx > 0 => &filename[..idx],
        _ => filename,
    };
    let trimmed = stem.trim();
    if trimmed.is_empty() {
        "Untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

fn merge_optional(extracted: &Option<String>, previous: Option<&str>) -> Option<String> {
    extracted
        .clone()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| previous.map(|value| value.to_string()))
}

fn first_genre(text: &str) -> Option<String> {
    text.split(&[';', ',', '/', '|', '\0'][..])
        .map(str::trim)
        .find(|part| !part.is_empty())
        .map(str::to_string)
}

fn pick_picture(pictures: &[Picture]) -> Option<&Picture> {
    pictures
        .iter()
        .find(|picture| picture.pic_type() == PictureType::CoverFront)
        .or_else(|| pictures.first())
}
