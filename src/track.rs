//! Track descriptor value object handed to the engine by the catalog owner.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One playable item: display metadata, source URI, and an identity token.
///
/// Two equality notions exist and are deliberately kept apart:
///
/// - *Identity*: two descriptors are the same queue entry iff their
///   [`identity`](TrackDescriptor::identity) tokens match. Collection
///   membership, `index_of` and dedup-on-insert all use identity.
/// - *Content* ([`same_as`](TrackDescriptor::same_as)): compares the fields a
///   UI would redraw, ignoring the identity token and the extension blob.
///
/// `PartialEq` is intentionally not derived; call sites must pick one notion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackDescriptor {
    music_id: String,
    title: String,
    artist: String,
    album: String,
    source_uri: String,
    icon_uri: String,
    duration_ms: u64,
    forbid_seek: bool,
    identity: String,
    #[serde(default)]
    extension: Option<serde_json::Value>,
}

impl TrackDescriptor {
    pub fn builder() -> TrackDescriptorBuilder {
        TrackDescriptorBuilder::new()
    }

    pub fn music_id(&self) -> &str {
        &self.music_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn artist(&self) -> &str {
        &self.artist
    }

    pub fn album(&self) -> &str {
        &self.album
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn icon_uri(&self) -> &str {
        &self.icon_uri
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Seek and progress-restore are disabled for this track (live streams).
    pub fn forbid_seek(&self) -> bool {
        self.forbid_seek
    }

    /// Opaque token distinguishing this queue entry from every other entry,
    /// including entries with identical content.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Opaque payload carried for the caller, never interpreted here.
    pub fn extension(&self) -> Option<&serde_json::Value> {
        self.extension.as_ref()
    }

    /// Identity equality: same queue entry.
    pub fn same_entry(&self, other: &TrackDescriptor) -> bool {
        self.identity == other.identity
    }

    /// Content equality: whether a notification carrying `other` actually
    /// changed anything worth redrawing. Ignores identity and extension.
    pub fn same_as(&self, other: &TrackDescriptor) -> bool {
        self.music_id == other.music_id
            && self.title == other.title
            && self.artist == other.artist
            && self.album == other.album
            && self.source_uri == other.source_uri
            && self.icon_uri == other.icon_uri
            && self.duration_ms == other.duration_ms
    }
}

/// Builder for [`TrackDescriptor`]. A fresh UUID identity is generated unless
/// one is supplied explicitly (restoring from storage does).
#[derive(Debug, Default)]
pub struct TrackDescriptorBuilder {
    music_id: String,
    title: String,
    artist: String,
    album: String,
    source_uri: String,
    icon_uri: String,
    duration_ms: u64,
    forbid_seek: bool,
    identity: Option<String>,
    extension: Option<serde_json::Value>,
}

impl TrackDescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn music_id(mut self, music_id: impl Into<String>) -> Self {
        self.music_id = music_id.into();
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    pub fn album(mut self, album: impl Into<String>) -> Self {
        self.album = album.into();
        self
    }

    pub fn source_uri(mut self, source_uri: impl Into<String>) -> Self {
        self.source_uri = source_uri.into();
        self
    }

    pub fn icon_uri(mut self, icon_uri: impl Into<String>) -> Self {
        self.icon_uri = icon_uri.into();
        self
    }

    /// Negative durations clamp to 0.
    pub fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms.max(0) as u64;
        self
    }

    pub fn forbid_seek(mut self, forbid_seek: bool) -> Self {
        self.forbid_seek = forbid_seek;
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn extension(mut self, extension: serde_json::Value) -> Self {
        self.extension = Some(extension);
        self
    }

    pub fn build(self) -> TrackDescriptor {
        TrackDescriptor {
            music_id: self.music_id,
            title: self.title,
            artist: self.artist,
            album: self.album,
            source_uri: self.source_uri,
            icon_uri: self.icon_uri,
            duration_ms: self.duration_ms,
            forbid_seek: self.forbid_seek,
            identity: self
                .identity
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            extension: self.extension,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TrackDescriptorBuilder {
        TrackDescriptor::builder()
            .music_id("m-1")
            .title("Title")
            .artist("Artist")
            .album("Album")
            .source_uri("https://example.com/a.mp3")
            .icon_uri("https://example.com/a.png")
            .duration_ms(180_000)
    }

    #[test]
    fn test_negative_duration_clamps_to_zero() {
        let track = sample().duration_ms(-5).build();
        assert_eq!(track.duration_ms(), 0);
    }

    #[test]
    fn test_builder_generates_identity_when_absent() {
        let a = sample().build();
        let b = sample().build();
        assert!(!a.identity().is_empty());
        assert!(!a.same_entry(&b));
        assert!(a.same_as(&b));
    }

    #[test]
    fn test_same_as_ignores_identity_and_extension() {
        let a = sample()
            .identity("token-a")
            .extension(serde_json::json!({"k": 1}))
            .build();
        let b = sample().identity("token-b").build();
        assert!(a.same_as(&b));
        assert!(!a.same_entry(&b));
    }

    #[test]
    fn test_same_as_detects_content_change() {
        let a = sample().build();
        let b = sample().title("Other title").build();
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_serde_round_trip_preserves_extension() {
        let track = sample()
            .identity("token")
            .extension(serde_json::json!({"quality": "lossless"}))
            .build();
        let encoded = serde_json::to_string(&track).unwrap();
        let decoded: TrackDescriptor = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.same_as(&track));
        assert!(decoded.same_entry(&track));
        assert_eq!(decoded.extension(), track.extension());
    }
}
