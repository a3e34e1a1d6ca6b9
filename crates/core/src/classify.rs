use serde::{Deserialize, Serialize};

use crate::model::MediaKind;

pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

const EXTENSION_TABLE: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("mp4", "video/mp4"),
    ("m4v", "video/mp4"),
    ("mov", "video/quicktime"),
    ("mkv", "video/x-matroska"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: MediaKind,
    pub content_type: String,
}

/// Maps a display name and provider-declared content type to a media kind.
///
/// A declared `image/*` or `video/*` type wins; anything else falls back to the
/// extension table. Never fails.
pub fn classify(name: &str, declared_type: &str) -> Classification {
    let declared = declared_type.trim().to_ascii_lowercase();
    let content_type = if declared.starts_with("image/") || declared.starts_with("video/") {
        declared
    } else {
        guess_content_type(name).to_string()
    };

    Classification {
        kind: kind_of(&content_type),
        content_type,
    }
}

pub fn guess_content_type(name: &str) -> &'static str {
    let Some((_, extension)) = name.rsplit_once('.') else {
        return FALLBACK_CONTENT_TYPE;
    };
    let extension = extension.to_ascii_lowercase();
    EXTENSION_TABLE
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, content_type)| *content_type)
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}

fn kind_of(content_type: &str) -> MediaKind {
    if content_type.starts_with("image/") {
        MediaKind::Image
    } else if content_type.starts_with("video/") {
        MediaKind::Video
    } else {
        MediaKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::{classify, guess_content_type, FALLBACK_CONTENT_TYPE};
    use crate::model::MediaKind;

    #[test]
    fn declared_media_type_takes_precedence() {
        let result = classify("holiday.bin", "video/mp4");
        assert_eq!(result.kind, MediaKind::Video);
        assert_eq!(result.content_type, "video/mp4");
    }

    #[test]
    fn non_media_declared_type_falls_back_to_extension() {
        let result = classify("IMG_0001.JPG", "application/octet-stream");
        assert_eq!(result.kind, MediaKind::Image);
        assert_eq!(result.content_type, "image/jpeg");
    }

    #[test]
    fn extension_table_covers_known_formats() {
        assert_eq!(guess_content_type("a.m4v"), "video/mp4");
        assert_eq!(guess_content_type("a.MOV"), "video/quicktime");
        assert_eq!(guess_content_type("a.mkv"), "video/x-matroska");
        assert_eq!(guess_content_type("a.gif"), "image/gif");
        assert_eq!(guess_content_type("a.png"), "image/png");
    }

    #[test]
    fn unknown_inputs_classify_as_other() {
        for (name, declared) in [
            ("", ""),
            ("noextension", ""),
            ("archive.tar.gz", "application/gzip"),
            (".", "text/plain"),
            ("weird.", "   "),
        ] {
            let result = classify(name, declared);
            assert_eq!(result.kind, MediaKind::Other, "{name:?} {declared:?}");
            assert_eq!(result.content_type, FALLBACK_CONTENT_TYPE);
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let inputs = [("a.jpg", ""), ("b.MP4", "video/mp4"), ("c", "image/webp")];
        for (name, declared) in inputs {
            assert_eq!(classify(name, declared), classify(name, declared));
        }
    }
}
