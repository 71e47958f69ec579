//! Static/media resource classification

use crate::config::CaptureConfig;

pub const STATIC_EXTENSIONS: &[&str] = &["js", "css", "ico"];

pub const STATIC_CONTENT_TYPES: &[&str] = &[
    "text/css",
    "application/msword",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "application/x-ms-wmd",
    "application/x-shockwave-flash",
];

pub const MEDIA_FAMILIES: &[&str] = &["image", "video", "audio"];

/// The rule that marked a resource as static
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticReason {
    Extension,
    ContentType,
    MediaFamily,
}

/// Decides whether a response is a static asset whose body is not worth keeping
#[derive(Debug, Clone)]
pub struct ResourceClassifier {
    extensions: Vec<String>,
    content_types: Vec<String>,
    media_families: Vec<String>,
}

impl Default for ResourceClassifier {
    fn default() -> Self {
        Self::new(STATIC_EXTENSIONS, STATIC_CONTENT_TYPES, MEDIA_FAMILIES)
    }
}

impl ResourceClassifier {
    pub fn new<S: AsRef<str>>(extensions: &[S], content_types: &[S], media_families: &[S]) -> Self {
        fn normalize<S: AsRef<str>>(values: &[S]) -> Vec<String> {
            values
                .iter()
                .map(|v| v.as_ref().trim().to_ascii_lowercase())
                .filter(|v| !v.is_empty())
                .collect()
        }

        Self {
            extensions: normalize(extensions),
            content_types: normalize(content_types),
            media_families: normalize(media_families),
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(
            config.static_extensions.as_slice(),
            config.static_content_types.as_slice(),
            config.media_families.as_slice(),
        )
    }

    pub fn classify(&self, extension: &str, content_type: &str) -> bool {
        self.static_reason(extension, content_type).is_some()
    }

    /// Checks extension, then content type, then type family; first match wins.
    pub fn static_reason(&self, extension: &str, content_type: &str) -> Option<StaticReason> {
        let content_type = strip_params(content_type);

        if contains(&self.extensions, extension) {
            return Some(StaticReason::Extension);
        }
        if contains(&self.content_types, content_type) {
            return Some(StaticReason::ContentType);
        }
        let family = type_family(content_type);
        if !family.is_empty() && contains(&self.media_families, family) {
            return Some(StaticReason::MediaFamily);
        }
        None
    }
}

fn contains(set: &[String], value: &str) -> bool {
    !value.is_empty() && set.iter().any(|v| v.eq_ignore_ascii_case(value))
}

/// `text/html; charset=utf-8` -> `text/html`
pub fn strip_params(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

/// `image/png` -> `image`
pub fn type_family(content_type: &str) -> &str {
    strip_params(content_type)
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
}
