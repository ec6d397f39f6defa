//! Content-type classification shared by the signer and the verifier.
//!
//! Both sides default to [`SIGNED_CONTENT_TYPES`]. Diverging the two lists
//! means either signing bodies nobody checks or checking bodies nobody signed,
//! so custom sets should be built from the same constant.

/// Application media types that are signed in addition to every `text/*` type.
pub const SIGNED_CONTENT_TYPES: &[&str] = &[
    "application/javascript",
    "application/json",
    "application/ld+json",
    "application/xml",
    "application/atom+xml",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleSet {
    include_text: bool,
    media_types: Vec<String>,
}

impl Default for EligibleSet {
    fn default() -> Self {
        Self::new(true, SIGNED_CONTENT_TYPES.iter().copied())
    }
}

impl EligibleSet {
    pub fn new<'a>(include_text: bool, media_types: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            include_text,
            media_types: media_types
                .into_iter()
                .map(|t| t.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Extend the set with extra media types, e.g. images on a verifier that
    /// also checks binary resources.
    pub fn with_media_type(mut self, media_type: &str) -> Self {
        self.media_types.push(media_type.trim().to_ascii_lowercase());
        self
    }

    pub fn is_eligible(&self, content_type: &str) -> bool {
        let media_type = media_type_of(content_type);
        if media_type.is_empty() {
            return false;
        }
        if self.include_text && media_type.starts_with("text/") {
            return true;
        }
        self.media_types.iter().any(|t| *t == media_type)
    }
}

/// Classify against the default published set.
pub fn is_eligible(content_type: &str) -> bool {
    EligibleSet::default().is_eligible(content_type)
}

/// Lowercased media type with parameters stripped.
pub fn media_type_of(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Declared `charset` parameter, lowercased and unquoted.
pub fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}
