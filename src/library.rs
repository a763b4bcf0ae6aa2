//! Resolves a book id into something ffmpeg can read.
//!
//! The catalog client itself lives outside this service; the relay only needs
//! a URL and, optionally, the header that authorises fetching it.

use crate::config::LibraryConfig;
use anyhow::{bail, Result};
use std::fmt;

/// Where the decoder should read a book from.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub url: String,
    /// Full header line, e.g. `Authorization: Bearer <token>`
    pub auth_header: Option<String>,
}

// Hand-written so tokens never end up in logs via `{:?}`.
impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("url", &self.url)
            .field("auth_header", &self.auth_header.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

pub trait AudioLibrary: Send + Sync {
    fn stream_source(&self, book_id: &str) -> Result<StreamSource>;
}

/// Builds stream URLs from a template such as
/// `http://library.local/api/items/{book_id}/file`.
#[derive(Clone)]
pub struct TemplateLibrary {
    url_template: String,
    api_token: Option<String>,
}

impl TemplateLibrary {
    pub fn new(url_template: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            url_template: url_template.into(),
            api_token: api_token.filter(|t| !t.is_empty()),
        }
    }

    pub fn from_config(config: &LibraryConfig) -> Self {
        Self::new(config.stream_url_template.clone(), config.api_token.clone())
    }
}

/// Book ids are spliced into a URL path, so only allow path-safe characters.
pub fn is_valid_book_id(book_id: &str) -> bool {
    !book_id.is_empty()
        && book_id.len() <= 128
        && book_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && book_id != "."
        && book_id != ".."
}

impl AudioLibrary for TemplateLibrary {
    fn stream_source(&self, book_id: &str) -> Result<StreamSource> {
        if !is_valid_book_id(book_id) {
            bail!("invalid book id '{}'", book_id);
        }

        Ok(StreamSource {
            url: self.url_template.replace("{book_id}", book_id),
            auth_header: self
                .api_token
                .as_ref()
                .map(|token| format!("Authorization: Bearer {}", token)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_expansion() {
        let library = TemplateLibrary::new("http://lib/api/items/{book_id}/file", Some("tok".into()));
        let source = library.stream_source("li_abc-123").unwrap();
        assert_eq!(source.url, "http://lib/api/items/li_abc-123/file");
        assert_eq!(source.auth_header.as_deref(), Some("Authorization: Bearer tok"));
    }

    #[test]
    fn test_empty_token_means_no_header() {
        let library = TemplateLibrary::new("http://lib/{book_id}", Some(String::new()));
        assert!(library.stream_source("b1").unwrap().auth_header.is_none());
    }

    #[test]
    fn test_rejects_path_tricks() {
        let library = TemplateLibrary::new("http://lib/{book_id}", None);
        assert!(library.stream_source("../admin").is_err());
        assert!(library.stream_source("a/b").is_err());
        assert!(library.stream_source("..").is_err());
        assert!(library.stream_source("").is_err());
    }

    #[test]
    fn test_debug_hides_token() {
        let library = TemplateLibrary::new("http://lib/{book_id}", Some("secret".into()));
        let printed = format!("{:?}", library.stream_source("b1").unwrap());
        assert!(!printed.contains("secret"));
    }
}
