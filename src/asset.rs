// Pagekeeper - Client runtime freshness and telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Cache-busting asset URLs
//!
//! Same-origin URLs that are not content-addressed get the build
//! fingerprint appended as a query parameter, so intermediate HTTP caches
//! see a new resource after every deployment. Bundler output under a hashed
//! directory already changes name when its content changes and is left
//! alone.

use crate::config::FreshnessConfig;
use crate::version::BuildFingerprint;
use std::borrow::Cow;

/// Decorates asset URLs with the running build fingerprint
#[derive(Debug, Clone)]
pub struct AssetUrlDecorator {
    fingerprint: BuildFingerprint,
    hashed_prefixes: Vec<String>,
    param: String,
}

impl AssetUrlDecorator {
    /// Create a decorator with explicit rules
    pub fn new(
        fingerprint: BuildFingerprint,
        hashed_prefixes: Vec<String>,
        param: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint,
            hashed_prefixes,
            param: param.into(),
        }
    }

    /// Create a decorator from freshness configuration
    pub fn from_config(fingerprint: BuildFingerprint, config: &FreshnessConfig) -> Self {
        Self::new(
            fingerprint,
            config.hashed_asset_prefixes.clone(),
            config.version_param.clone(),
        )
    }

    /// Whether `url` would be decorated
    pub fn should_decorate(&self, url: &str) -> bool {
        // Same-origin path only: not `//cdn...`, `https:`, `data:`, `blob:`
        if !url.starts_with('/') || url.starts_with("//") {
            return false;
        }

        let path = url.split(['?', '#']).next().unwrap_or(url);
        if self
            .hashed_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return false;
        }

        !self.has_version_param(url)
    }

    /// Append the fingerprint to `url` when it needs one
    pub fn decorate<'a>(&self, url: &'a str) -> Cow<'a, str> {
        if !self.should_decorate(url) {
            return Cow::Borrowed(url);
        }

        let (base, fragment) = match url.find('#') {
            Some(idx) => url.split_at(idx),
            None => (url, ""),
        };
        let separator = if base.contains('?') {
            if base.ends_with('?') || base.ends_with('&') {
                ""
            } else {
                "&"
            }
        } else {
            "?"
        };

        Cow::Owned(format!(
            "{base}{separator}{}={}{fragment}",
            self.param, self.fingerprint
        ))
    }

    fn has_version_param(&self, url: &str) -> bool {
        let Some((_, query)) = url.split_once('?') else {
            return false;
        };
        let query = query.split('#').next().unwrap_or(query);
        query
            .split('&')
            .any(|pair| pair.split('=').next() == Some(self.param.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decorator() -> AssetUrlDecorator {
        AssetUrlDecorator::from_config(
            BuildFingerprint::new("1717171717"),
            &FreshnessConfig::default(),
        )
    }

    #[test]
    fn test_plain_path_decorated() {
        assert_eq!(
            decorator().decorate("/images/hero.jpg"),
            "/images/hero.jpg?v=1717171717"
        );
    }

    #[test]
    fn test_hashed_bundle_untouched() {
        let d = decorator();
        let url = "/assets/app.a1b2c3.js";
        assert!(matches!(d.decorate(url), Cow::Borrowed(_)));
        assert_eq!(d.decorate(url), url);
    }

    #[test]
    fn test_existing_query_uses_ampersand() {
        assert_eq!(
            decorator().decorate("/api/og.png?title=Home"),
            "/api/og.png?title=Home&v=1717171717"
        );
    }

    #[test]
    fn test_fragment_preserved() {
        assert_eq!(
            decorator().decorate("/docs/guide.pdf#page=2"),
            "/docs/guide.pdf?v=1717171717#page=2"
        );
    }

    #[test]
    fn test_foreign_urls_untouched() {
        let d = decorator();
        for url in [
            "https://cdn.example.com/logo.svg",
            "//cdn.example.com/logo.svg",
            "data:image/png;base64,AAAA",
            "blob:https://example.com/1234",
            "images/relative.png",
        ] {
            assert_eq!(d.decorate(url), url);
        }
    }

    #[test]
    fn test_already_versioned_untouched() {
        let d = decorator();
        assert_eq!(d.decorate("/favicon.ico?v=old"), "/favicon.ico?v=old");
        assert_eq!(
            d.decorate("/favicon.ico?view=1"),
            "/favicon.ico?view=1&v=1717171717"
        );
    }

    #[test]
    fn test_trailing_question_mark() {
        assert_eq!(
            decorator().decorate("/robots.txt?"),
            "/robots.txt?v=1717171717"
        );
    }

    #[test]
    fn test_custom_prefixes() {
        let d = AssetUrlDecorator::new(
            BuildFingerprint::new("7"),
            vec!["/_next/static/".to_string()],
            "build",
        );
        assert_eq!(d.decorate("/_next/static/chunk.js"), "/_next/static/chunk.js");
        assert_eq!(d.decorate("/assets/app.js"), "/assets/app.js?build=7");
    }
}
