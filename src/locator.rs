use std::ops::Range;

use regex::Regex;

use crate::error::PatternError;

/// A URL grammar described as data, so the shipped grammar can be versioned.
#[derive(Debug, Clone, Copy)]
pub struct UrlPattern {
    pub version: u32,
    pub source: &'static str,
}

/// `scheme ":" authority-or-path-chars` with an optional `"#" fragment`.
///
/// Parentheses only match in balanced pairs, so `Rust_(language)` stays whole
/// while `(see http://a.b/c)` stops before the closing paren. The path and the
/// fragment must end on a character other than `.,;:!?'`, which leaves
/// sentence punctuation after a URL in the surrounding text.
pub const URL_PATTERN: UrlPattern = UrlPattern {
    version: 2,
    source: concat!(
        r"[A-Za-z][A-Za-z0-9+.\-]*:",
        r"(?:\([A-Za-z0-9\-._~/?%&=+;:@!$*,']*\)|[A-Za-z0-9\-._~/?%&=+;:@!$*,'])*",
        r"(?:\([A-Za-z0-9\-._~/?%&=+;:@!$*,']*\)|[A-Za-z0-9\-_~/%&=+@$*])",
        r"(?:#(?:",
        r"(?:\([A-Za-z0-9\-._~/?%&=+;:@!$*,']*\)|[A-Za-z0-9\-._~/?%&=+;:@!$*,'])*",
        r"(?:\([A-Za-z0-9\-._~/?%&=+;:@!$*,']*\)|[A-Za-z0-9\-_~/%&=+@$*])",
        r")?)?",
    ),
};

/// Half-open byte range `[start, end)` of one matched URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.range()]
    }
}

#[derive(Debug, Clone)]
pub struct UrlLocator {
    regex: Regex,
    version: u32,
}

impl UrlLocator {
    pub fn new() -> Result<UrlLocator, PatternError> {
        Self::with_pattern(URL_PATTERN)
    }

    pub fn with_pattern(pattern: UrlPattern) -> Result<UrlLocator, PatternError> {
        let regex = Regex::new(pattern.source).map_err(|source| PatternError {
            version: pattern.version,
            source,
        })?;

        Ok(UrlLocator { regex, version: pattern.version })
    }

    pub fn pattern_version(&self) -> u32 {
        self.version
    }

    /// Returns the matched URLs in ascending order.
    ///
    /// Each search starts at the end of the previous match, so touching URLs
    /// are all found. Empty matches are never reported; the scan steps over
    /// one character instead.
    pub fn locate(&self, text: &str) -> Vec<Span> {
        let mut spans = Vec::new();
        let mut pos = 0;

        while pos <= text.len() {
            let Some(found) = self.regex.find_at(text, pos) else {
                break;
            };

            if found.is_empty() {
                let step = text[found.end()..]
                    .chars()
                    .next()
                    .map_or(1, char::len_utf8);
                pos = found.end() + step;
                continue;
            }

            spans.push(Span { start: found.start(), end: found.end() });
            pos = found.end();
        }

        spans
    }
}
