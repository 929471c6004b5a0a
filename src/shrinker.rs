use std::borrow::Cow;

use log::{debug, warn};

use crate::helper::{HelperConfig, HelperSession, UrlShortener};
use crate::locator::{Span, UrlLocator};

/// What one shrink operation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShrinkReport {
    pub spans: usize,
    pub replaced: usize,
    pub kept: usize,
    pub bytes_saved: usize,
}

pub struct Shrinker {
    locator: UrlLocator,
    helper: HelperConfig,
}

impl Shrinker {
    pub fn new(locator: UrlLocator, helper: HelperConfig) -> Shrinker {
        Shrinker { locator, helper }
    }

    /// Replaces every URL in `text` with a shorter one from the helper, when it
    /// has one. Never fails: at worst the input comes back unchanged.
    pub fn shrink<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.shrink_with_report(text).0
    }

    pub fn shrink_with_report<'a>(&self, text: &'a str) -> (Cow<'a, str>, ShrinkReport) {
        let spans = self.locator.locate(text);
        if spans.is_empty() {
            return (Cow::Borrowed(text), ShrinkReport::default());
        }

        let mut session = match HelperSession::open(&self.helper) {
            Ok(session) => session,
            Err(e) => {
                warn!("{e}: {}; leaving URLs as they are", e.source);
                let report = ShrinkReport {
                    spans: spans.len(),
                    kept: spans.len(),
                    ..Default::default()
                };
                return (Cow::Borrowed(text), report);
            }
        };

        let result = splice(text, &spans, &mut session, self.helper.trace);
        session.close();
        result
    }
}

/// Rebuilds `text`, substituting each span with its candidate when the
/// candidate is strictly shorter. `spans` must be ascending and
/// non-overlapping.
pub fn splice<'a, S: UrlShortener>(
    text: &'a str,
    spans: &[Span],
    shortener: &mut S,
    trace: bool,
) -> (Cow<'a, str>, ShrinkReport) {
    let mut report = ShrinkReport { spans: spans.len(), ..Default::default() };
    let mut out = String::with_capacity(text.len());
    let mut input = 0;

    for span in spans {
        debug_assert!(input <= span.start && span.start < span.end);
        out.push_str(&text[input..span.start]);

        let url = span.slice(text);
        match shortener.shorten(url) {
            Ok(candidate) if candidate.len() < url.len() => {
                if trace {
                    debug!("replacing {url} with {candidate}");
                }
                out.push_str(&candidate);
                report.replaced += 1;
                report.bytes_saved += url.len() - candidate.len();
            }
            Ok(candidate) => {
                if trace {
                    debug!("keeping {url}: {candidate} is not shorter");
                }
                out.push_str(url);
                report.kept += 1;
            }
            Err(e) => {
                debug!("keeping URL at bytes {}..{}: {e}", span.start, span.end);
                out.push_str(url);
                report.kept += 1;
            }
        }
        input = span.end;
        debug_assert!(out.len() <= input);
    }

    out.push_str(&text[input..]);

    if report.replaced == 0 {
        return (Cow::Borrowed(text), report);
    }
    (Cow::Owned(out), report)
}
