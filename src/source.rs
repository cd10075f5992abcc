//! Review sources: how to request a page and how to read one.
//!
//! Each platform implements [`SourceParser`]; [`Source`] selects the variant
//! from the task's platform.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde_json::Value;

use crate::{
    config::SourceOptions,
    error::ParseError,
    fetcher::{PageRequest, RawPage},
    item::NormalizedItem,
    params::{Platform, TaskParams},
};

pub mod android;
pub mod ios;

pub use android::AndroidReviews;
pub use ios::IosReviews;

/// Answer code of a successful aggregator call.
pub(crate) const CODE_OK: i64 = 10000;
/// Answer code for expired credentials.
pub(crate) const CODE_AUTH_EXPIRED: i64 = 10001;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Time horizon of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn lookback(days: u32) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::days(i64::from(days)),
            end,
        }
    }

    /// Items without a timestamp are kept.
    pub fn admits(&self, at: Option<DateTime<Utc>>) -> bool {
        at.map_or(true, |at| at >= self.start)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    /// Entries that parsed into items, in source order.
    pub items: Vec<NormalizedItem>,
    /// Raw entries on the page, including the ones that did not parse.
    pub seen: u64,
    pub has_more: bool,
}

pub trait SourceParser: Send + Sync {
    fn platform(&self) -> Platform;

    fn request(&self, page: u32, window: &Window) -> PageRequest;

    fn parse(&self, raw: &RawPage) -> Result<ParsedPage, ParseError>;
}

#[derive(Debug, Clone)]
pub enum Source {
    Ios(IosReviews),
    Android(AndroidReviews),
}

impl Source {
    pub fn for_task(params: &TaskParams, options: &SourceOptions) -> Source {
        match params.platform {
            Platform::Ios => Source::Ios(IosReviews::new(params, options)),
            Platform::Android => Source::Android(AndroidReviews::new(params, options)),
        }
    }
}

impl SourceParser for Source {
    fn platform(&self) -> Platform {
        match self {
            Source::Ios(source) => source.platform(),
            Source::Android(source) => source.platform(),
        }
    }

    fn request(&self, page: u32, window: &Window) -> PageRequest {
        match self {
            Source::Ios(source) => source.request(page, window),
            Source::Android(source) => source.request(page, window),
        }
    }

    fn parse(&self, raw: &RawPage) -> Result<ParsedPage, ParseError> {
        match self {
            Source::Ios(source) => source.parse(raw),
            Source::Android(source) => source.parse(raw),
        }
    }
}

pub(crate) fn format_date(at: DateTime<Utc>) -> String {
    at.format(DATE_FORMAT).to_string()
}

pub(crate) fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Reads the envelope every aggregator answer shares and maps its code.
pub(crate) fn envelope(raw: &RawPage) -> Result<Value, ParseError> {
    let body: Value = serde_json::from_str(&raw.body)?;
    let code = body
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| ParseError::Malformed("missing answer code".into()))?;
    match code {
        CODE_OK => Ok(body),
        CODE_AUTH_EXPIRED => Err(ParseError::AuthExpired),
        code => Err(ParseError::Api {
            code,
            message: body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
    }
}

/// String or number as text; empty strings count as missing.
pub(crate) fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Star rating in 1..=5, given as a number or a numeric string.
pub(crate) fn rating(value: Option<&Value>) -> Option<u8> {
    let rating = match value? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u8::try_from(rating).ok().filter(|r| (1..=5).contains(r))
}

/// Whether another page follows, from the page number and the page count the
/// source reports.
pub(crate) fn has_more(page: u32, max_page: Option<u64>, entries: usize) -> bool {
    if entries == 0 {
        return false;
    }
    max_page.map_or(true, |max| u64::from(page) < max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(body: &str) -> RawPage {
        RawPage {
            page: 1,
            status: 200,
            body: body.to_string(),
        }
    }

    #[test]
    fn envelope_maps_codes() {
        assert!(envelope(&raw(r#"{"code":10000}"#)).is_ok());
        assert!(matches!(
            envelope(&raw(r#"{"code":10001}"#)),
            Err(ParseError::AuthExpired)
        ));
        match envelope(&raw(r#"{"code":20000,"msg":"busy"}"#)) {
            Err(ParseError::Api { code, message }) => {
                assert_eq!(code, 20000);
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            envelope(&raw("<html>")),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn dates_round_trip_through_source_format() {
        let at = parse_date("2024-03-01 08:30:00").unwrap();
        assert_eq!(format_date(at), "2024-03-01 08:30:00");
        assert!(parse_date("yesterday").is_none());
    }

    #[test]
    fn ratings_outside_stars_are_dropped() {
        assert_eq!(rating(Some(&Value::from(4))), Some(4));
        assert_eq!(rating(Some(&Value::from("5"))), Some(5));
        assert_eq!(rating(Some(&Value::from(0))), None);
        assert_eq!(rating(Some(&Value::from(9))), None);
        assert_eq!(rating(None), None);
    }

    #[test]
    fn window_admits_recent_and_undated_items() {
        let window = Window::lookback(7);
        assert!(window.admits(None));
        assert!(window.admits(Some(Utc::now() - Duration::days(1))));
        assert!(!window.admits(Some(Utc::now() - Duration::days(8))));
    }

    #[test]
    fn empty_or_last_page_ends_pagination() {
        assert!(has_more(1, Some(3), 20));
        assert!(!has_more(3, Some(3), 20));
        assert!(!has_more(1, Some(3), 0));
        assert!(has_more(7, None, 1));
    }
}
