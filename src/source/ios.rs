use serde_json::Value;

use super::{
    envelope, format_date, has_more, parse_date, rating, text, ParsedPage, SourceParser, Window,
};
use crate::{
    config::SourceOptions,
    error::ParseError,
    fetcher::{Method, PageRequest, RawPage},
    item::{NormalizedItem, Product, RawReview, Submitter},
    params::{Platform, TaskParams},
};

const PLATFORM_TAG: &str = "ios_app_store";

/// App Store reviews for one app in one country.
#[derive(Debug, Clone)]
pub struct IosReviews {
    url: String,
    analysis_key: String,
    app_id: String,
    country: String,
}

impl IosReviews {
    pub fn new(params: &TaskParams, options: &SourceOptions) -> Self {
        Self {
            url: format!("{}/app/comment", options.base_url.trim_end_matches('/')),
            analysis_key: options.analysis_key.clone(),
            app_id: params.target_id.clone(),
            country: params.locale.clone(),
        }
    }

    fn review(&self, entry: &Value) -> Option<NormalizedItem> {
        let comment = entry.get("comment")?;
        let title = text(comment.get("title"));
        let content = text(comment.get("body")).unwrap_or_default();
        if content.is_empty() && title.is_none() {
            return None;
        }
        let review = RawReview {
            original_id: text(entry.get("id")),
            title,
            content,
            rating: rating(entry.get("rating")),
            submitter: Submitter {
                id: text(comment.get("user_review_id")),
                nickname: text(comment.get("name")),
            },
            published_at: entry
                .get("date")
                .and_then(Value::as_str)
                .and_then(parse_date),
        };
        Some(NormalizedItem::from_review(
            review,
            PLATFORM_TAG,
            Product {
                product_id: self.app_id.clone(),
                market: None,
            },
        ))
    }
}

impl SourceParser for IosReviews {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    fn request(&self, page: u32, window: &Window) -> PageRequest {
        PageRequest {
            page,
            method: Method::Get,
            url: self.url.clone(),
            query: vec![
                ("analysis".into(), self.analysis_key.clone()),
                ("appid".into(), self.app_id.clone()),
                ("country".into(), self.country.clone()),
                ("sword".into(), String::new()),
                ("sdate".into(), format_date(window.start)),
                ("edate".into(), format_date(window.end)),
                ("page".into(), page.to_string()),
            ],
            form: Vec::new(),
        }
    }

    fn parse(&self, raw: &RawPage) -> Result<ParsedPage, ParseError> {
        let body = envelope(raw)?;
        let entries: &[Value] = match body.get("appComments") {
            Some(Value::Array(entries)) => entries.as_slice(),
            Some(Value::Null) | None => &[],
            Some(_) => return Err(ParseError::Malformed("appComments is not a list".into())),
        };
        let items: Vec<_> = entries.iter().filter_map(|entry| self.review(entry)).collect();
        if items.len() < entries.len() {
            tracing::debug!(
                page = raw.page,
                dropped = entries.len() - items.len(),
                "skipped unreadable reviews"
            );
        }
        let max_page = body.get("maxPage").and_then(Value::as_u64);
        Ok(ParsedPage {
            items,
            seen: entries.len() as u64,
            has_more: has_more(raw.page, max_page, entries.len()),
        })
    }
}
