use serde_json::Value;

use super::{
    envelope, format_date, has_more, parse_date, rating, text, ParsedPage, SourceParser, Window,
};
use crate::{
    config::SourceOptions,
    error::ParseError,
    fetcher::{Method, PageRequest, RawPage},
    item::{NormalizedItem, Product, RawReview, Submitter},
    params::{Market, Platform, TaskParams},
};

const FALLBACK_TAG: &str = "android_app_store";

/// Reviews of one app in one Android market. Pages are requested with a
/// form-encoded POST.
#[derive(Debug, Clone)]
pub struct AndroidReviews {
    url: String,
    analysis_key: String,
    app_id: String,
    market_code: String,
    market: Option<Market>,
}

impl AndroidReviews {
    pub fn new(params: &TaskParams, options: &SourceOptions) -> Self {
        Self {
            url: format!(
                "{}/andapp/getCommentList",
                options.base_url.trim_end_matches('/')
            ),
            analysis_key: options.analysis_key.clone(),
            app_id: params.target_id.clone(),
            market_code: params.locale.clone(),
            market: params.market(),
        }
    }

    fn review(&self, entry: &Value) -> Option<NormalizedItem> {
        let content = text(entry.get("comment_info"))?;
        let nickname = text(entry.get("nick_name"));
        let review = RawReview {
            original_id: text(entry.get("account_id")),
            title: None,
            content,
            rating: rating(entry.get("stars")),
            submitter: Submitter { id: None, nickname },
            published_at: entry
                .get("comment_time")
                .and_then(Value::as_str)
                .and_then(parse_date),
        };
        let tag = self.market.map_or(FALLBACK_TAG, |market| market.source_tag());
        Some(NormalizedItem::from_review(
            review,
            tag,
            Product {
                product_id: self.app_id.clone(),
                market: self.market.map(|market| market.name().to_string()),
            },
        ))
    }
}

impl SourceParser for AndroidReviews {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn request(&self, page: u32, window: &Window) -> PageRequest {
        PageRequest {
            page,
            method: Method::Post,
            url: self.url.clone(),
            query: vec![("analysis".into(), self.analysis_key.clone())],
            form: vec![
                ("appid".into(), self.app_id.clone()),
                ("market".into(), self.market_code.clone()),
                ("page".into(), page.to_string()),
                ("start_date".into(), format_date(window.start)),
                ("end_date".into(), format_date(window.end)),
            ],
        }
    }

    fn parse(&self, raw: &RawPage) -> Result<ParsedPage, ParseError> {
        let body = envelope(raw)?;
        let entries: &[Value] = match body.get("result") {
            Some(Value::Array(entries)) => entries.as_slice(),
            Some(Value::Null) | None => &[],
            Some(_) => return Err(ParseError::Malformed("result is not a list".into())),
        };
        let items: Vec<_> = entries
            .iter()
            .filter_map(|entry| self.review(entry))
            .collect();
        let max_page = body.get("max_page").and_then(Value::as_u64);
        Ok(ParsedPage {
            items,
            seen: entries.len() as u64,
            has_more: has_more(raw.page, max_page, entries.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{item::Sentiment, params::CreateTask};

    fn source(market: &str) -> AndroidReviews {
        let params = CreateTask::android("6007162", market).validate().unwrap();
        AndroidReviews::new(&params, &SourceOptions::default())
    }

    fn raw(page: u32, body: &str) -> RawPage {
        RawPage {
            page,
            status: 200,
            body: body.to_string(),
        }
    }

    #[test]
    fn request_is_a_form_post() {
        let request = source("6").request(2, &Window::lookback(90));
        assert_eq!(request.method, Method::Post);
        assert!(request.url.ends_with("/andapp/getCommentList"));
        assert!(request
            .form
            .contains(&("market".to_string(), "6".to_string())));
        assert!(request.form.contains(&("page".to_string(), "2".to_string())));
        assert_eq!(request.query.len(), 1);
    }

    #[test]
    fn parses_market_reviews() {
        let body = r#"{
            "code": 10000,
            "max_page": 1,
            "total": 2,
            "result": [
                {"account_id": "a-1", "stars": "2", "comment_info": "too many ads", "nick_name": "wu",
                 "comment_time": "2024-06-01 12:00:00"},
                {"account_id": "a-2", "stars": 4, "comment_info": ""}
            ]
        }"#;
        let page = source("4").parse(&raw(1, body)).unwrap();
        assert_eq!(page.seen, 2);
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_more);

        let item = &page.items[0];
        assert_eq!(item.platform, "xiaomi_app_store");
        assert_eq!(item.product.market.as_deref(), Some("xiaomi"));
        assert_eq!(item.rating, Some(2));
        assert_eq!(item.sentiment, Sentiment::Negative);
        assert_eq!(item.submitter.nickname.as_deref(), Some("wu"));
    }

    #[test]
    fn expired_credentials_are_fatal() {
        let err = source("9")
            .parse(&raw(1, r#"{"code":10001,"msg":"login"}"#))
            .unwrap_err();
        assert!(matches!(err, ParseError::AuthExpired));
        assert!(err.is_fatal());
    }
}
