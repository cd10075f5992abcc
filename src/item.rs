//! The canonical record every source parser produces and the feedback store
//! consumes.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NormalizedItem {
    /// Identifier of the review at the source, when it exposes one.
    pub original_id: Option<String>,
    /// Source platform tag, e.g. `ios_app_store` or `huawei_app_store`.
    pub platform: String,
    pub title: Option<String>,
    pub content: String,
    pub rating: Option<u8>,
    pub submitter: Submitter,
    pub product: Product,
    pub published_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    pub sentiment: Sentiment,
    pub priority: Priority,
    pub quality_score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Submitter {
    pub id: Option<String>,
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Product {
    pub product_id: String,
    pub market: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// Everything a parser extracted from one review entry.
#[derive(Debug, Clone, Default)]
pub struct RawReview {
    pub original_id: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub rating: Option<u8>,
    pub submitter: Submitter,
    pub published_at: Option<DateTime<Utc>>,
}

impl NormalizedItem {
    /// Builds the item and derives the rule-based fields from rating and text.
    pub fn from_review(review: RawReview, platform: &str, product: Product) -> Self {
        let sentiment = sentiment_for(review.rating);
        let priority = priority_for(review.rating, &review.content);
        let quality_score = quality_score(review.title.as_deref(), &review.content);
        Self {
            original_id: review.original_id,
            platform: platform.to_string(),
            title: review.title,
            content: review.content,
            rating: review.rating,
            submitter: review.submitter,
            product,
            published_at: review.published_at,
            collected_at: Utc::now(),
            sentiment,
            priority,
            quality_score,
        }
    }
}

fn sentiment_for(rating: Option<u8>) -> Sentiment {
    match rating {
        Some(r) if r >= 4 => Sentiment::Positive,
        Some(r) if r <= 2 => Sentiment::Negative,
        _ => Sentiment::Neutral,
    }
}

fn priority_for(rating: Option<u8>, content: &str) -> Priority {
    let low_rating = matches!(rating, Some(r) if r <= 2);
    let len = content.chars().count();
    if low_rating && len > 50 {
        Priority::High
    } else if low_rating || len > 100 {
        Priority::Medium
    } else {
        Priority::Low
    }
}

fn quality_score(title: Option<&str>, content: &str) -> f32 {
    let mut score: f32 = 0.5;
    if title.map_or(false, |t| t.trim().chars().count() > 2) {
        score += 0.2;
    }
    let len = content.trim().chars().count();
    for threshold in [10, 50, 100] {
        if len > threshold {
            score += 0.1;
        }
    }
    // shouting
    let all_upper =
        content.chars().any(char::is_uppercase) && !content.chars().any(char::is_lowercase);
    if !content.is_empty() && !all_upper {
        score += 0.1;
    }
    score.min(1.0)
}
