//! Task parameters and their validation.

use std::fmt;

use crate::error::ValidationError;

pub const MAX_LOOKBACK_DAYS: u32 = 3650;
pub const MAX_PAGES: u32 = 1000;
pub const DEFAULT_MAX_PAGES: u32 = 100;
const MAX_LABEL_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Ios, Platform::Android];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }

    pub fn default_lookback_days(&self) -> u32 {
        match self {
            Platform::Ios => 365,
            Platform::Android => 90,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Android app markets the aggregator tracks, keyed by its market code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Market {
    Xiaomi,
    Huawei,
    Meizu,
    Vivo,
    Oppo,
}

impl Market {
    pub fn from_code(code: &str) -> Option<Market> {
        match code {
            "4" => Some(Market::Xiaomi),
            "6" => Some(Market::Huawei),
            "7" => Some(Market::Meizu),
            "8" => Some(Market::Vivo),
            "9" => Some(Market::Oppo),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Market::Xiaomi => "xiaomi",
            Market::Huawei => "huawei",
            Market::Meizu => "meizu",
            Market::Vivo => "vivo",
            Market::Oppo => "oppo",
        }
    }

    /// Platform tag put on items collected from this market.
    pub fn source_tag(&self) -> &'static str {
        match self {
            Market::Xiaomi => "xiaomi_app_store",
            Market::Huawei => "huawei_app_store",
            Market::Meizu => "meizu_app_store",
            Market::Vivo => "vivo_app_store",
            Market::Oppo => "oppo_app_store",
        }
    }
}

/// What a collaborator sends to create a task.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct CreateTask {
    pub platform: Platform,
    pub target_id: String,
    pub locale_or_market: String,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub label: Option<String>,
}

impl CreateTask {
    pub fn ios<S: Into<String>>(target_id: S, country: S) -> Self {
        Self {
            platform: Platform::Ios,
            target_id: target_id.into(),
            locale_or_market: country.into(),
            lookback_days: None,
            max_pages: None,
            label: None,
        }
    }

    pub fn android<S: Into<String>>(target_id: S, market: S) -> Self {
        Self {
            platform: Platform::Android,
            target_id: target_id.into(),
            locale_or_market: market.into(),
            lookback_days: None,
            max_pages: None,
            label: None,
        }
    }

    pub fn lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = Some(days);
        self
    }

    pub fn max_pages(mut self, pages: u32) -> Self {
        self.max_pages = Some(pages);
        self
    }

    pub fn label<S: Into<String>>(mut self, label: S) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Checks the request against the platform rules. Nothing is coerced: an
    /// out-of-range value is an error, a missing optional value gets the
    /// platform default.
    pub fn validate(self) -> Result<TaskParams, ValidationError> {
        let target_id = self.target_id.trim().to_string();
        if target_id.is_empty() {
            return Err(ValidationError::new("target_id", "must not be empty"));
        }

        let locale = self.locale_or_market.trim().to_string();
        match self.platform {
            Platform::Ios => {
                if !target_id.chars().all(|c| c.is_ascii_digit()) {
                    return Err(ValidationError::new(
                        "target_id",
                        format!("app store ids are numeric, got '{}'", target_id),
                    ));
                }
                if locale.len() != 2 || !locale.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(ValidationError::new(
                        "locale_or_market",
                        format!("expected a two-letter country code, got '{}'", locale),
                    ));
                }
            }
            Platform::Android => {
                if Market::from_code(&locale).is_none() {
                    return Err(ValidationError::new(
                        "locale_or_market",
                        format!("unknown market code '{}', expected one of 4, 6, 7, 8, 9", locale),
                    ));
                }
            }
        }

        let lookback_days = self
            .lookback_days
            .unwrap_or_else(|| self.platform.default_lookback_days());
        if !(1..=MAX_LOOKBACK_DAYS).contains(&lookback_days) {
            return Err(ValidationError::new(
                "lookback_days",
                format!("must be within 1..={}, got {}", MAX_LOOKBACK_DAYS, lookback_days),
            ));
        }

        let max_pages = self.max_pages.unwrap_or(DEFAULT_MAX_PAGES);
        if !(1..=MAX_PAGES).contains(&max_pages) {
            return Err(ValidationError::new(
                "max_pages",
                format!("must be within 1..={}, got {}", MAX_PAGES, max_pages),
            ));
        }

        if let Some(label) = &self.label {
            if label.chars().count() > MAX_LABEL_LEN {
                return Err(ValidationError::new(
                    "label",
                    format!("must be at most {} characters", MAX_LABEL_LEN),
                ));
            }
        }

        Ok(TaskParams {
            platform: self.platform,
            target_id,
            locale: match self.platform {
                Platform::Ios => locale.to_ascii_lowercase(),
                Platform::Android => locale,
            },
            lookback_days,
            max_pages,
            label: self.label,
        })
    }
}

/// Validated, immutable configuration of one task.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TaskParams {
    pub platform: Platform,
    pub target_id: String,
    /// Country code for iOS, market code for Android.
    pub locale: String,
    pub lookback_days: u32,
    pub max_pages: u32,
    pub label: Option<String>,
}

impl TaskParams {
    pub fn market(&self) -> Option<Market> {
        match self.platform {
            Platform::Ios => None,
            Platform::Android => Market::from_code(&self.locale),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ios_defaults_are_applied() {
        let params = CreateTask::ios("123456", "CN").validate().unwrap();
        assert_eq!(params.lookback_days, 365);
        assert_eq!(params.max_pages, DEFAULT_MAX_PAGES);
        assert_eq!(params.locale, "cn");
    }

    #[test]
    fn android_requires_known_market() {
        let err = CreateTask::android("6007162", "5").validate().unwrap_err();
        assert_eq!(err.field, "locale_or_market");

        let params = CreateTask::android("6007162", "6").validate().unwrap();
        assert_eq!(params.lookback_days, 90);
        assert_eq!(params.market(), Some(Market::Huawei));
    }

    #[test]
    fn out_of_range_values_are_not_coerced() {
        let err = CreateTask::ios("123456", "cn")
            .max_pages(0)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "max_pages");

        let err = CreateTask::ios("123456", "cn")
            .lookback_days(MAX_LOOKBACK_DAYS + 1)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "lookback_days");
    }

    #[test]
    fn ios_target_must_be_numeric() {
        let err = CreateTask::ios("com.example", "us").validate().unwrap_err();
        assert_eq!(err.field, "target_id");
    }

    #[test]
    fn create_request_deserializes_from_json() {
        let request: CreateTask = serde_json::from_str(
            r#"{"platform":"ios","target_id":"123456","locale_or_market":"cn","max_pages":5}"#,
        )
        .unwrap();
        let params = request.validate().unwrap();
        assert_eq!(params.platform, Platform::Ios);
        assert_eq!(params.max_pages, 5);
        assert_eq!(params.label, None);
    }
}
