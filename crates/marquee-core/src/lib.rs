//! Core domain model for Marquee: adapter drafts, classified records and persisted entities.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marquee-core";

/// Open set of kind-specific listing attributes (`price`, `venue`, `rating`, `excerpt`, ...).
pub type Attributes = BTreeMap<String, String>;

/// Matching key for shows and reviews: trimmed and lower-cased, nothing else.
pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// True when an optional text value carries something other than whitespace.
pub fn is_present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Show,
    Review,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Show => "show",
            RecordKind::Review => "review",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handoff contract from source adapters into the sync pipeline, before kind routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingDraft {
    pub title: String,
    pub source_name: String,
    pub scraped_at: DateTime<Utc>,
    pub full_page_url: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ListingDraft {
    pub fn new(source_name: &str, title: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            source_name: source_name.to_string(),
            scraped_at,
            full_page_url: None,
            image_url: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_page_url(mut self, url: Option<String>) -> Self {
        self.full_page_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_image_url(mut self, url: Option<String>) -> Self {
        self.image_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    /// Adds an attribute only when a non-blank value was extracted.
    pub fn with_attribute(mut self, key: &str, value: Option<String>) -> Self {
        if let Some(value) = value {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                self.attributes.insert(key.to_string(), trimmed.to_string());
            }
        }
        self
    }
}

/// A scraped item after kind classification; consumed by reconciliation and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub title: String,
    pub source_name: String,
    pub kind: RecordKind,
    pub scraped_at: DateTime<Utc>,
    pub full_page_url: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl RawRecord {
    pub fn from_draft(draft: ListingDraft, kind: RecordKind) -> Self {
        Self {
            title: draft.title,
            source_name: draft.source_name,
            kind,
            scraped_at: draft.scraped_at,
            full_page_url: draft.full_page_url,
            image_url: draft.image_url,
            attributes: draft.attributes,
        }
    }

    pub fn normalized_title(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Persisted show. `id` is assigned on first sighting and never regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Show {
    pub id: Uuid,
    pub normalized_title: String,
    pub title: String,
    pub source_name: String,
    pub scraped_at: DateTime<Utc>,
    pub full_page_url: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Show {
    pub fn from_record(record: &RawRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            normalized_title: record.normalized_title(),
            title: record.title.clone(),
            source_name: record.source_name.clone(),
            scraped_at: record.scraped_at,
            full_page_url: record.full_page_url.clone(),
            image_url: record.image_url.clone(),
            attributes: record.attributes.clone(),
        }
    }

    pub fn has_image(&self) -> bool {
        is_present(&self.image_url)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Persisted review, optionally linked to the show sharing its normalized title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: Uuid,
    pub normalized_title: String,
    pub title: String,
    pub source_name: String,
    pub scraped_at: DateTime<Utc>,
    pub full_page_url: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub show_id: Option<Uuid>,
}

impl Review {
    pub fn from_record(record: &RawRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            normalized_title: record.normalized_title(),
            title: record.title.clone(),
            source_name: record.source_name.clone(),
            scraped_at: record.scraped_at,
            full_page_url: record.full_page_url.clone(),
            image_url: record.image_url.clone(),
            attributes: record.attributes.clone(),
            show_id: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}
