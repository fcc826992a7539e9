//! Source adapter contract + HTML listing adapters for the London theatre sites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marquee_core::ListingDraft;
use marquee_storage::{FetchError, HttpFetcher};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "marquee-adapters";

/// Every adapter slug [`adapter_for_source`] knows how to build.
pub const REGISTERED_SOURCES: &[&str] = &[
    "london-theatre",
    "timeout",
    "guardian",
    "london-box-office",
    "whats-on-london",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// One external listing source. `name` is the stable slug used for kind routing and
/// error attribution.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        limit: Option<usize>,
    ) -> Result<Vec<ListingDraft>, AdapterError>;
}

/// Page structure an [`HtmlListingAdapter`] knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingLayout {
    PosterGrid,
    CardList,
    StageReviews,
    BoxOfficeList,
    EventList,
}

#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    source_name: &'static str,
    base_url: &'static str,
    listing_url: String,
    layout: ListingLayout,
}

impl HtmlListingAdapter {
    pub fn with_listing_url(mut self, url: impl Into<String>) -> Self {
        self.listing_url = url.into();
        self
    }

    pub fn listing_url(&self) -> &str {
        &self.listing_url
    }

    pub fn layout(&self) -> ListingLayout {
        self.layout
    }

    /// Extracts drafts from a listing page. Pure; `fetch` only adds the HTTP round trip.
    pub fn parse_listing(
        &self,
        html: &str,
        scraped_at: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<ListingDraft>, AdapterError> {
        let document = Html::parse_document(html);
        let page = Page {
            source_name: self.source_name,
            base_url: self.base_url,
            scraped_at,
            limit: limit.filter(|l| *l > 0),
        };
        match self.layout {
            ListingLayout::PosterGrid => parse_poster_grid(&document, &page),
            ListingLayout::CardList => parse_card_list(&document, &page),
            ListingLayout::StageReviews => parse_stage_reviews(&document, &page),
            ListingLayout::BoxOfficeList => parse_box_office_list(&document, &page),
            ListingLayout::EventList => parse_event_list(&document, &page),
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn name(&self) -> &'static str {
        self.source_name
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        limit: Option<usize>,
    ) -> Result<Vec<ListingDraft>, AdapterError> {
        let page = http.fetch_page(self.source_name, &self.listing_url).await?;
        let drafts = self.parse_listing(&page.body, ctx.scraped_at, limit)?;
        if drafts.is_empty() {
            warn!(
                source = self.source_name,
                run_id = %ctx.run_id,
                status = page.status.as_u16(),
                final_url = %page.final_url,
                body_len = page.body.len(),
                "no listings parsed; page layout may have changed"
            );
        } else {
            info!(
                source = self.source_name,
                run_id = %ctx.run_id,
                final_url = %page.final_url,
                parsed = drafts.len(),
                "parsed listings"
            );
        }
        Ok(drafts)
    }
}

pub fn london_theatre_adapter() -> HtmlListingAdapter {
    HtmlListingAdapter {
        source_name: "london-theatre",
        base_url: "https://www.londontheatre.co.uk",
        listing_url: "https://www.londontheatre.co.uk/whats-on".to_string(),
        layout: ListingLayout::PosterGrid,
    }
}

pub fn timeout_adapter() -> HtmlListingAdapter {
    HtmlListingAdapter {
        source_name: "timeout",
        base_url: "https://www.timeout.com",
        listing_url: "https://www.timeout.com/london/theatre".to_string(),
        layout: ListingLayout::CardList,
    }
}

pub fn guardian_adapter() -> HtmlListingAdapter {
    HtmlListingAdapter {
        source_name: "guardian",
        base_url: "https://www.theguardian.com",
        listing_url: "https://www.theguardian.com/stage".to_string(),
        layout: ListingLayout::StageReviews,
    }
}

pub fn london_box_office_adapter() -> HtmlListingAdapter {
    HtmlListingAdapter {
        source_name: "london-box-office",
        base_url: "https://www.londonboxoffice.co.uk",
        listing_url: "https://www.londonboxoffice.co.uk/all-london-shows".to_string(),
        layout: ListingLayout::BoxOfficeList,
    }
}

pub fn whats_on_london_adapter() -> HtmlListingAdapter {
    HtmlListingAdapter {
        source_name: "whats-on-london",
        base_url: "https://www.whatsonlondon.co.uk",
        listing_url: "https://www.whatsonlondon.co.uk/theatre".to_string(),
        layout: ListingLayout::EventList,
    }
}

/// Builds the adapter registered under `source_id`, optionally pointed at another listing page.
pub fn adapter_for_source(source_id: &str, listing_url: Option<&str>) -> Option<Box<dyn SourceAdapter>> {
    let adapter = match source_id {
        "london-theatre" => london_theatre_adapter(),
        "timeout" => timeout_adapter(),
        "guardian" => guardian_adapter(),
        "london-box-office" => london_box_office_adapter(),
        "whats-on-london" => whats_on_london_adapter(),
        _ => return None,
    };
    Some(match listing_url {
        Some(url) => Box::new(adapter.with_listing_url(url)),
        None => Box::new(adapter),
    })
}

struct Page {
    source_name: &'static str,
    base_url: &'static str,
    scraped_at: DateTime<Utc>,
    limit: Option<usize>,
}

impl Page {
    fn full(&self, drafts: &[ListingDraft]) -> bool {
        self.limit.is_some_and(|limit| drafts.len() >= limit)
    }

    fn draft(&self, title: String) -> ListingDraft {
        ListingDraft::new(self.source_name, title, self.scraped_at)
    }

    fn url(&self, relative: Option<String>) -> Option<String> {
        resolve_url(self.base_url, relative.as_deref())
    }
}

/// Resolves `relative` against `base`; anything unparseable becomes `None`.
pub fn resolve_url(base: &str, relative: Option<&str>) -> Option<String> {
    let relative = relative.map(str::trim).filter(|r| !r.is_empty())?;
    let base = Url::parse(base).ok()?;
    base.join(relative).ok().map(String::from)
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("invalid selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Text of every match concatenated, trimmed.
fn joined_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    text_or_none(
        scope
            .select(sel)
            .flat_map(|n| n.text())
            .collect::<String>(),
    )
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(el.text().collect::<String>())
}

fn parse_poster_grid(document: &Html, page: &Page) -> Result<Vec<ListingDraft>, AdapterError> {
    let cards = selector(r#"div[data-test-id^="poster-"]"#)?;
    let title_sel = selector(r#"p[data-test-id^="product-"]"#)?;
    let img = selector("img")?;

    let mut drafts = Vec::new();
    for card in document.select(&cards) {
        if page.full(&drafts) {
            break;
        }
        let Some(title_el) = card.select(&title_sel).next() else {
            continue;
        };
        let Some(title) = element_text(title_el) else {
            continue;
        };
        let link = title_el
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|e| e.value().name() == "a")
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| text_or_none(href.to_string()));
        let Some(link) = link else {
            continue;
        };

        drafts.push(
            page.draft(title)
                .with_page_url(page.url(Some(link)))
                .with_image_url(page.url(first_attr(card, &img, "src"))),
        );
    }
    Ok(drafts)
}

fn parse_card_list(document: &Html, page: &Page) -> Result<Vec<ListingDraft>, AdapterError> {
    let cards = selector(".card-list__item, .event-card")?;
    let title_sel = selector("h3, .event-card__title, .card__title")?;
    let link_sel = selector("a")?;
    let img = selector("img")?;
    let rating_sel = selector(".rating, .stars")?;
    let price_sel = selector(".price, .event-price")?;

    let mut drafts = Vec::new();
    for card in document.select(&cards) {
        if page.full(&drafts) {
            break;
        }
        let (Some(title), Some(link)) = (joined_text(card, &title_sel), first_attr(card, &link_sel, "href"))
        else {
            continue;
        };
        let image = first_attr(card, &img, "src").or_else(|| first_attr(card, &img, "data-src"));

        drafts.push(
            page.draft(title)
                .with_page_url(page.url(Some(link)))
                .with_image_url(page.url(image))
                .with_attribute("rating", joined_text(card, &rating_sel))
                .with_attribute("price", joined_text(card, &price_sel)),
        );
    }
    Ok(drafts)
}

static SHOW_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?)\s+review\s*[–-]").expect("valid show name regex"));

static THEATRE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)at\s+(.+?)\s+theatre",
        r"(?i)(\w+\s+theatre)",
        r"(?i)(royal\s+\w+)",
        r"(?i)(old\s+vic)",
        r"(?i)(national\s+theatre)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid theatre regex"))
    .collect()
});

fn is_star(c: char) -> bool {
    matches!(c, '★' | '⭐')
}

/// Star glyphs count as the rating; otherwise "four star" style phrases are recognised.
pub fn extract_rating(title: &str) -> Option<String> {
    let stars = title.chars().filter(|c| is_star(*c)).count();
    if stars > 0 {
        return Some(format!("{stars}/5"));
    }
    let lower = title.to_lowercase();
    [
        ("five star", "5/5"),
        ("four star", "4/5"),
        ("three star", "3/5"),
        ("two star", "2/5"),
        ("one star", "1/5"),
    ]
    .iter()
    .find(|(phrase, _)| lower.contains(phrase))
    .map(|(_, rating)| rating.to_string())
}

/// "Hamlet review – a thrilling ..." yields "Hamlet".
pub fn extract_show_name(title: &str) -> Option<String> {
    let caps = SHOW_NAME_RE.captures(title)?;
    let name = caps.get(1)?.as_str().replace(is_star, "");
    text_or_none(name)
}

pub fn extract_theatre(title: &str, excerpt: Option<&str>) -> Option<String> {
    let text = format!("{} {}", title, excerpt.unwrap_or_default()).to_lowercase();
    THEATRE_RES
        .iter()
        .find_map(|re| re.captures(&text).and_then(|c| c.get(1)))
        .and_then(|m| text_or_none(m.as_str().to_string()))
}

fn parse_stage_reviews(document: &Html, page: &Page) -> Result<Vec<ListingDraft>, AdapterError> {
    let items = selector("article, .fc-item, .fc-item--standard")?;
    let headline = selector("h3 a, .fc-item__title a, .headline a")?;
    let excerpt_sel = selector(".fc-item__standfirst, .fc-trail__text, .summary")?;
    let author_sel = selector(".byline, .contributor, .fc-item__byline")?;
    let time_sel = selector("time")?;

    let mut drafts = Vec::new();
    for item in document.select(&items) {
        if page.full(&drafts) {
            break;
        }
        let Some(headline_el) = item.select(&headline).next() else {
            continue;
        };
        let (Some(title), Some(link)) = (
            element_text(headline_el),
            headline_el.value().attr("href").and_then(|h| text_or_none(h.to_string())),
        ) else {
            continue;
        };
        if !(title.to_lowercase().contains("review") || title.contains('★')) {
            continue;
        }

        let excerpt = joined_text(item, &excerpt_sel);
        let published = item.select(&time_sel).next().and_then(|t| {
            t.value()
                .attr("datetime")
                .and_then(|d| text_or_none(d.to_string()))
                .or_else(|| element_text(t))
        });

        drafts.push(
            page.draft(title.clone())
                .with_page_url(page.url(Some(link)))
                .with_attribute("rating", extract_rating(&title))
                .with_attribute("show_name", extract_show_name(&title))
                .with_attribute("theatre", extract_theatre(&title, excerpt.as_deref()))
                .with_attribute("excerpt", excerpt)
                .with_attribute("author", joined_text(item, &author_sel))
                .with_attribute("published_date", published),
        );
    }
    Ok(drafts)
}

static POUND_PRICE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"£\d+\.\d+").expect("valid price regex"));

fn parse_box_office_list(document: &Html, page: &Page) -> Result<Vec<ListingDraft>, AdapterError> {
    let items = selector("div.listitem")?;
    let title_sel = selector("h3 a")?;
    let from_strong = selector("span.from strong")?;
    let from = selector("span.from")?;
    let venue_sel = selector("p.loc.mo")?;
    let desc_sel = selector("div.desc p")?;
    let booking_sel = selector(".booking-until")?;
    let poster = selector("div.poster img")?;

    let mut drafts = Vec::new();
    for item in document.select(&items) {
        if page.full(&drafts) {
            break;
        }
        let Some(title) = joined_text(item, &title_sel) else {
            continue;
        };
        let link = first_attr(item, &title_sel, "href");
        let venue = joined_text(item, &venue_sel);
        if link.is_none() && venue.is_none() {
            continue;
        }

        let price = item
            .value()
            .attr("data-price")
            .and_then(|p| text_or_none(p.to_string()))
            .map(|p| format!("£{p}.00"))
            .or_else(|| joined_text(item, &from_strong))
            .or_else(|| {
                joined_text(item, &from)
                    .and_then(|t| POUND_PRICE_RE.find(&t).map(|m| m.as_str().to_string()))
            });
        let booking_until = joined_text(item, &booking_sel)
            .map(|t| t.replace("Booking until:", ""))
            .and_then(text_or_none);

        drafts.push(
            page.draft(title)
                .with_page_url(page.url(link))
                .with_image_url(page.url(first_attr(item, &poster, "src")))
                .with_attribute("price", price)
                .with_attribute("venue", venue)
                .with_attribute("description", joined_text(item, &desc_sel))
                .with_attribute("booking_until", booking_until),
        );
    }
    Ok(drafts)
}

fn parse_event_list(document: &Html, page: &Page) -> Result<Vec<ListingDraft>, AdapterError> {
    let items = selector(".event-item, .listing-item")?;
    let title_sel = selector("h2, h3, .event-title")?;
    let link_sel = selector("a")?;
    let venue_sel = selector(".venue, .location")?;
    let dates_sel = selector(".dates, .event-dates")?;
    let img = selector("img")?;

    let mut drafts = Vec::new();
    for item in document.select(&items) {
        if page.full(&drafts) {
            break;
        }
        let (Some(title), Some(link)) = (joined_text(item, &title_sel), first_attr(item, &link_sel, "href"))
        else {
            continue;
        };

        drafts.push(
            page.draft(title)
                .with_page_url(page.url(Some(link)))
                .with_image_url(page.url(first_attr(item, &img, "src")))
                .with_attribute("venue", joined_text(item, &venue_sel))
                .with_attribute("dates", joined_text(item, &dates_sel)),
        );
    }
    Ok(drafts)
}
