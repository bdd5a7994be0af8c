use crate::utils::{clean_string, normalize_whitespace};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

/// Result of main-content extraction over one HTML document.
#[derive(Debug, Clone)]
pub struct ParsedArticle {
    pub title: String,
    pub text: String,
    pub published_time: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("readability error: {0}")]
    Readability(String),
    #[error("no article found in document")]
    NoArticleFound,
}

/// Containers likely to hold the article body, in priority order.
const CONTAINER_SELECTORS: &[&str] = &[
    "article",
    r#"div[data-testid="article-body"]"#,
    r#"section[name="articleBody"]"#,
    "#article",
    ".article-body",
    ".article",
    ".post-content",
    ".post",
    ".content",
    "main",
];

static PARAGRAPH: Lazy<Selector> = Lazy::new(|| Selector::parse("p").unwrap());
static H1: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());
static OG_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
static DOC_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static PUBLISHED_META: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="article:published_time"]"#).unwrap());
static TIME_DATETIME: Lazy<Selector> = Lazy::new(|| Selector::parse("time[datetime]").unwrap());

/// Readability-style extraction: walk candidate containers for paragraph
/// text, fall back to a filtered sweep of every `<p>` in the document.
pub fn parse_article(html: &str) -> Result<ParsedArticle, ExtractError> {
    if html.trim().is_empty() {
        return Err(ExtractError::Readability("empty document".to_string()));
    }
    let document = Html::parse_document(html);

    let title = clean_string(&extract_title(&document).unwrap_or_default());

    let mut paragraphs = Vec::new();
    for css in CONTAINER_SELECTORS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        for container in document.select(&selector) {
            collect_paragraphs(&container, &mut paragraphs, 10);
        }
        if !paragraphs.is_empty() {
            debug!(selector = css, count = paragraphs.len(), "matched container");
            break;
        }
    }

    // Last resort: every paragraph in the document, with a stricter length
    // gate to keep navigation and footer fragments out.
    if paragraphs.is_empty() {
        for p in document.select(&PARAGRAPH) {
            let text = element_text(&p);
            if text.len() > 50 {
                paragraphs.push(text);
            }
        }
    }

    let text = normalize_whitespace(&paragraphs.join("\n\n"));
    if title.is_empty() || text.is_empty() {
        return Err(ExtractError::NoArticleFound);
    }

    Ok(ParsedArticle {
        title,
        text,
        published_time: extract_published_time(&document),
    })
}

fn collect_paragraphs(container: &ElementRef<'_>, out: &mut Vec<String>, min_len: usize) {
    for p in container.select(&PARAGRAPH) {
        let text = element_text(&p);
        if text.len() > min_len {
            out.push(text);
        }
    }
}

fn element_text(el: &ElementRef<'_>) -> String {
    clean_string(&el.text().collect::<Vec<_>>().join(" "))
}

fn extract_title(document: &Html) -> Option<String> {
    if let Some(h1) = document.select(&H1).next() {
        let text = element_text(&h1);
        if !text.is_empty() {
            return Some(text);
        }
    }
    if let Some(meta) = document.select(&OG_TITLE).next() {
        if let Some(content) = meta.value().attr("content") {
            if !content.trim().is_empty() {
                return Some(content.to_string());
            }
        }
    }
    document.select(&DOC_TITLE).next().map(|t| element_text(&t))
}

fn extract_published_time(document: &Html) -> Option<String> {
    if let Some(meta) = document.select(&PUBLISHED_META).next() {
        if let Some(content) = meta.value().attr("content") {
            return Some(content.to_string());
        }
    }
    document
        .select(&TIME_DATETIME)
        .next()
        .and_then(|t| t.value().attr("datetime").map(|s| s.to_string()))
}
