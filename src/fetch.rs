use once_cell::sync::Lazy;
use rand::{Rng, rng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Small pool of current mobile user agents; rotated per request.
const UA_POOL: &[&str] = &[
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 \
     (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/125.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 13; SM-S918B) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_6 like Mac OS X) AppleWebKit/605.1.15 \
     (KHTML, like Gecko) CriOS/125.0.0.0 Mobile/15E148 Safari/604.1",
];

pub fn random_user_agent() -> &'static str {
    UA_POOL[rng().random_range(0..UA_POOL.len())]
}

// Shared client for plain fetches and feed polls.
static CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .expect("failed to build reqwest client")
});

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("fetch error: HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("render service error: {0}")]
    Render(String),
    #[error("render response validation error: {0}")]
    Validation(String),
}

/// Plain HTTP GET with a randomized mobile UA and a Google referer.
/// Non-2xx is an error.
#[instrument(level = "debug", skip_all, fields(%url))]
pub async fn fetch_plain(url: &str) -> Result<String, FetchError> {
    let response = CLIENT
        .get(url)
        .header(reqwest::header::USER_AGENT, random_user_agent())
        .header(reqwest::header::REFERER, "https://www.google.com/")
        .send()
        .await
        .map_err(|e| FetchError::Fetch(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    response
        .text()
        .await
        .map_err(|e| FetchError::Fetch(e.to_string()))
}

/// Fetch a feed document body. Feeds get the same client but no referer.
#[instrument(level = "debug", skip_all, fields(%url))]
pub async fn fetch_feed_body(url: &str) -> Result<String, FetchError> {
    let response = CLIENT
        .get(url)
        .header(reqwest::header::USER_AGENT, random_user_agent())
        .send()
        .await
        .map_err(|e| FetchError::Fetch(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    response
        .text()
        .await
        .map_err(|e| FetchError::Fetch(e.to_string()))
}

/// Page-side cleanup scripts injected before content extraction, in order.
const PAGE_SCRIPTS: &[&str] = &[
    // 1. Normalize locale-dependent date rendering.
    r#"(() => {
  const Original = Intl.DateTimeFormat;
  Intl.DateTimeFormat = function (locale, options) { return new Original('en-US', options); };
  Intl.DateTimeFormat.prototype = Original.prototype;
})();"#,
    // 2. Click the first cookie/consent accept control.
    r#"(() => {
  const nodes = document.querySelectorAll('button, a');
  for (const node of nodes) {
    const text = (node.textContent || '').toLowerCase();
    if (text.includes('accept') && (text.includes('cookie') || text.includes('consent'))) {
      node.click();
      break;
    }
  }
})();"#,
    // 3. Remove paywall/subscribe overlays and restore scroll.
    r#"(() => {
  document.querySelectorAll('[id*="paywall" i], [class*="paywall" i], [id*="subscribe" i], [class*="subscribe" i]')
    .forEach((n) => n.remove());
  document.querySelectorAll('div, section').forEach((n) => {
    const style = window.getComputedStyle(n);
    if ((style.position === 'fixed' || style.position === 'sticky') && parseInt(style.zIndex || '0', 10) > 100) {
      n.remove();
    }
  });
  document.documentElement.style.overflow = 'auto';
  document.body.style.overflow = 'auto';
  document.body.style.position = 'static';
})();"#,
    // 4. Remove noise elements.
    r#"(() => {
  const selectors = [
    'script', 'style', 'iframe', 'noscript', 'form',
    '[class*="ad-" i]', '[id*="advert" i]', '[class*="advert" i]',
    '[class*="social" i]', '[class*="share" i]', '[class*="comment" i]',
    '[class*="newsletter" i]', 'nav', 'aside',
    'header:not(article header)', 'footer:not(article footer)',
  ];
  selectors.forEach((sel) => document.querySelectorAll(sel).forEach((n) => n.remove()));
})();"#,
    // 5. Strip every attribute except href, src, alt, title.
    r#"(() => {
  const keep = new Set(['href', 'src', 'alt', 'title']);
  document.querySelectorAll('*').forEach((n) => {
    for (const attr of Array.from(n.attributes)) {
      if (!keep.has(attr.name.toLowerCase())) n.removeAttribute(attr.name);
    }
  });
})();"#,
    // 6. Iteratively remove empty block elements until a pass removes none.
    r#"(() => {
  let removed = true;
  while (removed) {
    removed = false;
    document.querySelectorAll('div, section, span, p, ul, li').forEach((n) => {
      if (!n.textContent.trim() && !n.querySelector('img')) {
        n.remove();
        removed = true;
      }
    });
  }
})();"#,
    // 7. Remove meta tags with at most one attribute.
    r#"(() => {
  document.querySelectorAll('meta').forEach((n) => {
    if (n.attributes.length <= 1) n.remove();
  });
})();"#,
];

/// Selector whose appearance means the article body has rendered.
const CONTENT_READY_SELECTOR: &str = "article, .article, .content, .post, #article, main";
const CONTENT_READY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Serialize)]
struct ScriptTag {
    content: String,
}

#[derive(Debug, Serialize)]
struct WaitForSelector {
    selector: String,
    timeout: u64,
}

#[derive(Debug, Serialize)]
struct RenderRequest {
    url: String,
    #[serde(rename = "userAgent")]
    user_agent: String,
    #[serde(rename = "addScriptTag")]
    add_script_tag: Vec<ScriptTag>,
    #[serde(rename = "waitForSelector")]
    wait_for_selector: WaitForSelector,
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    status: bool,
    #[serde(default)]
    errors: Vec<RenderServiceError>,
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenderServiceError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Client for the external headless-browser rendering service.
#[derive(Debug, Clone)]
pub struct Renderer {
    base_url: String,
    account_id: String,
    api_token: String,
    client: Client,
}

impl Renderer {
    pub fn new(base_url: &str, account_id: &str, api_token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build renderer client"),
        }
    }

    /// Fetch a page through the rendering service: inject the cleanup
    /// scripts, wait for the article body, return the rendered HTML.
    #[instrument(level = "debug", skip_all, fields(%url))]
    pub async fn fetch_rendered(&self, url: &str) -> Result<String, FetchError> {
        let endpoint = format!(
            "{}/accounts/{}/browser-rendering/content",
            self.base_url, self.account_id
        );
        let body = RenderRequest {
            url: url.to_string(),
            user_agent: random_user_agent().to_string(),
            add_script_tag: PAGE_SCRIPTS
                .iter()
                .map(|s| ScriptTag {
                    content: (*s).to_string(),
                })
                .collect(),
            wait_for_selector: WaitForSelector {
                selector: CONTENT_READY_SELECTOR.to_string(),
                timeout: CONTENT_READY_TIMEOUT_MS,
            },
        };

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::Render(format!("render request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%url, status = status.as_u16(), "render service rejected request");
            return Err(FetchError::Render(format!(
                "render service returned HTTP {status}: {detail}"
            )));
        }

        let parsed: RenderResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Validation(format!("malformed render response: {e}")))?;

        if !parsed.status {
            let detail = parsed
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(FetchError::Render(format!("render failed: {detail}")));
        }

        match parsed.result {
            Some(html) if !html.trim().is_empty() => {
                debug!(%url, bytes = html.len(), "rendered page");
                Ok(html)
            }
            _ => Err(FetchError::Validation(
                "render response missing result".to_string(),
            )),
        }
    }
}
