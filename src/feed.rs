use crate::utils::{clean_string, clean_url};
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// One validated feed entry, in feed order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub pub_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum FeedError {
    /// The document is not XML at all.
    #[error("feed parse error: {0}")]
    Parse(String),
    /// The document decoded but no entry survived validation.
    #[error("feed validation error: no valid entries")]
    Validation,
}

#[derive(Debug, Default)]
struct RawEntry {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    date: Option<String>,
}

/// Field of the entry currently being captured as text.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Capture {
    None,
    Title,
    Link,
    Guid,
    Date,
}

/// Decode an RSS/Atom/RDF document into validated entries.
///
/// Entries are any `item`/`entry` element at any depth, which covers
/// `rss.channel.item`, `feed.entry`, a top-level `item`, and `rdf:RDF.item`
/// alike; a lone item naturally becomes a one-element list. Malformed
/// entries are dropped, not raised.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, FeedError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut raw_entries: Vec<RawEntry> = Vec::new();
    let mut current: Option<RawEntry> = None;
    let mut capture = Capture::None;
    let mut saw_xml = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                saw_xml = true;
                let name = local_name(&e);
                if is_entry_tag(&name) {
                    current = Some(RawEntry::default());
                } else if let Some(entry) = current.as_mut() {
                    capture = capture_for(&name);
                    if capture == Capture::Link {
                        // Atom: <link href="..." rel="alternate">…</link>
                        if let Some(href) = link_href(&e) {
                            entry.link.get_or_insert(href);
                            capture = Capture::None;
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                saw_xml = true;
                let name = local_name(&e);
                if name.eq_ignore_ascii_case("link") {
                    if let Some(entry) = current.as_mut() {
                        if let Some(href) = link_href(&e) {
                            entry.link.get_or_insert(href);
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(entry) = current.as_mut() {
                    if let Ok(raw) = std::str::from_utf8(t.as_ref()) {
                        let text = quick_xml::escape::unescape(raw)
                            .map(|v| v.into_owned())
                            .unwrap_or_else(|_| raw.to_string());
                        store_capture(entry, capture, &text);
                    }
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(entry) = current.as_mut() {
                    let text = String::from_utf8_lossy(t.as_ref()).into_owned();
                    store_capture(entry, capture, &text);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = String::from_utf8_lossy(name.as_ref()).into_owned();
                if is_entry_tag(&name) {
                    if let Some(entry) = current.take() {
                        raw_entries.push(entry);
                    }
                } else if capture_for(&name) == capture {
                    capture = Capture::None;
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {
                saw_xml = true;
            }
            Err(e) => {
                // A broken tail after decodable entries yields partial
                // results; a document that never parsed is PARSE_ERROR.
                if raw_entries.is_empty() && current.is_none() {
                    return Err(FeedError::Parse(e.to_string()));
                }
                warn!(error = %e, entries = raw_entries.len(), "feed XML error; keeping partial results");
                break;
            }
        }
        buf.clear();
    }

    if !saw_xml {
        return Err(FeedError::Parse("document is not XML".to_string()));
    }

    let entries: Vec<FeedEntry> = raw_entries.into_iter().filter_map(validate_entry).collect();
    if entries.is_empty() {
        return Err(FeedError::Validation);
    }
    Ok(entries)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn is_entry_tag(name: &str) -> bool {
    name.eq_ignore_ascii_case("item") || name.eq_ignore_ascii_case("entry")
}

fn capture_for(name: &str) -> Capture {
    if name.eq_ignore_ascii_case("title") {
        Capture::Title
    } else if name.eq_ignore_ascii_case("link") {
        Capture::Link
    } else if name.eq_ignore_ascii_case("guid") || name.eq_ignore_ascii_case("id") {
        Capture::Guid
    } else if name.eq_ignore_ascii_case("pubdate")
        || name.eq_ignore_ascii_case("published")
        || name.eq_ignore_ascii_case("updated")
        || name.eq_ignore_ascii_case("date")
    {
        Capture::Date
    } else {
        Capture::None
    }
}

fn link_href(e: &BytesStart<'_>) -> Option<String> {
    let rel = e
        .try_get_attribute("rel")
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
    if matches!(rel.as_deref(), Some("self") | Some("enclosure")) {
        return None;
    }
    e.try_get_attribute("href")
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn store_capture(entry: &mut RawEntry, capture: Capture, text: &str) {
    let slot = match capture {
        Capture::Title => &mut entry.title,
        Capture::Link => &mut entry.link,
        Capture::Guid => &mut entry.guid,
        Capture::Date => &mut entry.date,
        Capture::None => return,
    };
    match slot {
        // Entry titles split across text nodes are concatenated.
        Some(existing) if capture == Capture::Title => {
            existing.push(' ');
            existing.push_str(text);
        }
        Some(_) => {}
        None => *slot = Some(text.to_string()),
    }
}

/// Apply defaults, normalization, and validation; `None` drops the entry.
fn validate_entry(raw: RawEntry) -> Option<FeedEntry> {
    let title = clean_string(raw.title.as_deref().unwrap_or("UNKNOWN"));
    let title = if title.is_empty() {
        "UNKNOWN".to_string()
    } else {
        title
    };

    let link_raw = raw
        .link
        .or(raw.guid)
        .unwrap_or_else(|| "UNKNOWN".to_string());
    let link = clean_url(&clean_string(&link_raw));

    if Url::parse(&link).is_err() {
        debug!(%title, %link, "dropping feed entry with unparseable link");
        return None;
    }

    let pub_date = raw.date.as_deref().and_then(parse_feed_date);

    Some(FeedEntry {
        title,
        link,
        pub_date,
    })
}

/// Parse the date formats feeds actually use; anything else is None.
fn parse_feed_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
          <title>Example Wire</title>
          <link>https://example.com</link>
          <item>
            <title>  Hello   world </title>
            <link>https://example.com/a?utm_source=x</link>
            <pubDate>Wed, 01 Jan 2025 00:00:00 GMT</pubDate>
          </item>
          <item>
            <title><![CDATA[Second story]]></title>
            <link>https://example.com/b</link>
          </item>
        </channel></rss>"#;

    #[test]
    fn test_parses_rss_in_feed_order() {
        let entries = parse_feed(RSS).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Hello world");
        assert_eq!(entries[0].link, "https://example.com/a");
        assert_eq!(
            entries[0].pub_date.unwrap().to_rfc3339(),
            "2025-01-01T00:00:00+00:00"
        );
        assert_eq!(entries[1].title, "Second story");
        assert_eq!(entries[1].pub_date, None);
    }

    #[test]
    fn test_parses_atom_href_links() {
        let atom = r#"<?xml version="1.0"?>
            <feed xmlns="http://www.w3.org/2005/Atom">
              <title>Atom Feed</title>
              <link href="https://example.com/feed.xml" rel="self"/>
              <entry>
                <title>Atom entry</title>
                <link href="https://example.com/atom-story" rel="alternate"/>
                <id>urn:uuid:123</id>
                <updated>2025-02-03T10:00:00Z</updated>
              </entry>
            </feed>"#;
        let entries = parse_feed(atom).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].link, "https://example.com/atom-story");
        assert!(entries[0].pub_date.is_some());
    }

    #[test]
    fn test_parses_rdf_items() {
        let rdf = r#"<?xml version="1.0"?>
            <rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#"
                     xmlns="http://purl.org/rss/1.0/"
                     xmlns:dc="http://purl.org/dc/elements/1.1/">
              <channel><title>RDF Feed</title></channel>
              <item>
                <title>RDF entry</title>
                <link>https://example.com/rdf-story</link>
                <dc:date>2025-03-04T12:00:00Z</dc:date>
              </item>
            </rdf:RDF>"#;
        let entries = parse_feed(rdf).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].link, "https://example.com/rdf-story");
        assert!(entries[0].pub_date.is_some());
    }

    #[test]
    fn test_single_item_promotes_to_list() {
        let xml = r#"<rss><channel><item>
            <title>Lone</title><link>https://example.com/one</link>
        </item></channel></rss>"#;
        let entries = parse_feed(xml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Lone");
    }

    #[test]
    fn test_guid_fallback_for_missing_link() {
        let xml = r#"<rss><channel><item>
            <title>Guid only</title>
            <guid>https://example.com/from-guid</guid>
        </item></channel></rss>"#;
        let entries = parse_feed(xml).unwrap();
        assert_eq!(entries[0].link, "https://example.com/from-guid");
    }

    #[test]
    fn test_missing_title_defaults_unknown() {
        let xml = r#"<rss><channel><item>
            <link>https://example.com/untitled</link>
        </item></channel></rss>"#;
        let entries = parse_feed(xml).unwrap();
        assert_eq!(entries[0].title, "UNKNOWN");
    }

    #[test]
    fn test_unparseable_link_is_dropped() {
        let xml = r#"<rss><channel>
            <item><title>Bad</title><link>not a url</link></item>
            <item><title>Good</title><link>https://example.com/ok</link></item>
        </channel></rss>"#;
        let entries = parse_feed(xml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Good");
    }

    #[test]
    fn test_unparseable_date_becomes_none() {
        let xml = r#"<rss><channel><item>
            <title>Dated</title>
            <link>https://example.com/d</link>
            <pubDate>sometime next week</pubDate>
        </item></channel></rss>"#;
        let entries = parse_feed(xml).unwrap();
        assert_eq!(entries[0].pub_date, None);
    }

    #[test]
    fn test_non_xml_is_parse_error() {
        match parse_feed("<html><body>Not a feed</body></html>") {
            // An HTML page is well-formed-ish XML with no entries.
            Err(FeedError::Validation) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match parse_feed("{\"this\": \"is json\"}") {
            Err(FeedError::Parse(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_all_entries_invalid_is_validation_error() {
        let xml = r#"<rss><channel>
            <item><title>No link at all</title></item>
        </channel></rss>"#;
        assert!(matches!(parse_feed(xml), Err(FeedError::Validation)));
    }

    #[test]
    fn test_reparse_yields_identical_entries() {
        let first = parse_feed(RSS).unwrap();
        let second = parse_feed(RSS).unwrap();
        assert_eq!(first, second);
    }
}
