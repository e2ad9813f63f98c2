//! External collaborators: seed search and page fetching.
//!
//! Both are traits so the pipeline can run against fakes in tests. The
//! built-in implementations are [`StaticSeedSearch`], which answers every
//! query with the configured URL list, and [`HttpFetcher`], which fetches
//! over `reqwest` after consulting the host's robots.txt.
//!
//! # Error mapping
//!
//! | Condition | Error |
//! |-----------|-------|
//! | robots.txt disallows the path | `FetchDenied` |
//! | 429, 5xx, timeout, connection failure | `TransientIo` |
//! | any other 4xx | `Terminal` |

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use energy_cost_core::PipelineError;
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::config::{FetchConfig, SearchConfig};

/// A fetched page reduced to text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Normalized plain text.
    pub body: String,
}

impl FetchedPage {
    /// First 200 characters of the body.
    pub fn snippet(&self) -> String {
        self.body.chars().take(200).collect()
    }
}

#[async_trait]
pub trait SeedSearch: Send + Sync {
    /// Candidate URLs for `query`.
    async fn search(&self, query: &str) -> Result<Vec<String>, PipelineError>;
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, PipelineError>;
}

/// Seed search backed by a fixed URL list.
#[derive(Debug, Clone)]
pub struct StaticSeedSearch {
    urls: Vec<String>,
}

impl StaticSeedSearch {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        Self::new(config.seed_urls.clone())
    }
}

#[async_trait]
impl SeedSearch for StaticSeedSearch {
    async fn search(&self, query: &str) -> Result<Vec<String>, PipelineError> {
        if query.trim().is_empty() {
            return Err(PipelineError::invalid("query must not be empty"));
        }
        Ok(self.urls.clone())
    }
}

// ============ robots.txt ============

#[derive(Debug, Clone, PartialEq)]
struct RobotsRule {
    allow: bool,
    pattern: String,
}

/// Rules from one robots.txt that apply to our user agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RobotsRules {
    rules: Vec<RobotsRule>,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse robots.txt, keeping the group addressed to `user_agent`'s
    /// product token, or the `*` group when none is.
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let token = user_agent
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let mut specific: Vec<RobotsRule> = Vec::new();
        let mut wildcard: Vec<RobotsRule> = Vec::new();
        let mut found_specific = false;

        // Agents named by the current group, and whether rules have started.
        let mut agents: Vec<String> = Vec::new();
        let mut in_rules = false;

        for raw in content.lines() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    if in_rules {
                        agents.clear();
                        in_rules = false;
                    }
                    agents.push(value.to_ascii_lowercase());
                }
                "allow" | "disallow" => {
                    in_rules = true;
                    let allow = field == "allow";
                    // An empty Disallow allows everything.
                    if value.is_empty() {
                        continue;
                    }
                    let rule = RobotsRule {
                        allow,
                        pattern: value.to_string(),
                    };
                    if !token.is_empty() && agents.iter().any(|a| *a == token) {
                        found_specific = true;
                        specific.push(rule.clone());
                    }
                    if agents.iter().any(|a| a == "*") {
                        wildcard.push(rule);
                    }
                }
                _ => {}
            }
        }

        Self {
            rules: if found_specific { specific } else { wildcard },
        }
    }

    /// Longest matching rule wins; Allow wins a tie.
    pub fn is_allowed(&self, path: &str) -> bool {
        let mut best: Option<&RobotsRule> = None;
        for rule in &self.rules {
            if !pattern_matches(&rule.pattern, path) {
                continue;
            }
            best = match best {
                Some(b)
                    if b.pattern.len() > rule.pattern.len()
                        || (b.pattern.len() == rule.pattern.len() && b.allow) =>
                {
                    Some(b)
                }
                _ => Some(rule),
            };
        }
        best.map(|r| r.allow).unwrap_or(true)
    }
}

/// robots.txt path pattern: prefix match with `*` wildcards and an optional
/// trailing `$` anchor.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = path.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    for (i, part) in parts.iter().enumerate() {
        let last = i == parts.len() - 1;
        if last && anchored {
            return rest.ends_with(part);
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    !anchored || rest.is_empty() || pattern.ends_with('*')
}

// ============ HTML to text ============

static TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static PUBLISHED: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        r#"meta[property="article:published_time"], meta[name="date"], meta[name="dc.date"], meta[name="pubdate"]"#,
    )
    .unwrap()
});

/// Elements whose text is never page content.
const HIDDEN_TAGS: &[&str] = &["head", "script", "style", "noscript", "template", "svg"];

/// Elements that start a new line of text.
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol", "p",
    "pre", "section", "table", "td", "th", "tr", "ul",
];

/// Collapse runs of whitespace inside each line and drop empty lines.
fn normalize_lines(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if HIDDEN_TAGS.contains(&name) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&name);
                if block {
                    out.push('\n');
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// Reduce an HTML document (or plain text) to a [`FetchedPage`].
pub fn html_to_page(url: &str, html: &str) -> FetchedPage {
    let doc = Html::parse_document(html);

    let title = doc
        .select(&TITLE)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty());

    let published_at = doc
        .select(&PUBLISHED)
        .filter_map(|el| el.value().attr("content"))
        .find_map(|content| DateTime::parse_from_rfc3339(content.trim()).ok())
        .map(|d| d.with_timezone(&Utc));

    let mut text = String::new();
    collect_text(doc.root_element(), &mut text);

    FetchedPage {
        url: url.to_string(),
        title,
        published_at,
        body: normalize_lines(&text),
    }
}

// ============ HTTP fetcher ============

/// `reqwest`-based fetcher with a per-host robots.txt cache.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: FetchConfig,
    robots: Mutex<HashMap<String, Arc<RobotsRules>>>,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
            robots: Mutex::new(HashMap::new()),
        })
    }

    async fn robots_for(&self, url: &Url) -> Result<Arc<RobotsRules>, PipelineError> {
        let origin = url.origin().ascii_serialization();
        if let Some(rules) = self.robots.lock().await.get(&origin) {
            return Ok(rules.clone());
        }

        let robots_url = format!("{}/robots.txt", origin);
        let rules = match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let text = resp.text().await.map_err(transient)?;
                RobotsRules::parse(&text, &self.config.user_agent)
            }
            Ok(resp) if resp.status().as_u16() == 429 || resp.status().is_server_error() => {
                return Err(PipelineError::transient(format!(
                    "robots.txt at {} returned {}",
                    robots_url,
                    resp.status()
                )));
            }
            // Missing or forbidden robots.txt places no restriction.
            Ok(_) => RobotsRules::allow_all(),
            Err(e) => return Err(transient(e)),
        };

        let rules = Arc::new(rules);
        self.robots.lock().await.insert(origin, rules.clone());
        Ok(rules)
    }
}

fn transient(e: reqwest::Error) -> PipelineError {
    PipelineError::transient(e.to_string())
}

/// Read at most `limit` bytes of the body, chunk by chunk.
async fn read_limited(mut response: reqwest::Response, limit: usize) -> Result<Vec<u8>, PipelineError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(transient)? {
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            debug!(url = %response.url(), limit, "body truncated");
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, PipelineError> {
        let parsed =
            Url::parse(url).map_err(|e| PipelineError::invalid(format!("bad url '{}': {}", url, e)))?;

        if self.config.respect_robots {
            let rules = self.robots_for(&parsed).await?;
            if !rules.is_allowed(parsed.path()) {
                return Err(PipelineError::FetchDenied {
                    url: url.to_string(),
                    reason: "disallowed by robots.txt".to_string(),
                });
            }
        }

        let response = self.client.get(parsed).send().await.map_err(transient)?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            warn!(url, %status, "retryable HTTP status");
            return Err(PipelineError::transient(format!("HTTP {} for {}", status, url)));
        }
        if !status.is_success() {
            return Err(PipelineError::Terminal(format!("HTTP {} for {}", status, url)));
        }

        let final_url = response.url().to_string();
        let body = read_limited(response, self.config.max_body_bytes).await?;
        let html = String::from_utf8_lossy(&body);
        Ok(html_to_page(&final_url, &html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
User-agent: *
Disallow: /private/
Allow: /private/public-report.pdf
Disallow: /*.json$

User-agent: ecost
Disallow: /no-bots/
";

    #[test]
    fn specific_group_replaces_wildcard() {
        let rules = RobotsRules::parse(ROBOTS, "ecost/0.1");
        assert!(!rules.is_allowed("/no-bots/page"));
        assert!(rules.is_allowed("/private/data"));
    }

    #[test]
    fn wildcard_group_with_longest_match() {
        let rules = RobotsRules::parse(ROBOTS, "otherbot/1.0");
        assert!(!rules.is_allowed("/private/data"));
        assert!(rules.is_allowed("/private/public-report.pdf"));
        assert!(!rules.is_allowed("/api/prices.json"));
        assert!(rules.is_allowed("/api/prices.json?x=1"));
        assert!(rules.is_allowed("/"));
    }

    #[test]
    fn empty_disallow_allows_everything() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow:\n", "ecost");
        assert!(rules.is_allowed("/anything"));
    }

    #[test]
    fn consecutive_user_agents_share_a_group() {
        let rules = RobotsRules::parse("User-agent: a\nUser-agent: *\nDisallow: /x\n", "ecost");
        assert!(!rules.is_allowed("/x/y"));
    }

    #[test]
    fn html_is_reduced_to_text() {
        let html = r#"<html><head><title>Powerwall 3 &amp; Gateway</title>
            <meta property="article:published_time" content="2024-03-01T00:00:00Z">
            <style>.x{}</style></head>
            <body><h1>Specs</h1><p>Energy capacity: 13.5 kWh</p><script>var a=1;</script></body></html>"#;
        let page = html_to_page("https://tesla.com/powerwall", html);
        assert_eq!(page.title.as_deref(), Some("Powerwall 3 & Gateway"));
        assert!(page.published_at.is_some());
        assert_eq!(page.body, "Specs\nEnergy capacity: 13.5 kWh");
    }

    #[test]
    fn entities_and_comments_are_resolved() {
        let html = "<p>Installed cost: &#36;1,000/kW &mdash; it&#8217;s cheap</p>\
                    <!-- price: $9999/kW --><p>Fixed O&amp;M &#x24;20/kW-yr</p>";
        let page = html_to_page("https://a.example/", html);
        assert_eq!(
            page.body,
            "Installed cost: $1,000/kW \u{2014} it\u{2019}s cheap\nFixed O&M $20/kW-yr"
        );
        assert!(page.title.is_none());
    }

    #[test]
    fn inline_markup_stays_on_one_line() {
        let page = html_to_page(
            "https://a.example/",
            "<div>Capacity <b>13.5</b> kWh<br>Power <span>5 kW</span></div>",
        );
        assert_eq!(page.body, "Capacity 13.5 kWh\nPower 5 kW");
    }

    #[tokio::test]
    async fn static_search_rejects_empty_query() {
        let search = StaticSeedSearch::new(vec!["https://a.example/".into()]);
        assert!(search.search("  ").await.is_err());
        assert_eq!(search.search("solar").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_body_is_cut_at_the_limit() {
        let html = format!("<p>{}</p>", "a".repeat(200_000));
        let app = axum::Router::new().route(
            "/big",
            axum::routing::get(move || async move { axum::response::Html(html) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let fetcher = HttpFetcher::new(&FetchConfig {
            respect_robots: false,
            max_body_bytes: 64,
            ..FetchConfig::default()
        })
        .unwrap();
        let page = fetcher.fetch(&format!("http://{}/big", addr)).await.unwrap();
        assert!(!page.body.is_empty());
        assert!(page.body.len() <= 64, "got {} bytes", page.body.len());
    }
}
