/// Enrichment collaborators used by the lead processor.
///
/// 1. Fetch the lead's website and reduce it to plain text
/// 2. Pull email addresses out of the text
/// 3. Ask an LLM (when configured) who owns the business
/// 4. Guess likely owner addresses on the site's domain
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{Enrichment, LeadRecord};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::OnceLock;

/// Upper bound on page text handed to the analyzer.
pub const MAX_PAGE_CHARS: usize = 12_000;

/// Builds the enrichment part of a processed lead.
///
/// Errors are contained by the caller and recorded on the lead; they never
/// abort a batch.
pub trait LeadEnricher: Send + Sync {
    fn enrich(&self, lead: &LeadRecord) -> impl Future<Output = anyhow::Result<Enrichment>> + Send;
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("bad pattern {}: {}", pattern, e)))
}

fn email_regex() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    regex(&CELL, r"(?i)[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}")
}

/// Prefixes the scheme when a sheet only carries a bare domain.
pub fn normalize_url(website: &str) -> String {
    let website = website.trim();
    if website.starts_with("http://") || website.starts_with("https://") {
        website.to_string()
    } else {
        format!("https://{}", website)
    }
}

/// Host of the website without a leading `www.`.
pub fn website_domain(website: &str) -> Option<String> {
    let url = url::Url::parse(&normalize_url(website)).ok()?;
    let host = url.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Strips scripts, styles and markup and collapses whitespace.
pub fn page_text(html: &str) -> String {
    static BLOCKS: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();

    let without_blocks = regex(&BLOCKS, r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>")
        .replace_all(html, " ");
    let without_tags = regex(&TAGS, r"(?s)<[^>]+>").replace_all(&without_blocks, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&#64;", "@")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    let collapsed = regex(&SPACE, r"\s+").replace_all(&decoded, " ");

    collapsed.trim().chars().take(MAX_PAGE_CHARS).collect()
}

/// Basic shape check plus rejection of placeholder and asset-name addresses.
pub fn is_valid_email(email: &str) -> bool {
    static FULL: OnceLock<Regex> = OnceLock::new();
    if email.len() < 6 || !email.contains('@') {
        return false;
    }
    let placeholder_domains = ["example.com", "domain.com", "yourdomain.com", "email.com"];
    let asset_suffixes = [".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp"];
    let lower = email.to_lowercase();
    if placeholder_domains.iter().any(|d| lower.ends_with(&format!("@{}", d)))
        || asset_suffixes.iter().any(|s| lower.ends_with(s))
    {
        return false;
    }
    regex(
        &FULL,
        r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$",
    )
    .is_match(&lower)
}

/// Lowercases, strips `mailto:` and trailing punctuation, and validates.
pub fn clean_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("mailto:")
        .or_else(|| trimmed.strip_prefix("MAILTO:"))
        .unwrap_or(trimmed);
    let cleaned = without_scheme
        .trim_end_matches(['.', ',', ';', ':', ')', '>'])
        .to_lowercase();
    is_valid_email(&cleaned).then_some(cleaned)
}

/// Every valid address in `text`, deduplicated and sorted.
pub fn extract_emails(text: &str) -> Vec<String> {
    email_regex()
        .find_iter(text)
        .filter_map(|m| clean_email(m.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Targets of `mailto:` links in raw markup, cleaned and sorted.
pub fn mailto_emails(html: &str) -> Vec<String> {
    static MAILTO: OnceLock<Regex> = OnceLock::new();
    regex(&MAILTO, r#"(?i)mailto:([^"'?&<>\s]+)"#)
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .filter_map(|m| clean_email(m.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Common owner mailbox patterns on `domain`.
pub fn generate_potential_emails(domain: &str, owner_name: &str) -> Vec<String> {
    let parts: Vec<String> = owner_name
        .split_whitespace()
        .map(|p| {
            p.chars()
                .filter(|c| c.is_ascii_alphabetic())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|p| !p.is_empty())
        .collect();
    let domain = domain.trim().to_lowercase();
    if parts.is_empty() || domain.is_empty() {
        return Vec::new();
    }

    let first = &parts[0];
    let mut locals = vec![first.clone()];
    if parts.len() > 1 {
        let last = &parts[parts.len() - 1];
        let initial = &first[..1];
        locals.push(format!("{}.{}", first, last));
        locals.push(format!("{}{}", first, last));
        locals.push(format!("{}{}", initial, last));
        locals.push(format!("{}.{}", initial, last));
    }

    let mut seen = BTreeSet::new();
    locals
        .into_iter()
        .filter(|local| seen.insert(local.clone()))
        .map(|local| format!("{}@{}", local, domain))
        .collect()
}

/// What a scrape keeps of a page.
#[derive(Debug, Clone, Default)]
pub struct ScrapedPage {
    /// Visible text, at most [`MAX_PAGE_CHARS`] characters.
    pub text: String,
    /// Addresses in the text plus `mailto:` link targets.
    pub emails: Vec<String>,
}

/// Fetches a page and reduces it to text and email addresses.
#[derive(Clone)]
pub struct HttpScraper {
    client: Client,
}

impl HttpScraper {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .user_agent("Mozilla/5.0 (compatible; leadscout/0.1)")
            .build()
            .map_err(|e| AppError::ExternalApiError(format!("Failed to create scraper: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn scrape(&self, website: &str) -> anyhow::Result<ScrapedPage> {
        let url = normalize_url(website);
        tracing::debug!("Scraping {}", url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let html = response.text().await?;

        let text = page_text(&html);
        let emails = extract_emails(&text)
            .into_iter()
            .chain(mailto_emails(&html))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok(ScrapedPage { text, emails })
    }
}

/// Owner details an analyzer extracted from page text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerAnalysis {
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub owner_title: String,
    #[serde(default)]
    pub confidence: String,
    #[serde(default)]
    pub confidence_reasoning: String,
    #[serde(default)]
    pub key_facts: Vec<String>,
}

/// Chat-completions client asking for owner details as a JSON object.
#[derive(Clone)]
pub struct OpenAiAnalyzer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiAnalyzer {
    pub fn new(config: &Config, api_key: String) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| AppError::ExternalApiError(format!("Failed to create LLM client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.openai_model.clone(),
        })
    }

    pub async fn analyze(&self, company_name: &str, page_text: &str) -> anyhow::Result<OwnerAnalysis> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                {
                    "role": "system",
                    "content": "You identify the owner of a small business from its website text. \
                                Answer with a JSON object with keys owner_name, owner_title, \
                                confidence (high, medium, low or none), confidence_reasoning and \
                                key_facts (array of short strings). Use empty strings when unknown."
                },
                {
                    "role": "user",
                    "content": format!("Business: {}\n\nWebsite text:\n{}", company_name, page_text)
                }
            ]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("LLM returned status {}: {}", status, error_text);
        }

        let completion: serde_json::Value = response.json().await?;
        let content = completion["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("LLM response has no message content"))?;
        let analysis: OwnerAnalysis = serde_json::from_str(content)?;
        Ok(analysis)
    }
}

/// Scrape, extract emails, analyze, guess owner addresses.
pub struct WebsiteEnricher {
    scraper: HttpScraper,
    analyzer: Option<OpenAiAnalyzer>,
}

impl WebsiteEnricher {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let analyzer = match &config.openai_api_key {
            Some(key) => Some(OpenAiAnalyzer::new(config, key.clone())?),
            None => None,
        };
        Ok(Self {
            scraper: HttpScraper::new(config)?,
            analyzer,
        })
    }
}

impl LeadEnricher for WebsiteEnricher {
    async fn enrich(&self, lead: &LeadRecord) -> anyhow::Result<Enrichment> {
        let page = self.scraper.scrape(&lead.website).await?;
        let discovered_emails = page.emails;

        let analysis = match &self.analyzer {
            Some(analyzer) => analyzer.analyze(&lead.company_name, &page.text).await?,
            None => OwnerAnalysis {
                confidence: "none".to_string(),
                ..OwnerAnalysis::default()
            },
        };

        let potential_emails = match website_domain(&lead.website) {
            Some(domain) if !analysis.owner_name.trim().is_empty() => {
                generate_potential_emails(&domain, &analysis.owner_name)
            }
            _ => Vec::new(),
        };

        tracing::debug!(
            "Enriched {}: {} emails found, owner '{}'",
            lead.company_name,
            discovered_emails.len(),
            analysis.owner_name
        );

        Ok(Enrichment {
            owner_name: analysis.owner_name,
            owner_title: analysis.owner_title,
            confidence: analysis.confidence,
            confidence_reasoning: analysis.confidence_reasoning,
            discovered_emails,
            potential_emails,
            key_facts: analysis.key_facts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_strips_scheme_and_www() {
        assert_eq!(website_domain("www.Acme.com").as_deref(), Some("acme.com"));
        assert_eq!(
            website_domain("https://shop.acme.com/about").as_deref(),
            Some("shop.acme.com")
        );
        assert_eq!(website_domain(""), None);
    }

    #[test]
    fn page_text_drops_markup() {
        let html = r#"<html><head><style>p { color: red }</style>
            <script>var x = "hidden@acme.com";</script></head>
            <body><p>Call&nbsp;us</p><a href="mailto:Owner@Acme.com">Email</a></body></html>"#;
        let text = page_text(html);
        assert_eq!(text, "Call us Email");
    }

    #[test]
    fn mailto_links_survive_tag_stripping() {
        let html = r#"<p>Call us</p>
            <a href="mailto:Owner@Acme.com?subject=Quote">Write</a>
            <a href='MAILTO:sales@acme.com'>Sales</a>
            <a href="mailto:you@example.com">Placeholder</a>"#;
        assert!(extract_emails(&page_text(html)).is_empty());
        assert_eq!(
            mailto_emails(html),
            vec!["owner@acme.com".to_string(), "sales@acme.com".to_string()]
        );
    }

    #[test]
    fn extracts_and_cleans_emails() {
        let text = "Write to Sales@Acme.com, or info@acme.com. Logo: logo@2x.png \
                    Placeholder you@example.com and again sales@acme.com;";
        assert_eq!(
            extract_emails(text),
            vec!["info@acme.com".to_string(), "sales@acme.com".to_string()]
        );
        assert_eq!(
            clean_email(" mailto:Owner@Acme.com. ").as_deref(),
            Some("owner@acme.com")
        );
    }

    #[test]
    fn potential_emails_follow_common_patterns() {
        assert_eq!(
            generate_potential_emails("acme.com", "Jane Q. Doe"),
            vec![
                "jane@acme.com",
                "jane.doe@acme.com",
                "janedoe@acme.com",
                "jdoe@acme.com",
                "j.doe@acme.com",
            ]
        );
        assert_eq!(generate_potential_emails("acme.com", "Cher"), vec!["cher@acme.com"]);
        assert!(generate_potential_emails("acme.com", "  ").is_empty());
    }
}
