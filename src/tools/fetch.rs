//! 网页抓取工具：域名白名单、超时、结果长度上限
//!
//! HTML 响应用 html2text 转为可读文本；超过 max_result_chars 截断并追加 ...[truncated]。
//! 白名单为空时允许任意 http(s) 地址。

use std::collections::HashSet;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde_json::Value;

use crate::tools::registry::{ParamSpec, Tool};

pub struct FetchTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

/// html2text 失败时的回退：去标签、压缩空白
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start().to_lowercase();
    s.starts_with("<!doctype") || s.starts_with("<html") || (s.contains("</") && s.contains("<head"))
}

fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?.split(':').next()?;
    (!host.is_empty()).then(|| host.to_lowercase())
}

impl FetchTool {
    pub fn new(allowed_domains: Vec<String>, timeout_secs: u64, max_result_chars: usize) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
            .user_agent(concat!("hive/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|d| d.to_lowercase()).collect(),
            max_result_chars,
        }
    }

    fn check_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| format!("Invalid URL: {}", url))?;
        if self.allowed_domains.is_empty()
            || self.allowed_domains.contains(&domain)
            || self
                .allowed_domains
                .iter()
                .any(|d| domain.ends_with(&format!(".{}", d)))
        {
            Ok(())
        } else {
            Err(format!("Domain not in allowlist: {}", domain))
        }
    }

    fn limit(&self, body: String) -> String {
        if body.chars().count() > self.max_result_chars {
            body.chars().take(self.max_result_chars).collect::<String>() + "\n...[truncated]"
        } else {
            body
        }
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable text."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required("url", "string", "http(s) URL to fetch")]
    }

    fn return_description(&self) -> &str {
        "Page text, truncated to the configured length"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim();
        self.check_allowed(url)?;
        tracing::info!(url = %url, "fetch_url");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {}", e))?;
        let body = body.trim_start_matches('\u{FEFF}').to_string();

        let text = if looks_like_html(&body) {
            match from_read(body.as_bytes(), 120) {
                Ok(t) if !t.trim().is_empty() => t,
                _ => strip_html_tags(&body),
            }
        } else {
            body
        };
        Ok(self.limit(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://en.wikipedia.org/wiki/Rust"), Some("en.wikipedia.org".into()));
        assert_eq!(extract_domain("http://localhost:8080/x"), Some("localhost".into()));
        assert_eq!(extract_domain("ftp://x"), None);
    }

    #[test]
    fn test_allowlist_accepts_subdomains() {
        let tool = FetchTool::new(vec!["wikipedia.org".into()], 5, 100);
        assert!(tool.check_allowed("https://en.wikipedia.org/wiki/Rust").is_ok());
        assert!(tool.check_allowed("https://evil.com").is_err());

        let open = FetchTool::new(vec![], 5, 100);
        assert!(open.check_allowed("https://example.com").is_ok());
    }

    #[test]
    fn test_limit_and_strip() {
        let tool = FetchTool::new(vec![], 5, 5);
        assert_eq!(tool.limit("abcdefgh".into()), "abcde\n...[truncated]");
        assert_eq!(strip_html_tags("<p>Hello</p><b>world</b>"), "Hello world");
        assert!(looks_like_html("<!DOCTYPE html><html></html>"));
    }
}
