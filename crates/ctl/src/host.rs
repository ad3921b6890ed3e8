//! Host-side collaborators handed to the sandbox

use async_trait::async_trait;
use dom::DomService;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use sandbox::{BridgeError, Fetched, Fetcher, StyleProvider, XhrRequest};
use std::time::Duration;
use url::Url;

/// Fetches over HTTP(S) relative to the page URL
pub struct HttpFetcher {
    client: reqwest::Client,
    origin: Url,
}

impl HttpFetcher {
    pub fn new(origin: Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("script-sandbox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, origin })
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        headers: &[(String, String)],
        body: Option<&str>,
    ) -> Result<Fetched, BridgeError> {
        let mut builder = self.client.request(method, url.clone());
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body.to_string());
        }

        let response = builder
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| BridgeError::Fetch(err.to_string()))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| BridgeError::Fetch(err.to_string()))?;

        tracing::debug!(url = %url, len = bytes.len(), "Fetched");
        Ok(Fetched {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn origin(&self) -> &Url {
        &self.origin
    }

    async fn get(&self, url: &Url) -> Result<Fetched, BridgeError> {
        self.send(Method::GET, url, &[], None).await
    }

    async fn request(&self, request: &XhrRequest) -> Result<Fetched, BridgeError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| BridgeError::Unsupported(format!("method {:?}", request.method)))?;
        self.send(method, &request.url, &request.headers, request.body.as_deref())
            .await
    }
}

/// Answers computed-style queries from the inline `style` attributes of the
/// page as it was loaded. Script edits are not visible here.
pub struct InlineStyleProvider {
    dom: Mutex<DomService>,
}

impl InlineStyleProvider {
    pub fn new(dom: DomService) -> Self {
        Self {
            dom: Mutex::new(dom),
        }
    }
}

impl StyleProvider for InlineStyleProvider {
    fn query(&self, selector: &str, property: &str) -> Result<String, BridgeError> {
        let mut dom = self.dom.lock();
        let matches = dom
            .select(selector)
            .map_err(|err| BridgeError::Style(err.to_string()))?;

        match matches.as_slice() {
            [node] => dom
                .style_property(*node, property)
                .map(Option::unwrap_or_default)
                .map_err(|err| BridgeError::Style(err.to_string())),
            [] => Err(BridgeError::Style(format!("no element matches {}", selector))),
            more => Err(BridgeError::Style(format!(
                "{} elements match {}",
                more.len(),
                selector
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body>
<div id="box" style="display: none; COLOR: Red">a</div>
<p class="x">one</p><p class="x">two</p>
</body></html>"#;

    #[test]
    fn test_inline_styles() {
        let styles = InlineStyleProvider::new(DomService::from_html(PAGE).unwrap());
        assert_eq!(styles.query("#box", "display").unwrap(), "none");
        assert_eq!(styles.query("#box", "margin").unwrap(), "");
    }

    #[test]
    fn test_ambiguous_or_missing_selector() {
        let styles = InlineStyleProvider::new(DomService::from_html(PAGE).unwrap());
        assert!(matches!(
            styles.query("p.x", "display"),
            Err(BridgeError::Style(_))
        ));
        assert!(styles.query("#missing", "display").is_err());
        assert!(styles.query("[[", "display").is_err());
    }

    #[test]
    fn test_fetcher_resolves_against_page() {
        let fetcher = HttpFetcher::new(
            Url::parse("https://example.com/a/page.html").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            fetcher.linked_url("../data.json").unwrap().as_str(),
            "https://example.com/data.json"
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_method() {
        let fetcher = HttpFetcher::new(
            Url::parse("https://example.com/").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        let request = XhrRequest {
            method: "BAD METHOD".to_string(),
            url: Url::parse("https://example.com/x").unwrap(),
            headers: Vec::new(),
            body: None,
        };
        assert!(matches!(
            fetcher.request(&request).await,
            Err(BridgeError::Unsupported(_))
        ));
    }
}
