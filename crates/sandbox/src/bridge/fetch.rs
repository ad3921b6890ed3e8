//! Network collaborator consumed by the XHR bridge

use async_trait::async_trait;
use url::Url;

use crate::error::BridgeError;

/// Response of a host-side fetch
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl Fetched {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// A script-initiated request, already resolved against the page
#[derive(Debug, Clone)]
pub struct XhrRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Fetches URLs on behalf of the page
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// URL of the page being scripted
    fn origin(&self) -> &Url;

    /// Resolve a page-relative reference
    fn linked_url(&self, relative: &str) -> Result<Url, BridgeError> {
        Ok(self.origin().join(relative)?)
    }

    async fn get(&self, url: &Url) -> Result<Fetched, BridgeError>;

    /// Full request; only GET is supported unless overridden
    async fn request(&self, request: &XhrRequest) -> Result<Fetched, BridgeError> {
        if request.method.eq_ignore_ascii_case("GET") {
            self.get(&request.url).await
        } else {
            Err(BridgeError::Unsupported(format!(
                "{} {}",
                request.method, request.url
            )))
        }
    }
}

/// True if `target` may be requested from a page at `origin`
pub fn same_origin(origin: &Url, target: &Url) -> bool {
    origin.host_str() == target.host_str()
        && origin.port_or_known_default() == target.port_or_known_default()
}
