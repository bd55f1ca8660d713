use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client;
use tracing::debug;
use url::Url;

use crate::parse::count_pages;
use crate::traits::PageSource;
use crate::{Error, Result};

/// Fetches history pages over HTTP.
///
/// Pages are addressed by replacing the query of the history URL with `page=N`, so any
/// history page works as the base URL.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    // Client uses Arc so we can clone cheaply
    client: Client,
    base_url: Url,
    /// Page 1 as fetched for the page count, handed out by the next `fetch_page(1)`.
    first_page: Arc<Mutex<Option<String>>>,
}

impl HttpPageSource {
    /// `cookie` is sent verbatim with every request, for listings that need a logged-in
    /// session. A request that takes longer than `timeout` fails.
    pub fn new(base_url: &str, cookie: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        if let Some(cookie) = cookie {
            let mut value = HeaderValue::from_str(cookie)?;
            value.set_sensitive(true);
            headers.insert(header::COOKIE, value);
        }

        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            first_page: Arc::default(),
        })
    }

    pub fn page_url(&self, page: u32) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.query_pairs_mut().append_pair("page", &page.to_string());
        url
    }

    /// Requests a page and returns the HTML. Non-2xx responses are errors.
    async fn request_page_html(&self, page: u32) -> Result<String> {
        let res = self.client.get(self.page_url(page)).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                page,
                status: status.as_u16(),
            });
        }
        let html = res.text().await?;
        Ok(html)
    }

    fn first_page(&self) -> MutexGuard<'_, Option<String>> {
        self.first_page.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PageSource for HttpPageSource {
    /// Reads the pagination of the first page, and keeps the page for the first
    /// `fetch_page(1)`.
    async fn total_pages(&self) -> Result<u32> {
        let html = self.request_page_html(1).await?;
        let pages = count_pages(&html)?;
        *self.first_page() = Some(html);
        Ok(pages)
    }

    async fn fetch_page(&self, page: u32) -> Result<String> {
        let cached = if page == 1 { self.first_page().take() } else { None };
        if let Some(html) = cached {
            debug!("Reusing page 1 from the page count");
            return Ok(html);
        }
        self.request_page_html(page).await
    }
}
