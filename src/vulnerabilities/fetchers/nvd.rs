//! This module implements a page fetcher which downloads
//! the CVEs from the NVD.
//! https://nvd.nist.gov/developers/vulnerabilities

use log::{debug, error, trace};
use reqwest::blocking::{Client, Request};

use crate::config::Config;
use crate::models::{Page, QueryWindow};
use crate::vulnerabilities::fetchers::{FetchError, PageFetcher};

/// The header carrying the API key.
const API_KEY_HEADER: &str = "apiKey";

/// This structs represents the NVD vulnerabilities fetcher.
pub struct NVDFetcher {
    /// The HTTP client, reused between pages.
    client: Client,
    /// The URL of the CVE endpoint.
    api_url: String,
    /// The key sent with each request.
    api_key: String,
}

impl NVDFetcher {
    /// Creates a new NVDFetcher.
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        trace!("Running NVDFetcher::new()");
        let client = Client::builder()
            .user_agent(concat!("nvd-updater/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network(format!("unable to create a HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    // Example: https://services.nvd.nist.gov/rest/json/cves/2.0?noRejected&resultsPerPage=200&startIndex=400&lastModStartDate=2024-03-01T08:15:07Z&lastModEndDate=2024-03-02T08:15:07Z
    /// Builds the request for one page.
    pub fn build_request(
        &self,
        window: &QueryWindow,
        start_index: u64,
        page_size: u32,
    ) -> Result<Request, FetchError> {
        let mut params = vec![
            ("resultsPerPage", page_size.to_string()),
            ("startIndex", start_index.to_string()),
        ];
        params.extend(window.to_params());

        self.client
            .get(&self.api_url)
            .header(API_KEY_HEADER, &self.api_key)
            .query(&params)
            .build()
            .map_err(|e| FetchError::Network(format!("unable to build the request: {}", e)))
    }
}

/// Reads the page out of a response.
pub fn parse_page(status: u16, body: &str) -> Result<Page, FetchError> {
    if !(200..300).contains(&status) {
        return Err(FetchError::Status(status));
    }
    serde_json::from_str(body).map_err(|e| FetchError::Payload(e.to_string()))
}

impl PageFetcher for NVDFetcher {
    /// Fetches one page of CVEs from the NVD.
    fn fetch_page(
        &self,
        window: &QueryWindow,
        start_index: u64,
        page_size: u32,
    ) -> Result<Page, FetchError> {
        trace!("Running NVDFetcher::fetch_page()");
        let request = self.build_request(window, start_index, page_size)?;
        debug!("Sending request to {}", request.url());

        let response = self.client.execute(request).map_err(|e| {
            error!("Error while communicating with NVD. {:?}", e);
            FetchError::Network(e.to_string())
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| FetchError::Network(format!("unable to read the body: {}", e)))?;
        parse_page(status, &body).inspect_err(|e| error!("Page rejected. {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Checkpoint;

    fn fetcher() -> NVDFetcher {
        NVDFetcher::new(&Config::new("secret-key")).unwrap()
    }

    #[test]
    fn request_carries_window_and_offset() {
        let start = Checkpoint::parse("2024-03-01T08:15:07Z");
        let end = Checkpoint::parse("2024-03-02T08:15:07Z").unwrap();
        let request = fetcher()
            .build_request(&QueryWindow::new(start, end), 400, 200)
            .unwrap();

        let url = request.url();
        assert_eq!("services.nvd.nist.gov", url.host_str().unwrap());
        assert_eq!("/rest/json/cves/2.0", url.path());
        let query = url.query().unwrap();
        assert!(query.starts_with("noRejected&"));
        assert!(query.contains("resultsPerPage=200"));
        assert!(query.contains("startIndex=400"));
        assert!(query.contains("lastModStartDate=2024-03-01T08%3A15%3A07Z"));
        assert!(query.contains("lastModEndDate=2024-03-02T08%3A15%3A07Z"));
        assert_eq!(
            "secret-key",
            request.headers()["apiKey"].to_str().unwrap()
        );
    }

    #[test]
    fn first_run_has_no_lower_bound() {
        let end = Checkpoint::parse("2024-03-02T08:15:07Z").unwrap();
        let request = fetcher()
            .build_request(&QueryWindow::new(None, end), 0, 200)
            .unwrap();
        let query = request.url().query().unwrap();
        assert!(!query.contains("lastModStartDate"));
        assert!(query.contains("lastModEndDate"));
        assert!(query.contains("startIndex=0"));
    }

    #[test]
    fn non_success_status_is_an_error() {
        assert!(matches!(
            parse_page(503, "Service Unavailable"),
            Err(FetchError::Status(503))
        ));
        assert!(matches!(parse_page(404, ""), Err(FetchError::Status(404))));
    }

    #[test]
    fn invalid_body_is_a_payload_error() {
        assert!(matches!(
            parse_page(200, "<html>maintenance</html>"),
            Err(FetchError::Payload(_))
        ));
    }

    #[test]
    fn valid_body_is_parsed() {
        let body = r#"{"resultsPerPage":1,"startIndex":0,"totalResults":1,"format":"NVD_CVE","version":"2.0","vulnerabilities":[{"cve":{"id":"CVE-2024-0002","lastModified":"2024-03-01T10:00:00.000"}}]}"#;
        let page = parse_page(200, body).unwrap();
        assert_eq!(1, page.total_results);
        assert_eq!(Some("CVE-2024-0002"), page.records[0].id());
    }
}
