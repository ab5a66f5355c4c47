use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use url::Url;

use crate::error::{Error, Result};
use crate::fetch::report::{RunReportRequest, RunReportResponse};

pub const DEFAULT_API_BASE_URL: &str = "https://analyticsdata.googleapis.com";

/// Pre-authenticated handle to the Google Analytics Data API.
///
/// The bearer token is supplied by the caller and injected into every
/// request; this client never acquires or refreshes credentials.
#[derive(Clone)]
pub struct AnalyticsClient {
    http: Client,
    report_url: Url,
    property_id: String,
    timeout: Duration,
}

impl std::fmt::Debug for AnalyticsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsClient")
            .field("report_url", &self.report_url.as_str())
            .field("property_id", &self.property_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AnalyticsClient {
    pub fn new(
        base_url: &str,
        property_id: &str,
        access_token: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let report_url = report_url(base_url, property_id)?;

        if access_token.trim().is_empty() {
            return Err(Error::Config("analytics access token is empty".into()));
        }
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", access_token.trim()))
            .map_err(|e| Error::Config(format!("Invalid access token: {e}")))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(format!("analyticsdw/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;

        log::debug!("Created analytics client for {report_url}");
        Ok(Self {
            http,
            report_url,
            property_id: property_id.to_string(),
            timeout,
        })
    }

    pub fn property_id(&self) -> &str {
        &self.property_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One `runReport` call. Rate limiting is reported as
    /// `UpstreamRateLimited { attempts: 1, .. }` and left to the caller to
    /// retry.
    pub async fn run_report(&self, request: &RunReportRequest) -> Result<RunReportResponse> {
        let response = self
            .http
            .post(self.report_url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if let Some(err) = classify_status(status, retry_after, &body) {
            return Err(err);
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::UpstreamMalformedResponse(format!("invalid report body: {e}")))
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::UpstreamTimeout(self.timeout)
        } else if e.is_decode() {
            Error::UpstreamMalformedResponse(e.to_string())
        } else {
            Error::UpstreamUnavailable(e.to_string())
        }
    }
}

/// `{base}/v1beta/properties/{id}:runReport`.
pub fn report_url(base_url: &str, property_id: &str) -> Result<Url> {
    if property_id.is_empty() || !property_id.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::Config(format!(
            "property id must be numeric, got {property_id:?}"
        )));
    }

    let mut base =
        Url::parse(base_url).map_err(|e| Error::Config(format!("Invalid base URL: {e}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(&format!("v1beta/properties/{property_id}:runReport"))
        .map_err(|e| Error::Config(format!("Invalid base URL: {e}")))
}

/// Map a non-success HTTP status to the error it represents.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    let detail = upstream_message(body).unwrap_or_else(|| truncate(body, 200));
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => Error::UpstreamRateLimited {
            attempts: 1,
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::UpstreamUnavailable(format!("access denied ({status}): {detail}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            Error::UpstreamUnavailable(format!("upstream timed out ({status}): {detail}"))
        }
        s if s.is_server_error() => {
            Error::UpstreamUnavailable(format!("server error ({status}): {detail}"))
        }
        _ => Error::UpstreamUnavailable(format!("request rejected ({status}): {detail}")),
    })
}

/// `Retry-After` given in seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Google APIs wrap failures as `{"error": {"message": ...}}`.
fn upstream_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["error"]["message"].as_str().map(str::to_string)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::report::ReportGroup;
    use crate::fetch::stub_server::{report_page, serve};
    use crate::window::DateWindow;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_report_url() {
        let url = report_url(DEFAULT_API_BASE_URL, "123456").unwrap();
        assert_eq!(
            url.as_str(),
            "https://analyticsdata.googleapis.com/v1beta/properties/123456:runReport"
        );

        let proxied = report_url("http://localhost:8080/ga", "1").unwrap();
        assert_eq!(proxied.as_str(), "http://localhost:8080/ga/v1beta/properties/1:runReport");
    }

    #[test]
    fn test_report_url_rejects_bad_input() {
        assert!(matches!(report_url(DEFAULT_API_BASE_URL, ""), Err(Error::Config(_))));
        assert!(matches!(
            report_url(DEFAULT_API_BASE_URL, "12/../x"),
            Err(Error::Config(_))
        ));
        assert!(matches!(report_url("not a url", "1"), Err(Error::Config(_))));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK, None, "{}").is_none());

        let limited = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(30)),
            "",
        );
        assert!(matches!(
            limited,
            Some(Error::UpstreamRateLimited { attempts: 1, retry_after: Some(d) }) if d == Duration::from_secs(30)
        ));

        let body = r#"{"error": {"code": 403, "message": "User does not have sufficient permissions", "status": "PERMISSION_DENIED"}}"#;
        match classify_status(StatusCode::FORBIDDEN, None, body) {
            Some(Error::UpstreamUnavailable(msg)) => {
                assert!(msg.contains("sufficient permissions"), "{msg}")
            }
            other => panic!("unexpected: {other:?}"),
        }

        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::BAD_REQUEST,
        ] {
            assert!(matches!(
                classify_status(status, None, "oops"),
                Some(Error::UpstreamUnavailable(_))
            ));
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(17)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_new_rejects_empty_token() {
        let err = AnalyticsClient::new(DEFAULT_API_BASE_URL, "1", "  ", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let client =
            AnalyticsClient::new(DEFAULT_API_BASE_URL, "1", "tok", Duration::from_secs(1)).unwrap();
        assert_eq!(client.property_id(), "1");
        assert!(!format!("{client:?}").contains("tok"));
    }

    fn one_day() -> DateWindow {
        let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        DateWindow::new(day, day).unwrap()
    }

    #[tokio::test]
    async fn test_run_report_posts_authorized_request() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let base_url = serve({
            let seen = Arc::clone(&seen);
            move |req| {
                seen.lock().unwrap().push(req.head.clone());
                (200, report_page(&req.json(), &["20250102"], 1))
            }
        })
        .await;

        let client = AnalyticsClient::new(&base_url, "123", "tok", Duration::from_secs(5)).unwrap();
        let request = ReportGroup::Engagement.request(&one_day(), 0);
        let page = client.run_report(&request).await.unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.total_rows(), 1);

        let heads = seen.lock().unwrap();
        assert_eq!(heads.len(), 1);
        assert!(heads[0].starts_with("post /v1beta/properties/123:runreport "), "{}", heads[0]);
        assert!(heads[0].contains("authorization: bearer tok\r\n"), "{}", heads[0]);
    }

    #[tokio::test]
    async fn test_run_report_surfaces_upstream_errors() {
        let base_url = serve(|req| {
            if req.head.contains("/properties/403:") {
                (403, r#"{"error": {"code": 403, "message": "User does not have sufficient permissions"}}"#.to_string())
            } else if req.head.contains("/properties/429:") {
                (429, "{}".to_string())
            } else {
                (200, "<html>not json</html>".to_string())
            }
        })
        .await;
        let request = ReportGroup::Core.request(&one_day(), 0);
        let client = |property: &str| AnalyticsClient::new(&base_url, property, "tok", Duration::from_secs(5)).unwrap();

        match client("403").run_report(&request).await {
            Err(Error::UpstreamUnavailable(msg)) => assert!(msg.contains("sufficient permissions"), "{msg}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            client("429").run_report(&request).await,
            Err(Error::UpstreamRateLimited { attempts: 1, retry_after: Some(d) }) if d == Duration::ZERO
        ));
        assert!(matches!(
            client("200").run_report(&request).await,
            Err(Error::UpstreamMalformedResponse(_))
        ));
    }
}
