//! Minimal HTTP/1.1 server for exercising the analytics client over a real
//! socket. Each request gets one response and the connection is closed.

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One request as seen by the server. `head` is lowercased.
pub struct StubRequest {
    pub head: String,
    pub body: String,
}

impl StubRequest {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

type Responder = dyn Fn(&StubRequest) -> (u16, String) + Send + Sync;

/// Serve on an ephemeral port until the test ends. Returns the base URL.
/// A 429 response carries `Retry-After: 0`.
pub async fn serve<F>(respond: F) -> String
where
    F: Fn(&StubRequest) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond: Arc<Responder> = Arc::new(respond);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let respond = Arc::clone(&respond);
            tokio::spawn(async move { handle(stream, respond.as_ref()).await });
        }
    });
    format!("http://{addr}")
}

async fn handle(mut stream: TcpStream, respond: &Responder) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let body_start = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..body_start]).to_ascii_lowercase();
    let length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    while buf.len() < body_start + length {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request = StubRequest {
        head,
        body: String::from_utf8_lossy(&buf[body_start..]).into_owned(),
    };
    let (status, payload) = respond(&request);

    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    let retry_after = if status == 429 { "Retry-After: 0\r\n" } else { "" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         {retry_after}\
         Connection: close\r\n\r\n\
         {payload}",
        payload.len()
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    let _ = stream.shutdown().await;
}

/// A `runReport` page answering `request`, one row per date. Extra
/// dimensions get the value `Direct`; every metric value is `1`.
pub fn report_page(request: &Value, dates: &[&str], row_count: u64) -> String {
    let names = |field: &str| -> Vec<String> {
        request[field]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap().to_string())
            .collect()
    };
    let dimensions = names("dimensions");
    let metrics = names("metrics");

    let rows: Vec<Value> = dates
        .iter()
        .map(|date| {
            let dimension_values: Vec<Value> = dimensions
                .iter()
                .map(|d| {
                    let value = if d == "date" { *date } else { "Direct" };
                    json!({ "value": value })
                })
                .collect();
            let metric_values: Vec<Value> = metrics.iter().map(|_| json!({ "value": "1" })).collect();
            json!({ "dimensionValues": dimension_values, "metricValues": metric_values })
        })
        .collect();

    json!({
        "dimensionHeaders": dimensions.iter().map(|n| json!({ "name": n })).collect::<Vec<_>>(),
        "metricHeaders": metrics.iter().map(|n| json!({ "name": n })).collect::<Vec<_>>(),
        "rows": rows,
        "rowCount": row_count,
    })
    .to_string()
}
