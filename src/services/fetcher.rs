// src/services/fetcher.rs

//! Page fetch executor.
//!
//! One timed GET per call. Any HTTP status is returned as content; only
//! transport failures surface as errors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;

use crate::error::Result;

/// A fetched page, body capped at the fetcher's byte limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub truncated: bool,
}

/// Issues a single GET for a URL.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage>;
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    client: Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(client: Client, max_body_bytes: usize) -> Self {
        Self {
            client,
            max_body_bytes,
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedPage> {
        let mut response = self.client.get(url).timeout(timeout).send().await?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await? {
            let room = self.max_body_bytes - bytes.len();
            if chunk.len() >= room {
                bytes.extend_from_slice(&chunk[..room]);
                truncated = chunk.len() > room;
                if !truncated {
                    truncated = response.chunk().await?.is_some_and(|c| !c.is_empty());
                }
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        if truncated {
            log::debug!("Body of {} truncated at {} bytes", url, self.max_body_bytes);
        }

        Ok(FetchedPage {
            url: final_url,
            status,
            content_type,
            body: decode_body(bytes),
            truncated,
        })
    }
}

/// Decode as UTF-8, dropping a multi-byte sequence split by the size cap.
fn decode_body(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            let cut_tail = e.utf8_error().error_len().is_none();
            let valid = e.utf8_error().valid_up_to();
            let bytes = e.into_bytes();
            let keep = if cut_tail { &bytes[..valid] } else { &bytes[..] };
            String::from_utf8_lossy(keep).into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one connection: read the request head, then reply with `response`.
    /// With `stall` set, hold the connection open without replying.
    async fn serve_once(response: Vec<u8>, stall: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            if stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
                return;
            }
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/race")
    }

    fn http_response(status: &str, body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn body_is_capped() {
        let body = format!("<p>2026-03-07</p>{}", "x".repeat(8 * 1024));
        let url = serve_once(http_response("200 OK", &body), false).await;
        let fetcher = HttpFetcher::new(Client::new(), 1024);

        let page = fetcher.fetch(&url, Duration::from_secs(5)).await.unwrap();
        assert!(page.truncated);
        assert!(page.body.len() <= 1024);
        assert!(page.body.starts_with("<p>2026-03-07</p>"));
    }

    #[tokio::test]
    async fn small_body_is_not_marked_truncated() {
        let url = serve_once(http_response("200 OK", "<p>ok</p>"), false).await;
        let fetcher = HttpFetcher::new(Client::new(), 1024);

        let page = fetcher.fetch(&url, Duration::from_secs(5)).await.unwrap();
        assert!(!page.truncated);
        assert_eq!(page.body, "<p>ok</p>");
        assert_eq!(page.content_type.as_deref(), Some("text/html; charset=utf-8"));
    }

    #[tokio::test]
    async fn error_status_is_content() {
        let url = serve_once(
            http_response("503 Service Unavailable", "<p>2026-03-07</p>"),
            false,
        )
        .await;
        let fetcher = HttpFetcher::new(Client::new(), 1024);

        let page = fetcher.fetch(&url, Duration::from_secs(5)).await.unwrap();
        assert_eq!(page.status, 503);
        assert_eq!(page.body, "<p>2026-03-07</p>");
    }

    #[tokio::test]
    async fn stalled_server_times_out_as_retryable() {
        let url = serve_once(Vec::new(), true).await;
        let fetcher = HttpFetcher::new(Client::new(), 1024);

        let err = fetcher
            .fetch(&url, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[test]
    fn decode_drops_split_multibyte_tail() {
        let mut bytes = "2026年".as_bytes().to_vec();
        bytes.extend_from_slice(&"月".as_bytes()[..2]);
        assert_eq!(decode_body(bytes), "2026年");
    }

    #[test]
    fn decode_replaces_invalid_bytes_elsewhere() {
        let bytes = vec![b'a', 0xff, b'b'];
        assert_eq!(decode_body(bytes), "a\u{fffd}b");
    }

    #[test]
    fn decode_passes_valid_text_through() {
        assert_eq!(decode_body(b"<html></html>".to_vec()), "<html></html>");
    }
}
