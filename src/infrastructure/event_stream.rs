// HTTP event stream transport - Chunked body split into record lines
use crate::application::subscription::{EventTransport, LineStream, StreamError};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::Stream;

#[derive(Debug, Clone)]
pub struct HttpEventTransport {
    url: String,
    client: reqwest::Client,
}

impl HttpEventTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn connect(&self, source_id: &str, variables: &[String]) -> Result<LineStream, StreamError> {
        let url = format!(
            "{}/subscribe/{}?variables={}",
            self.url,
            urlencoding::encode(source_id),
            urlencoding::encode(&variables.join(","))
        );

        let response = self
            .client
            .get(&url)
            .header("Accept", "text/plain")
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Connect(format!("status {}: {}", status, body.trim())));
        }

        tracing::debug!("Event stream open at {}", url);
        Ok(split_lines(response.bytes_stream()).boxed())
    }

    async fn unsubscribe(&self, source_id: &str) -> Result<(), StreamError> {
        let url = format!("{}/unsubscribe/{}", self.url, urlencoding::encode(source_id));
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| StreamError::Read(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StreamError::Read(format!("unsubscribe answered {}", response.status())));
        }
        Ok(())
    }
}

/// Re-chunk a byte stream into newline-terminated lines. A trailing partial
/// line is emitted when the body ends.
pub fn split_lines<S, E>(body: S) -> impl Stream<Item = Result<String, StreamError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut pending = BytesMut::new();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => pending.extend_from_slice(&chunk),
                Err(e) => {
                    yield Err(StreamError::Read(e.to_string()));
                    return;
                }
            }

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line = pending.split_to(pos);
                pending.advance(1);
                yield Ok(decode(&line));
            }
        }

        if !pending.is_empty() {
            yield Ok(decode(&pending));
        }
    }
}

fn decode(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim_end_matches('\r').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_lines_across_chunks() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"ip 1 1 5 V 1.5 kA\nHEART")),
            Ok(Bytes::from_static(b"BEAT\r\nne 1 1")),
            Ok(Bytes::from_static(b" 6 V 2 m-3")),
        ];

        let lines: Vec<_> = split_lines(futures::stream::iter(chunks))
            .map(|l| l.unwrap())
            .collect()
            .await;

        assert_eq!(lines, vec!["ip 1 1 5 V 1.5 kA", "HEARTBEAT", "ne 1 1 6 V 2 m-3"]);
    }

    #[tokio::test]
    async fn test_split_lines_stops_on_error() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"a\n")),
            Err("reset by peer".to_string()),
            Ok(Bytes::from_static(b"b\n")),
        ];

        let items: Vec<_> = split_lines(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(StreamError::Read(m)) if m == "reset by peer"));
    }
}
