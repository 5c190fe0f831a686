//! HTTP Store
//!
//! Talks to a ClickHouse-compatible SQL-over-HTTP endpoint. Rows travel as
//! `JSONEachRow`; timestamp columns are expected to be `DateTime` or
//! `DateTime64`.

use async_trait::async_trait;
use reqwest::{Client, Response};

use super::{qualified_table, quote_ident, ColdWriter, HotReader, RowBatch, TableStats};
use crate::config::{StoreConfig, TableConfig};
use crate::error::{Error, Result};
use crate::replication::Window;

/// Header ClickHouse uses to report what an INSERT actually wrote
const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

/// SQL-over-HTTP store adapter
pub struct HttpStore {
    client: Client,
    url: String,
    user: String,
    password: String,
    database: String,
    store: &'static str,
    batch_size: usize,
}

impl HttpStore {
    /// Build the client and check the endpoint answers
    pub async fn connect(store: &'static str, config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.query_timeout())
            .build()?;

        let this = Self {
            client,
            url: config.http_url(),
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            store,
            batch_size: usize::MAX,
        };

        match tokio::time::timeout(config.connect_timeout(), this.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    store: store.to_string(),
                    reason: format!("{}: {}", this.url, e),
                });
            }
            Err(_) => {
                return Err(Error::ConnectionTimeout {
                    store: store.to_string(),
                    secs: config.connect_timeout_secs,
                });
            }
        }

        tracing::debug!(store, url = %this.url, "Connected to HTTP store");
        Ok(this)
    }

    /// Limit rows per INSERT request
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn ping(&self) -> Result<()> {
        let body = self.execute("SELECT 1", None).await?.text().await?;
        if body.trim() != "1" {
            return Err(Error::Query {
                store: self.store.to_string(),
                reason: format!("unexpected ping response: {}", body.trim()),
            });
        }
        Ok(())
    }

    /// Run `query`, posting `data` as the request body when given
    async fn execute(&self, query: &str, data: Option<String>) -> Result<Response> {
        let request = self
            .client
            .post(&self.url)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .query(&[
                ("database", self.database.as_str()),
                ("output_format_json_quote_64bit_integers", "1"),
                ("output_format_json_quote_decimals", "1"),
                ("date_time_input_format", "best_effort"),
            ]);

        let request = match data {
            Some(body) => request.query(&[("query", query)]).body(body),
            None => request.body(query.to_string()),
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let reason = response.text().await.unwrap_or_default();
            return Err(Error::Query {
                store: self.store.to_string(),
                reason: format!("HTTP {}: {}", status, reason.trim()),
            });
        }
        Ok(response)
    }

    fn decode_lines(&self, body: &str) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    Error::Decode(format!("{} store returned malformed row: {}", self.store, e))
                })
            })
            .collect()
    }
}

/// `fromUnixTimestamp64Milli` literal for a millisecond bound
fn ts_literal(ms: i64) -> String {
    format!("fromUnixTimestamp64Milli(toInt64({}))", ms)
}

/// Rows confirmed by the `X-ClickHouse-Summary` header, if present
fn written_rows(response: &Response) -> Option<u64> {
    let summary = response.headers().get(SUMMARY_HEADER)?.to_str().ok()?;
    parse_written_rows(summary)
}

fn parse_written_rows(summary: &str) -> Option<u64> {
    let summary: serde_json::Value = serde_json::from_str(summary).ok()?;
    match &summary["written_rows"] {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl TableStats for HttpStore {
    async fn max_timestamp(&self, table: &TableConfig) -> Result<Option<i64>> {
        let query = format!(
            "SELECT toUnixTimestamp64Milli(toDateTime64(max({col}), 3)) AS max_ts, count() AS n \
             FROM {table} FORMAT JSONEachRow",
            col = quote_ident(&table.timestamp_column),
            table = qualified_table(&self.database, &table.name),
        );

        let body = self.execute(&query, None).await?.text().await?;
        let row = self
            .decode_lines(&body)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Decode(format!("{} store returned no aggregate row", self.store))
            })?;

        let count = row.get("n").and_then(json_i64).unwrap_or(0);
        if count == 0 {
            return Ok(None);
        }
        Ok(row.get("max_ts").and_then(json_i64))
    }
}

#[async_trait]
impl HotReader for HttpStore {
    async fn read_window(&self, table: &TableConfig, window: &Window) -> Result<RowBatch> {
        let col = quote_ident(&table.timestamp_column);
        let query = format!(
            "SELECT * FROM {table} WHERE {col} >= {start} AND {col} < {end} FORMAT JSONEachRow",
            table = qualified_table(&self.database, &table.name),
            col = col,
            start = ts_literal(window.start_ts),
            end = ts_literal(window.end_ts),
        );

        let body = self.execute(&query, None).await?.text().await?;
        Ok(RowBatch::from_json_objects(self.decode_lines(&body)?))
    }
}

#[async_trait]
impl ColdWriter for HttpStore {
    async fn write_rows(&self, table: &TableConfig, rows: &RowBatch) -> Result<u64> {
        let query = format!(
            "INSERT INTO {} FORMAT JSONEachRow",
            qualified_table(&self.database, &table.name)
        );

        let mut written = 0u64;
        for chunk in rows.rows.chunks(self.batch_size) {
            let body = rows.to_json_lines(chunk)?;
            let response = self.execute(&query, Some(body)).await.map_err(|e| {
                if e.is_connectivity() {
                    e
                } else {
                    Error::Write {
                        table: table.name.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;
            // Older servers omit the summary; a 2xx alone is the confirmation then
            written += written_rows(&response).unwrap_or(chunk.len() as u64);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// One request as the fake server saw it
    #[derive(Debug, Clone)]
    struct Seen {
        params: HashMap<String, String>,
        body: String,
    }

    impl Seen {
        /// SQL text, from the URL for inserts and from the body otherwise
        fn sql(&self) -> &str {
            self.params.get("query").map(String::as_str).unwrap_or(&self.body)
        }
    }

    struct Reply {
        status: u16,
        summary: Option<String>,
        body: String,
    }

    impl Reply {
        fn ok(body: &str) -> Self {
            Self {
                status: 200,
                summary: None,
                body: body.to_string(),
            }
        }
    }

    type Handler = Arc<dyn Fn(&Seen) -> Reply + Send + Sync>;

    async fn read_request(stream: &mut TcpStream) -> Option<Seen> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let target = head.split_whitespace().nth(1)?;
        let url = reqwest::Url::parse(&format!("http://stub{}", target)).ok()?;
        Some(Seen {
            params: url.query_pairs().into_owned().collect(),
            body: String::from_utf8_lossy(&buf[header_end..header_end + content_length])
                .to_string(),
        })
    }

    /// Start a one-request-per-connection HTTP server answering with `handler`
    async fn serve(handler: Handler) -> (u16, Arc<Mutex<Vec<Seen>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut stream).await else {
                        return;
                    };
                    let reply = handler(&request);
                    log.lock().unwrap().push(request);

                    let summary = reply
                        .summary
                        .map(|s| format!("{}: {}\r\n", SUMMARY_HEADER, s))
                        .unwrap_or_default();
                    let response = format!(
                        "HTTP/1.1 {} X\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        reply.status,
                        summary,
                        reply.body.len(),
                        reply.body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (port, seen)
    }

    async fn connect(port: u16) -> HttpStore {
        let config: StoreConfig = toml::from_str(&format!(
            "host = \"127.0.0.1\"\nport = {}\ndatabase = \"market_data\"\nconnect_timeout_secs = 5\nquery_timeout_secs = 5\n",
            port
        ))
        .unwrap();
        HttpStore::connect("cold", &config).await.unwrap()
    }

    fn table() -> TableConfig {
        TableConfig {
            name: "trades".into(),
            class: Default::default(),
            window_ms: None,
            timestamp_column: "timestamp".into(),
        }
    }

    fn ping_or(reply: impl Fn(&Seen) -> Reply + Send + Sync + 'static) -> Handler {
        Arc::new(move |seen: &Seen| {
            if seen.sql() == "SELECT 1" {
                Reply::ok("1\n")
            } else {
                reply(seen)
            }
        })
    }

    /// Insert handler confirming every line it received
    fn confirming_inserts() -> Handler {
        ping_or(|seen| {
            let lines = seen.body.lines().count();
            Reply {
                status: 200,
                summary: Some(format!(r#"{{"read_rows":"0","written_rows":"{}"}}"#, lines)),
                body: String::new(),
            }
        })
    }

    fn batch(rows: usize) -> RowBatch {
        let mut batch = RowBatch::new(vec!["price".into(), "timestamp".into()]);
        for i in 0..rows {
            batch.rows.push(vec![
                Value::Decimal(format!("64000.12345678901234567{}", i)),
                Value::String(format!("2024-06-01 00:00:0{}.000", i)),
            ]);
        }
        batch
    }

    #[tokio::test]
    async fn test_read_window_decodes_rows() {
        let (port, seen) = serve(ping_or(|_| {
            Reply::ok(concat!(
                r#"{"symbol":"BTCUSDT","price":"64000.123456789012345678","qty":"3","timestamp":"2024-06-01 00:00:00.125"}"#,
                "\n",
                r#"{"symbol":"ETHUSDT","price":3100.25,"qty":"1","timestamp":"2024-06-01 00:00:01.000"}"#,
                "\n",
            ))
        }))
        .await;
        let store = connect(port).await;

        let window = Window {
            table: "trades".into(),
            start_ts: 1_717_200_000_000,
            end_ts: 1_717_200_060_000,
        };
        let rows = store.read_window(&table(), &window).await.unwrap();
        assert_eq!(rows.len(), 2);
        let price = rows.column_index("price").unwrap();
        assert_eq!(rows.rows[0][price], Value::String("64000.123456789012345678".into()));
        assert_eq!(rows.rows[1][price], Value::Decimal("3100.25".into()));

        let seen = seen.lock().unwrap();
        let select = seen.iter().find(|s| s.sql().starts_with("SELECT *")).unwrap();
        assert!(select.sql().contains("fromUnixTimestamp64Milli(toInt64(1717200000000))"));
        assert!(select.sql().contains("fromUnixTimestamp64Milli(toInt64(1717200060000))"));
        assert_eq!(select.params["output_format_json_quote_decimals"], "1");
        assert_eq!(select.params["output_format_json_quote_64bit_integers"], "1");
        assert_eq!(select.params["database"], "market_data");
    }

    #[tokio::test]
    async fn test_max_timestamp() {
        let (port, _) =
            serve(ping_or(|_| Reply::ok(r#"{"max_ts":"1717200059000","n":"42"}"#))).await;
        let store = connect(port).await;
        assert_eq!(store.max_timestamp(&table()).await.unwrap(), Some(1_717_200_059_000));

        let (port, _) = serve(ping_or(|_| Reply::ok(r#"{"max_ts":"0","n":"0"}"#))).await;
        let store = connect(port).await;
        assert_eq!(store.max_timestamp(&table()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_rows_chunks_and_confirms() {
        let (port, seen) = serve(confirming_inserts()).await;
        let store = connect(port).await.with_batch_size(2);

        let written = store.write_rows(&table(), &batch(5)).await.unwrap();
        assert_eq!(written, 5);

        let seen = seen.lock().unwrap();
        let inserts: Vec<&Seen> = seen.iter().filter(|s| s.sql().starts_with("INSERT")).collect();
        assert_eq!(inserts.len(), 3);
        assert_eq!(inserts[0].sql(), "INSERT INTO `market_data`.`trades` FORMAT JSONEachRow");
        assert_eq!(
            inserts.iter().map(|s| s.body.lines().count()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert!(inserts[0].body.contains("\"price\":64000.123456789012345670"));
    }

    #[tokio::test]
    async fn test_write_rows_reports_short_summary() {
        let (port, _) = serve(ping_or(|_| Reply {
            status: 200,
            summary: Some(r#"{"written_rows":"1"}"#.to_string()),
            body: String::new(),
        }))
        .await;
        let store = connect(port).await;
        assert_eq!(store.write_rows(&table(), &batch(3)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_rows_without_summary_trusts_status() {
        let (port, _) = serve(ping_or(|_| Reply::ok(""))).await;
        let store = connect(port).await.with_batch_size(2);
        assert_eq!(store.write_rows(&table(), &batch(3)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_write_rows_rejected_is_write_error() {
        let (port, _) = serve(ping_or(|_| Reply {
            status: 500,
            summary: None,
            body: "Code: 53. DB::Exception: Type mismatch".to_string(),
        }))
        .await;
        let store = connect(port).await;

        match store.write_rows(&table(), &batch(2)).await {
            Err(Error::Write { table, reason }) => {
                assert_eq!(table, "trades");
                assert!(reason.contains("500"));
                assert!(reason.contains("Type mismatch"));
            }
            other => panic!("expected a write error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_later_chunk_keeps_earlier_chunks() {
        let inserts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = inserts.clone();
        let (port, seen) = serve(ping_or(move |seen| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Reply {
                    status: 200,
                    summary: Some(format!(r#"{{"written_rows":"{}"}}"#, seen.body.lines().count())),
                    body: String::new(),
                }
            } else {
                Reply {
                    status: 503,
                    summary: None,
                    body: "Code: 202. DB::Exception: Too many simultaneous queries".to_string(),
                }
            }
        }))
        .await;
        let store = connect(port).await.with_batch_size(2);

        let err = store.write_rows(&table(), &batch(4)).await.unwrap_err();
        assert!(matches!(err, Error::Write { .. }));

        // The first chunk reached the server before the failure; the caller
        // keeps its watermark, so the retry sends those rows again
        let seen = seen.lock().unwrap();
        let inserts: Vec<&Seen> = seen.iter().filter(|s| s.sql().starts_with("INSERT")).collect();
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[0].body.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config: StoreConfig = toml::from_str(&format!(
            "host = \"127.0.0.1\"\nport = {}\nconnect_timeout_secs = 2\n",
            port
        ))
        .unwrap();
        let err = HttpStore::connect("hot", &config).await.err().unwrap();
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_summary_parsing() {
        assert_eq!(
            parse_written_rows(r#"{"read_rows":"0","written_rows":"1500","written_bytes":"90000"}"#),
            Some(1500)
        );
        assert_eq!(parse_written_rows(r#"{"written_rows":42}"#), Some(42));
        assert_eq!(parse_written_rows("not json"), None);
        assert_eq!(parse_written_rows(r#"{"read_rows":"10"}"#), None);
    }

    #[test]
    fn test_ts_literal() {
        assert_eq!(ts_literal(2_880_000), "fromUnixTimestamp64Milli(toInt64(2880000))");
    }

    #[test]
    fn test_json_i64() {
        assert_eq!(json_i64(&serde_json::json!(5)), Some(5));
        assert_eq!(json_i64(&serde_json::json!("1718000000000")), Some(1_718_000_000_000));
        assert_eq!(json_i64(&serde_json::json!(null)), None);
    }
}
