//! Canned-response HTTP fixtures for tests.
//!
//! A tiny TCP server that answers each request from a routing closure and
//! closes the connection. Transport failures are simulated by pointing
//! clients at an address nothing listens on (port 1).

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

#[derive(Debug, Clone)]
pub struct StubResponse {
  pub status: u16,
  pub content_type: String,
  pub body: String,
}

impl StubResponse {
  pub fn json(body: impl Into<String>) -> Self {
    Self {
      status: 200,
      content_type: "application/json".to_string(),
      body: body.into(),
    }
  }

  pub fn with_status(mut self, status: u16) -> Self {
    self.status = status;
    self
  }

  pub fn html(body: impl Into<String>) -> Self {
    Self {
      status: 200,
      content_type: "text/html".to_string(),
      body: body.into(),
    }
  }

  pub fn not_found() -> Self {
    Self {
      status: 404,
      content_type: "text/plain".to_string(),
      body: "not found".to_string(),
    }
  }
}

type Handler = Arc<dyn Fn(&str, &str, &str) -> StubResponse + Send + Sync>;

pub struct StubServer {
  addr: SocketAddr,
  handle: tokio::task::JoinHandle<()>,
}

impl StubServer {
  /// Start a server answering via `handler(method, path_and_query, body)`.
  pub async fn start<F>(handler: F) -> Self
  where
    F: Fn(&str, &str, &str) -> StubResponse + Send + Sync + 'static,
  {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub server");
    let addr = listener.local_addr().expect("stub server addr");
    let handler: Handler = Arc::new(handler);

    let handle = tokio::spawn(async move {
      loop {
        let Ok((mut stream, _)) = listener.accept().await else {
          break;
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
          let request = read_request(&mut stream).await;
          let (method, path, body) = parse_request(&request);
          let response = handler(&method, &path, &body);
          let payload = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            response.status,
            reason(response.status),
            response.content_type,
            response.body.len(),
            response.body
          );
          let _ = stream.write_all(payload.as_bytes()).await;
          let _ = stream.shutdown().await;
        });
      }
    });

    Self { addr, handle }
  }

  /// Serve one JSON body at one path; 404 everywhere else.
  pub async fn json(path: &'static str, body: &'static str) -> Self {
    Self::start(move |_, p, _| {
      if p == path {
        StubResponse::json(body)
      } else {
        StubResponse::not_found()
      }
    })
    .await
  }

  /// Serve a fixed status + plain text body at one path.
  pub async fn status(path: &'static str, status: u16, body: &'static str) -> Self {
    Self::start(move |_, p, _| {
      if p == path {
        StubResponse {
          status,
          content_type: "text/plain".to_string(),
          body: body.to_string(),
        }
      } else {
        StubResponse::not_found()
      }
    })
    .await
  }

  pub fn base(&self) -> Url {
    Url::parse(&format!("http://{}", self.addr)).expect("stub server url")
  }

  pub fn url(&self, path: &str) -> Url {
    self.base().join(path).expect("stub server path")
  }
}

impl Drop for StubServer {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

/// Base URL of an address nothing listens on (connection refused).
pub fn unreachable_base() -> Url {
  Url::parse("http://127.0.0.1:1").expect("unreachable url")
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
  let mut buf = vec![0u8; 65536];
  let mut total = 0;

  loop {
    match stream.read(&mut buf[total..]).await {
      Ok(0) => break,
      Ok(n) => {
        total += n;
        let text = String::from_utf8_lossy(&buf[..total]);
        if let Some(header_end) = text.find("\r\n\r\n") {
          let content_length = text
            .lines()
            .find_map(|line| {
              let (name, value) = line.split_once(':')?;
              if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
              } else {
                None
              }
            })
            .unwrap_or(0);
          if total - (header_end + 4) >= content_length {
            break;
          }
        }
        if total == buf.len() {
          break;
        }
      }
      Err(_) => break,
    }
  }

  String::from_utf8_lossy(&buf[..total]).into_owned()
}

fn parse_request(request: &str) -> (String, String, String) {
  let mut lines = request.lines();
  let first = lines.next().unwrap_or_default();
  let mut parts = first.split_whitespace();
  let method = parts.next().unwrap_or_default().to_string();
  let path = parts.next().unwrap_or_default().to_string();
  let body = request
    .split_once("\r\n\r\n")
    .map(|(_, b)| b.to_string())
    .unwrap_or_default();
  (method, path, body)
}

fn reason(status: u16) -> &'static str {
  match status {
    200 => "OK",
    201 => "Created",
    400 => "Bad Request",
    404 => "Not Found",
    500 => "Internal Server Error",
    _ => "OK",
  }
}
