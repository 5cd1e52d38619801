use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status_line: String,
    pub content_type: String,
    pub body: String,
}

impl MockResponse {
    pub fn json(status_line: &str, body: &str) -> Self {
        Self {
            status_line: status_line.to_string(),
            content_type: "application/json".to_string(),
            body: body.to_string(),
        }
    }

    pub fn ndjson(lines: &[&str]) -> Self {
        let mut body = lines.join("\n");
        body.push('\n');
        Self {
            status_line: "200 OK".to_string(),
            content_type: "application/x-ndjson".to_string(),
            body,
        }
    }
}

/// Spawn a mock HTTP server that answers one request per entry in
/// `responses`, in order, capturing each request. Returns the base URL and a
/// receiver yielding the captured requests.
pub fn spawn_mock_server(responses: Vec<MockResponse>) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("read mock server addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for response in responses {
            let (mut stream, _) = listener.accept().expect("accept mock request");
            let req = read_http_request(&mut stream);
            if tx.send(req).is_err() {
                return;
            }
            write_response(&mut stream, &response);
        }
    });

    (format!("http://{addr}"), rx)
}

/// Single-request shorthand for [`spawn_mock_server`] with a JSON body.
pub fn spawn_one_shot_server(
    status_line: &str,
    response_body: &str,
) -> (String, mpsc::Receiver<CapturedRequest>) {
    spawn_mock_server(vec![MockResponse::json(status_line, response_body)])
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) {
    let raw = format!(
        "HTTP/1.1 {}\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        response.status_line,
        response.content_type,
        response.body.len(),
        response.body
    );
    stream
        .write_all(raw.as_bytes())
        .expect("write mock response");
}

fn read_http_request(stream: &mut TcpStream) -> CapturedRequest {
    let mut buf = Vec::new();
    let mut header_end = None;
    let mut content_length = 0usize;

    loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).expect("read request bytes");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if header_end.is_none() {
            header_end = buf
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
                .map(|idx| idx + 4);
            if let Some(end) = header_end {
                content_length = parse_content_length(&String::from_utf8_lossy(&buf[..end]));
            }
        }
        if let Some(end) = header_end {
            if buf.len() >= end + content_length {
                break;
            }
        }
    }

    let end = header_end.expect("request headers must be present");
    let headers_raw = String::from_utf8_lossy(&buf[..end]).into_owned();
    let mut lines = headers_raw.lines();
    let request_line = lines.next().expect("request line");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().expect("method").to_string();
    let path = parts.next().expect("path").to_string();
    let headers = lines
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let body = String::from_utf8(buf[end..end + content_length].to_vec()).expect("utf8 body");

    CapturedRequest {
        method,
        path,
        headers,
        body,
    }
}

fn parse_content_length(headers: &str) -> usize {
    headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0)
}
