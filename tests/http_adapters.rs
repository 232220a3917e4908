//! HTTP adapter tests against a local one-shot server.
//!
//! These tests verify that:
//! 1. Vision envelopes are fetched from `/get_frame` and decoded
//! 2. A "no frame" envelope under an HTTP error status is treated as absent
//! 3. Dataverse uploads are multipart with `jsonData` and a named `file` part
//! 4. A rejected upload stays buffered and succeeds on the next drain

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

use dataverse_uplink::{
    DataverseConfig, DataverseSink, FetchResult, Frame, FrameBuffer, FrameSource, RepositorySink,
    VisionApiConfig, VisionApiSource,
};

/// Serves one canned response per connection, in order, and returns the raw requests.
fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = std::thread::spawn(move || {
        let mut requests = Vec::new();
        for (status, body) in responses {
            let (mut stream, _) = listener.accept().expect("accept");
            requests.push(read_request(&mut stream));
            let reply = format!(
                "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(reply.as_bytes()).expect("write reply");
        }
        requests
    });
    (format!("http://{}", addr), handle)
}

fn read_request(stream: &mut TcpStream) -> String {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        data.extend_from_slice(&chunk[..read]);
        if request_complete(&data) {
            break;
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

fn request_complete(data: &[u8]) -> bool {
    let Some(header_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let headers = String::from_utf8_lossy(&data[..header_end]).to_ascii_lowercase();
    let body_len = data.len() - header_end - 4;
    if let Some(length) = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
    {
        return body_len >= length;
    }
    if headers.contains("transfer-encoding: chunked") {
        return data.ends_with(b"0\r\n\r\n");
    }
    true
}

fn vision_source(endpoint: String) -> Result<VisionApiSource> {
    VisionApiSource::new(VisionApiConfig {
        endpoint,
        timeout: Duration::from_secs(5),
        content_type: "image/png".to_string(),
    })
}

fn dataverse_sink(endpoint: String) -> Result<DataverseSink> {
    DataverseSink::new(DataverseConfig {
        endpoint,
        token: "secret-token".to_string(),
        persistent_id: "doi:10.5072/FK2/ABC123".to_string(),
        timeout: Duration::from_secs(5),
    })
}

#[test]
fn vision_source_decodes_frame_envelope() -> Result<()> {
    let body = format!(
        r#"{{"status": {{"code": 200, "message": "ok"}}, "frame": {{"frame": "{}"}}, "metadata": {{"camera": "cam0"}}, "timestamp": 17}}"#,
        STANDARD.encode(b"\x89PNG frame")
    );
    let (endpoint, server) = serve(vec![(200, body)]);
    let mut source = vision_source(endpoint)?;

    let frame = source.fetch().into_frame().expect("frame");
    assert_eq!(frame.payload, b"\x89PNG frame");
    assert_eq!(frame.timestamp, 17);
    assert_eq!(frame.metadata["camera"], "cam0");

    let requests = server.join().expect("server");
    assert!(requests[0].starts_with("GET /get_frame HTTP/1.1"));
    Ok(())
}

#[test]
fn vision_source_treats_error_status_envelope_as_no_data() -> Result<()> {
    let body = r#"{"status": {"code": 500, "message": "camera busy"}}"#.to_string();
    let (endpoint, server) = serve(vec![(500, body)]);
    let mut source = vision_source(endpoint)?;

    let result = source.fetch();
    assert_eq!(
        result,
        FetchResult::NoData("status 500: camera busy".to_string())
    );
    assert_eq!(source.stats().no_data, 1);
    server.join().expect("server");
    Ok(())
}

#[test]
fn vision_source_connect_accepts_any_http_answer() -> Result<()> {
    let (endpoint, server) = serve(vec![(404, "{}".to_string())]);
    let mut source = vision_source(endpoint)?;
    source.connect()?;
    server.join().expect("server");
    Ok(())
}

#[test]
fn dataverse_connect_checks_version() -> Result<()> {
    let (endpoint, server) = serve(vec![(
        200,
        r#"{"status": "OK", "data": {"version": "6.1", "build": "1234"}}"#.to_string(),
    )]);
    let mut sink = dataverse_sink(endpoint)?;
    sink.connect()?;

    let requests = server.join().expect("server");
    assert!(requests[0].starts_with("GET /api/info/version HTTP/1.1"));
    assert!(requests[0]
        .to_ascii_lowercase()
        .contains("x-dataverse-key: secret-token"));
    Ok(())
}

#[test]
fn dataverse_connect_rejects_error_status() -> Result<()> {
    let (endpoint, server) = serve(vec![(401, r#"{"status": "ERROR"}"#.to_string())]);
    let mut sink = dataverse_sink(endpoint)?;
    assert!(sink.connect().is_err());
    server.join().expect("server");
    Ok(())
}

#[test]
fn upload_rejected_with_500_is_retried_and_accepted() -> Result<()> {
    let (endpoint, server) = serve(vec![
        (500, r#"{"status": "ERROR", "message": "busy"}"#.to_string()),
        (200, r#"{"status": "OK"}"#.to_string()),
    ]);
    let mut sink = dataverse_sink(endpoint)?;

    let mut metadata = serde_json::Map::new();
    metadata.insert("camera".to_string(), serde_json::Value::from("cam0"));
    let mut buffer = FrameBuffer::new(3);
    buffer.add(Frame::new(b"pixels".to_vec(), "image/png", 5).with_metadata(metadata));

    let first = buffer.drain_upload(&mut sink);
    assert_eq!(first.failed, 1);
    assert_eq!(buffer.timestamps(), vec![5]);

    let second = buffer.drain_upload(&mut sink);
    assert_eq!(second.uploaded, 1);
    assert!(buffer.is_empty());
    assert_eq!(sink.counts(), (1, 1));

    let requests = server.join().expect("server");
    for request in &requests {
        assert!(request.starts_with(
            "POST /api/datasets/:persistentId/add?persistentId=doi%3A10.5072%2FFK2%2FABC123&key=secret-token HTTP/1.1"
        ));
        assert!(request.to_ascii_lowercase().contains("multipart/form-data"));
        assert!(request.contains(r#"name="jsonData""#));
        assert!(request.contains(r#"{"camera":"cam0"}"#));
        assert!(request.contains(r#"name="file"; filename="frame5.png""#));
        assert!(request.to_ascii_lowercase().contains("content-type: image/png"));
        assert!(request.contains("pixels"));
    }
    Ok(())
}
