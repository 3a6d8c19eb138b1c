//! Accept-thread + per-connection-thread HTTP server.
//!
//! The original ran this logic inside libmicrohttpd's callback model
//! (`answer_to_connection`/`reader_callback`); this crate owns the socket
//! loop directly with `std::net`, one OS thread per connection, rather than
//! reaching for an async runtime.

use crate::client::Client;
use crate::{Framing, Publisher, StreamId};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

pub fn serve(listener: TcpListener, publisher: Arc<Publisher>) {
    for stream in listener.incoming() {
        let Ok(stream) = stream else { continue };
        let publisher = publisher.clone();
        thread::spawn(move || {
            if let Err(e) = handle_connection(stream, publisher) {
                tracing::debug!(error = %e, "HTTP connection ended");
            }
        });
    }
}

fn handle_connection(mut stream: TcpStream, publisher: Arc<Publisher>) -> std::io::Result<()> {
    let path = {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;
        parse_path(&request_line).unwrap_or_else(|| "/".to_string())
    };

    if let Some((content, content_type)) = publisher.call_endpoint(&path) {
        write_response_headers(&mut stream, &content_type, Some(content.len()))?;
        stream.write_all(content.as_bytes())?;
        return Ok(());
    }

    let framing = if path.ends_with(".metacube") {
        Framing::Metacube
    } else {
        Framing::Raw
    };
    let stream_id = StreamId::from_path(&path);

    let client = Arc::new(Client::new());
    publisher.register_client(stream_id, framing, client.clone());

    write_response_headers(&mut stream, "video/x-matroska", None)?;

    let result = (|| -> std::io::Result<()> {
        while let Some(chunk) = client.next_chunk() {
            stream.write_all(&chunk)?;
            stream.flush()?;
        }
        Ok(())
    })();

    publisher.unregister_client(stream_id, &client);
    result
}

fn parse_path(request_line: &str) -> Option<String> {
    let mut parts = request_line.split_whitespace();
    let _method = parts.next()?;
    let target = parts.next()?;
    Some(target.split('?').next().unwrap_or(target).to_string())
}

fn write_response_headers(stream: &mut TcpStream, content_type: &str, content_length: Option<usize>) -> std::io::Result<()> {
    let mut header = format!("HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nConnection: close\r\n");
    if let Some(len) = content_length {
        header.push_str(&format!("Content-Length: {len}\r\n"));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_stripping_query_string() {
        assert_eq!(parse_path("GET /feeds/2?token=abc HTTP/1.1\r\n"), Some("/feeds/2".to_string()));
        assert_eq!(parse_path("GET /multicam.mp4.metacube HTTP/1.1\r\n"), Some("/multicam.mp4.metacube".to_string()));
        assert_eq!(parse_path("garbage"), None);
    }
}
