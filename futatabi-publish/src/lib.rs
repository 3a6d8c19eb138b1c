//! Metacube-framed HTTP fan-out for the multicam live stream.
//!
//! A [`Publisher`] tracks one backlog [`crate::client::Client`] per
//! connected socket, grouped by [`StreamId`] (the main multiplexed stream,
//! the raw multicam feed, or a single-camera siphon), and fans encoded
//! data out to all of them. Each client negotiates its own framing
//! ([`Framing::Metacube`] or [`Framing::Raw`]) by URL suffix. Registered
//! endpoint callbacks (used for `/metrics` and similar one-shot text
//! responses) are checked before stream routing.

pub mod client;
pub mod metacube;
pub mod server;

use client::{Client, DataType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Main,
    Multicam,
    Siphon(u32),
}

impl StreamId {
    pub fn from_path(path: &str) -> Self {
        let trimmed = path.strip_suffix(".metacube").unwrap_or(path);
        if trimmed == "/multicam.mp4" {
            return StreamId::Multicam;
        }
        if let Some(rest) = trimmed.strip_prefix("/feeds/") {
            if let Ok(n) = rest.parse::<u32>() {
                return StreamId::Siphon(n);
            }
        }
        StreamId::Main
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Metacube,
    Raw,
}

struct ClientEntry {
    client: Arc<Client>,
    framing: Framing,
}

type EndpointCallback = Box<dyn Fn() -> (String, String) + Send + Sync>;

pub struct Publisher {
    streams: Mutex<HashMap<StreamId, Vec<ClientEntry>>>,
    endpoints: Mutex<HashMap<String, EndpointCallback>>,
    bytes_published: AtomicU64,
    clients_connected: AtomicU64,
}

impl Publisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            bytes_published: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
        })
    }

    /// Registers a one-shot text endpoint (path, not subject to stream
    /// routing). The callback returns `(body, content_type)`.
    pub fn add_endpoint<F>(&self, path: impl Into<String>, callback: F)
    where
        F: Fn() -> (String, String) + Send + Sync + 'static,
    {
        self.endpoints
            .lock()
            .expect("endpoints mutex poisoned")
            .insert(path.into(), Box::new(callback));
    }

    pub fn call_endpoint(&self, path: &str) -> Option<(String, String)> {
        if path == "/metrics" {
            return Some((self.render_metrics(), "text/plain; version=0.0.4".to_string()));
        }
        let endpoints = self.endpoints.lock().expect("endpoints mutex poisoned");
        endpoints.get(path).map(|callback| callback())
    }

    pub fn register_client(&self, stream_id: StreamId, framing: Framing, client: Arc<Client>) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
        self.streams
            .lock()
            .expect("streams mutex poisoned")
            .entry(stream_id)
            .or_default()
            .push(ClientEntry { client, framing });
    }

    pub fn unregister_client(&self, stream_id: StreamId, client: &Arc<Client>) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
        let mut streams = self.streams.lock().expect("streams mutex poisoned");
        if let Some(entries) = streams.get_mut(&stream_id) {
            entries.retain(|entry| !Arc::ptr_eq(&entry.client, client));
        }
    }

    /// Fans `payload` out to every client on `stream_id`, wrapping it in a
    /// Metacube2 block for clients that asked for that framing and sending
    /// raw bytes to everyone else.
    pub fn publish(&self, stream_id: StreamId, payload: &[u8], data_type: DataType) {
        self.bytes_published
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let streams = self.streams.lock().expect("streams mutex poisoned");
        let Some(entries) = streams.get(&stream_id) else {
            return;
        };

        let metacube_flags = match data_type {
            DataType::Header => metacube::FLAG_HEADER,
            DataType::Keyframe => metacube::FLAG_KEYFRAME,
            DataType::Other => 0,
        };
        let metacube_block = metacube::frame_block(payload, metacube_flags);

        for entry in entries {
            let framed = match entry.framing {
                Framing::Metacube => metacube_block.clone(),
                Framing::Raw => payload.to_vec(),
            };
            entry.client.push(framed, data_type);
        }
    }

    /// Emits a Metacube2 metadata block (`NEXT_BLOCK_PTS`/`ENCODER_TIMESTAMP`)
    /// to Metacube clients on `stream_id` only; raw clients have no
    /// equivalent out-of-band channel and don't receive it.
    pub fn publish_metadata(&self, stream_id: StreamId, payload: &[u8]) {
        let streams = self.streams.lock().expect("streams mutex poisoned");
        let Some(entries) = streams.get(&stream_id) else {
            return;
        };
        let block = metacube::frame_block(payload, metacube::FLAG_METADATA);
        for entry in entries.iter().filter(|e| e.framing == Framing::Metacube) {
            entry.client.push(block.clone(), DataType::Other);
        }
    }

    pub fn connected_clients(&self) -> u64 {
        self.clients_connected.load(Ordering::Relaxed)
    }

    fn render_metrics(&self) -> String {
        format!(
            "# HELP futatabi_publish_bytes_total Total bytes handed to the publisher.\n\
             # TYPE futatabi_publish_bytes_total counter\n\
             futatabi_publish_bytes_total {}\n\
             # HELP futatabi_publish_clients_connected Currently connected HTTP clients.\n\
             # TYPE futatabi_publish_clients_connected gauge\n\
             futatabi_publish_clients_connected {}\n",
            self.bytes_published.load(Ordering::Relaxed),
            self.clients_connected.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_routes_known_paths() {
        assert_eq!(StreamId::from_path("/multicam.mp4"), StreamId::Multicam);
        assert_eq!(StreamId::from_path("/multicam.mp4.metacube"), StreamId::Multicam);
        assert_eq!(StreamId::from_path("/feeds/3"), StreamId::Siphon(3));
        assert_eq!(StreamId::from_path("/feeds/3.metacube"), StreamId::Siphon(3));
        assert_eq!(StreamId::from_path("/live.ts"), StreamId::Main);
    }

    #[test]
    fn metrics_endpoint_reports_connected_clients() {
        let publisher = Publisher::new();
        publisher.register_client(StreamId::Main, Framing::Raw, Arc::new(Client::new()));
        let (body, content_type) = publisher.call_endpoint("/metrics").unwrap();
        assert!(body.contains("futatabi_publish_clients_connected 1"));
        assert_eq!(content_type, "text/plain; version=0.0.4");
    }

    #[test]
    fn publish_reaches_only_matching_stream_clients() {
        let publisher = Publisher::new();
        let main_client = Arc::new(Client::new());
        let multicam_client = Arc::new(Client::new());
        publisher.register_client(StreamId::Main, Framing::Raw, main_client.clone());
        publisher.register_client(StreamId::Multicam, Framing::Raw, multicam_client.clone());

        publisher.publish(StreamId::Main, b"payload", DataType::Keyframe);

        assert_eq!(main_client.bytes_buffered(), "payload".len());
        assert_eq!(multicam_client.bytes_buffered(), 0);
    }

    #[test]
    fn metacube_clients_receive_framed_blocks_raw_clients_do_not() {
        let publisher = Publisher::new();
        let raw_client = Arc::new(Client::new());
        let metacube_client = Arc::new(Client::new());
        publisher.register_client(StreamId::Main, Framing::Raw, raw_client.clone());
        publisher.register_client(StreamId::Main, Framing::Metacube, metacube_client.clone());

        publisher.publish(StreamId::Main, b"payload", DataType::Keyframe);

        assert_eq!(raw_client.bytes_buffered(), "payload".len());
        assert_eq!(metacube_client.bytes_buffered(), "payload".len() + 16);
    }
}
