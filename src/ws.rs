// ===============================
// src/ws.rs
// ===============================
//
// Framed stream transport: TLS socket, HTTP/1.1 upgrade, RFC 6455 frame
// codec, keepalive and reconnect policy. The codec is strict where the
// venue side must be strict: reserved bits are rejected, server frames
// must arrive unmasked, control frames must be short and unfragmented,
// and payloads beyond MAX_FRAME_PAYLOAD are refused outright.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};
use url::Url;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_MAX_BYTES: usize = 16 * 1024;

/// Hard cap on a single frame payload and on a reassembled message.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(v: u8) -> Option<Opcode> {
        match v {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Encodes a client frame. Client frames are always masked with a fresh
/// random 32-bit key.
pub fn encode_client_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode, payload, true, Some(rand::random::<[u8; 4]>()))
}

fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let fin_bit = if fin { 0x80 } else { 0x00 };
    out.push(fin_bit | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Incremental frame parser over a byte buffer fed by the socket reader.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_FRAME_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { buf: Vec::new(), max_payload }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let b0 = self.buf[0];
        let b1 = self.buf[1];

        if b0 & 0x70 != 0 {
            return Err(Error::Protocol("nonzero reserved bits".into()));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_u8(b0 & 0x0F)
            .ok_or_else(|| Error::Protocol(format!("unknown opcode {:#x}", b0 & 0x0F)))?;

        if b1 & 0x80 != 0 {
            return Err(Error::Protocol("server frame is masked".into()));
        }

        let len7 = (b1 & 0x7F) as usize;
        let (payload_len, header_len) = match len7 {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize, 4)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len > self.max_payload as u64 {
                    return Err(Error::Protocol(format!("frame payload {len} exceeds cap")));
                }
                (len as usize, 10)
            }
            n => (n, 2),
        };

        if payload_len > self.max_payload {
            return Err(Error::Protocol(format!("frame payload {payload_len} exceeds cap")));
        }
        if opcode.is_control() && (payload_len > 125 || !fin) {
            return Err(Error::Protocol("malformed control frame".into()));
        }

        let total = header_len + payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = self.buf[header_len..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(Frame { fin, opcode, payload }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Transport stream (plain TCP or TLS), tagged variant
// ---------------------------------------------------------------------------

pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

pub fn compute_accept(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

fn build_upgrade_request(url: &Url, host_header: &str, key: &str) -> String {
    let mut path = url.path().to_string();
    if let Some(q) = url.query() {
        path.push('?');
        path.push_str(q);
    }
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().skip(1).find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}

async fn upgrade(stream: &mut MaybeTlsStream, url: &Url, host_header: &str) -> Result<Vec<u8>> {
    let key = BASE64.encode(rand::random::<[u8; 16]>());
    let request = build_upgrade_request(url, host_header, &key);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut raw = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Protocol("connection closed during upgrade".into()));
        }
        raw.extend_from_slice(&chunk[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if raw.len() > HANDSHAKE_MAX_BYTES {
            return Err(Error::Protocol("oversized upgrade response".into()));
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let status_line = head.lines().next().unwrap_or_default();
    if !status_line.contains(" 101 ") {
        return Err(Error::Protocol(format!("upgrade refused: {status_line}")));
    }

    let accept = header_value(&head, "Sec-WebSocket-Accept")
        .ok_or_else(|| Error::Protocol("missing Sec-WebSocket-Accept".into()))?;
    if accept != compute_accept(&key) {
        return Err(Error::Protocol("Sec-WebSocket-Accept mismatch".into()));
    }

    // Frame bytes may already trail the upgrade response.
    Ok(raw[header_end..].to_vec())
}

// ---------------------------------------------------------------------------
// Connection halves
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum WsEvent {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close,
}

pub struct WsReader {
    inner: ReadHalf<MaybeTlsStream>,
    decoder: FrameDecoder,
    fragment: Option<(Opcode, Vec<u8>)>,
}

impl WsReader {
    /// Reads until one complete message or control event is available.
    /// Fragmented data frames are reassembled here.
    pub async fn next_event(&mut self) -> Result<WsEvent> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            while let Some(frame) = self.decoder.next_frame()? {
                match frame.opcode {
                    Opcode::Ping => return Ok(WsEvent::Ping(frame.payload)),
                    Opcode::Pong => return Ok(WsEvent::Pong),
                    Opcode::Close => return Ok(WsEvent::Close),
                    Opcode::Text | Opcode::Binary => {
                        if self.fragment.is_some() {
                            return Err(Error::Protocol("data frame inside fragment".into()));
                        }
                        if frame.fin {
                            return finish_message(frame.opcode, frame.payload);
                        }
                        self.fragment = Some((frame.opcode, frame.payload));
                    }
                    Opcode::Continuation => {
                        let Some((opcode, mut acc)) = self.fragment.take() else {
                            return Err(Error::Protocol("continuation without start".into()));
                        };
                        if acc.len() + frame.payload.len() > MAX_FRAME_PAYLOAD {
                            return Err(Error::Protocol("reassembled message exceeds cap".into()));
                        }
                        acc.extend_from_slice(&frame.payload);
                        if frame.fin {
                            return finish_message(opcode, acc);
                        }
                        self.fragment = Some((opcode, acc));
                    }
                }
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::Transport("connection closed by peer".into()));
            }
            self.decoder.extend(&chunk[..n]);
        }
    }
}

fn finish_message(opcode: Opcode, payload: Vec<u8>) -> Result<WsEvent> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(WsEvent::Text)
            .map_err(|_| Error::Protocol("invalid utf-8 in text frame".into())),
        _ => Ok(WsEvent::Binary(payload)),
    }
}

pub struct WsWriter {
    inner: WriteHalf<MaybeTlsStream>,
}

impl WsWriter {
    async fn send(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let frame = encode_client_frame(opcode, payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_ping(&mut self) -> Result<()> {
        self.send(Opcode::Ping, &[]).await
    }

    pub async fn send_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.send(Opcode::Pong, payload).await
    }

    pub async fn send_close(&mut self) -> Result<()> {
        // 1000 = normal closure
        self.send(Opcode::Close, &1000u16.to_be_bytes()).await
    }
}

/// Opens the socket, runs TLS when the scheme asks for it, and completes
/// the upgrade handshake.
pub async fn connect(url: &Url) -> Result<(WsReader, WsWriter)> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config(format!("url without host: {url}")))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Config(format!("url without port: {url}")))?;
    let use_tls = match url.scheme() {
        "wss" => true,
        "ws" => false,
        other => return Err(Error::Config(format!("unsupported scheme '{other}'"))),
    };

    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| Error::Transport(format!("connect timeout to {host}:{port}")))??;
    tcp.set_nodelay(true)?;

    let mut stream = if use_tls {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| Error::Config(format!("invalid tls server name: {host}")))?;
        let tls = connector.connect(server_name, tcp).await?;
        MaybeTlsStream::Tls(Box::new(tls))
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    let host_header = if port == 443 || port == 80 {
        host.clone()
    } else {
        format!("{host}:{port}")
    };
    let leftover = timeout(CONNECT_TIMEOUT, upgrade(&mut stream, url, &host_header))
        .await
        .map_err(|_| Error::Transport("upgrade handshake timeout".into()))??;

    let (read_half, write_half) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new();
    decoder.extend(&leftover);

    Ok((
        WsReader { inner: read_half, decoder, fragment: None },
        WsWriter { inner: write_half },
    ))
}

// ---------------------------------------------------------------------------
// Managed market-data stream with keepalive and reconnect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: Url,
    /// Subscription documents replayed after every (re)connect.
    pub subscriptions: Vec<String>,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Metrics label: "market_data" or "trading".
    pub channel: &'static str,
}

#[derive(Debug)]
pub enum StreamEvent {
    /// A full text message plus the instant its last byte was read.
    Message { text: String, received_at: Instant },
    /// true on connect, false on disconnect.
    Status(bool),
    /// Reconnect budget exhausted; the stream task has stopped.
    Fatal(Error),
}

pub struct StreamHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl StreamHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawns the stream task. Events flow to `events`; the handle stops it.
pub fn spawn_stream(cfg: StreamConfig, events: mpsc::UnboundedSender<StreamEvent>) -> StreamHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_stream(cfg, events, shutdown_rx));
    StreamHandle { shutdown: shutdown_tx, task }
}

async fn run_stream(
    cfg: StreamConfig,
    events: mpsc::UnboundedSender<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }

        info!(url = %cfg.url, channel = cfg.channel, "connecting stream");
        match connect(&cfg.url).await {
            Ok((reader, mut writer)) => {
                let mut subscribed = true;
                for doc in &cfg.subscriptions {
                    if writer.send_text(doc).await.is_err() {
                        subscribed = false;
                        break;
                    }
                }
                if subscribed {
                    attempts = 0;
                    crate::metrics::WS_CONNECTED.with_label_values(&[cfg.channel]).set(1);
                    let _ = events.send(StreamEvent::Status(true));

                    run_session(&cfg, reader, writer, &events, &mut shutdown).await;

                    crate::metrics::WS_CONNECTED.with_label_values(&[cfg.channel]).set(0);
                    let _ = events.send(StreamEvent::Status(false));
                }
            }
            Err(e) => {
                error!(channel = cfg.channel, error = %e, "stream connect failed");
            }
        }

        if *shutdown.borrow() {
            return;
        }

        attempts = attempts.saturating_add(1);
        crate::metrics::WS_RECONNECTS.with_label_values(&[cfg.channel]).inc();
        if attempts > cfg.max_reconnect_attempts {
            error!(
                channel = cfg.channel,
                attempts, "reconnect attempts exhausted, giving up"
            );
            let _ = events.send(StreamEvent::Fatal(Error::ReconnectExhausted { attempts }));
            return;
        }

        debug!(channel = cfg.channel, attempts, delay_ms = cfg.reconnect_delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = sleep(cfg.reconnect_delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// One connected session: pumps messages, answers pings, sends proactive
/// pings, and declares the connection dead after `idle_timeout` of
/// silence. Returns when the session is over for any reason.
async fn run_session(
    cfg: &StreamConfig,
    mut reader: WsReader,
    mut writer: WsWriter,
    events: &mpsc::UnboundedSender<StreamEvent>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ping_timer = interval(cfg.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_message = Instant::now();

    loop {
        tokio::select! {
            event = reader.next_event() => {
                let received_at = Instant::now();
                match event {
                    Ok(WsEvent::Text(text)) => {
                        last_message = received_at;
                        if events.send(StreamEvent::Message { text, received_at }).is_err() {
                            return;
                        }
                    }
                    Ok(WsEvent::Binary(bytes)) => {
                        last_message = received_at;
                        if let Ok(text) = String::from_utf8(bytes) {
                            if events.send(StreamEvent::Message { text, received_at }).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(WsEvent::Ping(payload)) => {
                        last_message = received_at;
                        if writer.send_pong(&payload).await.is_err() {
                            warn!(channel = cfg.channel, "pong send failed");
                            return;
                        }
                    }
                    Ok(WsEvent::Pong) => {
                        last_message = received_at;
                    }
                    Ok(WsEvent::Close) => {
                        info!(channel = cfg.channel, "close frame from server");
                        let _ = writer.send_close().await;
                        return;
                    }
                    Err(e) => {
                        warn!(channel = cfg.channel, error = %e, "stream read error");
                        return;
                    }
                }
            }
            _ = ping_timer.tick() => {
                if last_message.elapsed() > cfg.idle_timeout {
                    warn!(
                        channel = cfg.channel,
                        idle_secs = last_message.elapsed().as_secs(),
                        "no message within idle timeout, dropping connection"
                    );
                    return;
                }
                if writer.send_ping().await.is_err() {
                    warn!(channel = cfg.channel, "ping send failed");
                    return;
                }
            }
            _ = shutdown.changed() => {
                let _ = writer.send_close().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut d = FrameDecoder::new();
        d.extend(bytes);
        let mut out = Vec::new();
        while let Some(f) = d.next_frame().unwrap() {
            out.push(f);
        }
        out
    }

    fn server_frame(opcode: Opcode, payload: &[u8], fin: bool) -> Vec<u8> {
        encode_frame(opcode, payload, fin, None)
    }

    #[test]
    fn client_frame_is_masked_with_embedded_key() {
        let payload = b"hello";
        let bytes = encode_client_frame(Opcode::Text, payload);
        assert_eq!(bytes[0], 0x81);
        assert_eq!(bytes[1], 0x80 | payload.len() as u8);
        let key = [bytes[2], bytes[3], bytes[4], bytes[5]];
        let unmasked: Vec<u8> = bytes[6..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect();
        assert_eq!(unmasked, payload);
    }

    #[test]
    fn server_frame_round_trip_small() {
        let frames = decode_all(&server_frame(Opcode::Text, b"tick", true));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, Opcode::Text);
        assert_eq!(frames[0].payload, b"tick");
        assert!(frames[0].fin);
    }

    #[test]
    fn length_boundaries_round_trip() {
        for len in [125usize, 126, 65535, 65536] {
            let payload = vec![0xABu8; len];
            let frames = decode_all(&server_frame(Opcode::Binary, &payload, true));
            assert_eq!(frames.len(), 1, "len {len}");
            assert_eq!(frames[0].payload.len(), len);
        }
    }

    #[test]
    fn partial_bytes_yield_none_until_complete() {
        let bytes = server_frame(Opcode::Text, b"partial", true);
        let mut d = FrameDecoder::new();
        d.extend(&bytes[..3]);
        assert!(d.next_frame().unwrap().is_none());
        d.extend(&bytes[3..]);
        assert_eq!(d.next_frame().unwrap().unwrap().payload, b"partial");
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut bytes = server_frame(Opcode::Text, b"one", true);
        bytes.extend(server_frame(Opcode::Text, b"two", true));
        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload, b"two");
    }

    #[test]
    fn masked_server_frame_rejected() {
        let bytes = encode_frame(Opcode::Text, b"x", true, Some([1, 2, 3, 4]));
        let mut d = FrameDecoder::new();
        d.extend(&bytes);
        assert!(matches!(d.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut bytes = server_frame(Opcode::Text, b"x", true);
        bytes[0] |= 0x40;
        let mut d = FrameDecoder::new();
        d.extend(&bytes);
        assert!(matches!(d.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let bytes = vec![0x83, 0x00];
        let mut d = FrameDecoder::new();
        d.extend(&bytes);
        assert!(matches!(d.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut d = FrameDecoder::with_max_payload(16);
        d.extend(&server_frame(Opcode::Binary, &[0u8; 17], true));
        assert!(matches!(d.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let bytes = server_frame(Opcode::Ping, b"p", false);
        let mut d = FrameDecoder::new();
        d.extend(&bytes);
        assert!(matches!(d.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let bytes = server_frame(Opcode::Ping, &[0u8; 126], true);
        let mut d = FrameDecoder::new();
        d.extend(&bytes);
        assert!(matches!(d.next_frame(), Err(Error::Protocol(_))));
    }

    #[test]
    fn fragmented_text_is_reassembled() {
        // Three fragments with an interleaved ping, the way a server is
        // allowed to split a message.
        let mut frames = Vec::new();
        frames.extend(server_frame(Opcode::Text, b"hel", false));
        frames.extend(server_frame(Opcode::Ping, b"hb", true));
        frames.extend(server_frame(Opcode::Continuation, b"lo ", false));
        frames.extend(server_frame(Opcode::Continuation, b"world", true));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frames);

        let mut fragment: Option<(Opcode, Vec<u8>)> = None;
        let mut pings = 0;
        let mut message = None;
        while let Some(frame) = decoder.next_frame().unwrap() {
            match frame.opcode {
                Opcode::Ping => pings += 1,
                Opcode::Text => {
                    assert!(fragment.is_none());
                    assert!(!frame.fin);
                    fragment = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let (op, mut acc) = fragment.take().unwrap();
                    acc.extend_from_slice(&frame.payload);
                    if frame.fin {
                        message = Some(acc);
                    } else {
                        fragment = Some((op, acc));
                    }
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(pings, 1);
        assert_eq!(message.unwrap(), b"hello world");
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_request_carries_required_headers() {
        let url = Url::parse("wss://stream.example.com/ws/btcusdt@depth20@100ms").unwrap();
        let req = build_upgrade_request(&url, "stream.example.com", "a2V5a2V5a2V5a2V5a2V5a2U=");
        assert!(req.starts_with("GET /ws/btcusdt@depth20@100ms HTTP/1.1\r\n"));
        assert!(req.contains("Upgrade: websocket\r\n"));
        assert!(req.contains("Connection: Upgrade\r\n"));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let head = "HTTP/1.1 101 Switching Protocols\r\nsec-websocket-accept: abc\r\n\r\n";
        assert_eq!(header_value(head, "Sec-WebSocket-Accept"), Some("abc"));
    }
}
