//! Fake devtools HTTP/WebSocket endpoint for tests.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::FrameHeader;

/// Encodes an unmasked server-to-client text frame.
pub(crate) fn server_text_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x81];
    if payload.len() <= 125 {
        frame.push(payload.len() as u8);
    } else {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

/// Serves `GET /json/list` and WebSocket upgrades on `/devtools/page/<id>`.
///
/// Every text frame received on a page socket is recorded and answered with
/// a fixed `Runtime.evaluate` result.
pub(crate) struct FakeDevtools {
    addr: SocketAddr,
    pages: Arc<Mutex<Value>>,
    evaluated: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeDevtools {
    pub async fn start(pages: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let pages = Arc::new(Mutex::new(pages));
        let evaluated = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let pages = Arc::clone(&pages);
            let evaluated = Arc::clone(&evaluated);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    tokio::spawn(serve(socket, Arc::clone(&pages), Arc::clone(&evaluated)));
                }
            })
        };

        Self {
            addr,
            pages,
            evaluated,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ws_url(&self, page_id: &str) -> String {
        format!("ws://{}/devtools/page/{page_id}", self.addr)
    }

    pub fn set_pages(&self, pages: Value) {
        *self.pages.lock() = pages;
    }

    pub fn evaluated(&self) -> Vec<String> {
        self.evaluated.lock().clone()
    }
}

impl Drop for FakeDevtools {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, pages: Arc<Mutex<Value>>, evaluated: Arc<Mutex<Vec<String>>>) {
    let mut buffered = Vec::new();
    let Some(head) = read_head(&mut socket, &mut buffered).await else {
        return;
    };
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    if path == "/json/list" {
        let body = pages.lock().to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json; charset=UTF-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = socket.write_all(response.as_bytes()).await;
        return;
    }

    if !path.starts_with("/devtools/page/") {
        let _ = socket
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await;
        return;
    }

    let key = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("sec-websocket-key")
                .then(|| value.trim().to_string())
        })
        .unwrap_or_default();
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        derive_accept_key(key.as_bytes())
    );
    if socket.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    while let Some(text) = read_client_frame(&mut socket, &mut buffered).await {
        evaluated.lock().push(text);
        let reply = br#"{"id":1,"result":{"result":{"type":"undefined"}}}"#;
        if socket.write_all(&server_text_frame(reply)).await.is_err() {
            return;
        }
    }
}

async fn fill(socket: &mut TcpStream, buffered: &mut Vec<u8>) -> Option<()> {
    let mut chunk = [0u8; 4096];
    match socket.read(&mut chunk).await {
        Ok(0) | Err(_) => None,
        Ok(n) => {
            buffered.extend_from_slice(&chunk[..n]);
            Some(())
        }
    }
}

async fn read_head(socket: &mut TcpStream, buffered: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(end) = buffered.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buffered[..end]).into_owned();
            buffered.drain(..end + 4);
            return Some(head);
        }
        fill(socket, buffered).await?;
    }
}

async fn read_client_frame(socket: &mut TcpStream, buffered: &mut Vec<u8>) -> Option<String> {
    let (header, len) = loop {
        let mut cursor = Cursor::new(buffered.as_slice());
        if let Some(parsed) = FrameHeader::parse(&mut cursor).ok()? {
            let consumed = cursor.position() as usize;
            buffered.drain(..consumed);
            break parsed;
        }
        fill(socket, buffered).await?;
    };

    let len = len as usize;
    while buffered.len() < len {
        fill(socket, buffered).await?;
    }

    let mut payload: Vec<u8> = buffered.drain(..len).collect();
    if let Some(mask) = header.mask {
        for (byte, key) in payload.iter_mut().zip(mask.iter().cycle()) {
            *byte ^= key;
        }
    }
    Some(String::from_utf8_lossy(&payload).into_owned())
}
