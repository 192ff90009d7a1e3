//! Connection handler
//!
//! Accepts TCP connections, sniffs the protocol and runs one of:
//! - the line session (telnet/netcat clients)
//! - the HTTP path: upgrade to the framed session, or the static page
//!
//! A logged-in connection runs two tasks: the handler task reads and
//! dispatches commands, and a writer task drains the client's mailbox.
//! Every write to the socket goes through the connection's `SharedWriter`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use crate::client::Client;
use crate::error::{AppError, HandshakeError};
use crate::frame::{read_frame, OpCode};
use crate::handshake::{
    accept_key, plain_response, read_request_head, rejection, switching_protocols, RequestHead,
};
use crate::message::{ClientEnvelope, ClientKind, Command, Envelope};
use crate::server::{ChatServer, Flow};
use crate::sniff::{sniff, Protocol};
use crate::text::LineReader;
use crate::types::{sanitize_username, Transport, LOBBY};
use crate::writer::SharedWriter;

const BANNER: &str = "\
╔══════════════════════════════════╗\r\n\
║         Multichat Server         ║\r\n\
╚══════════════════════════════════╝\r\n";

const PROMPT: &str = "Enter your username: ";

const HELP: &str = "
Commands:
  /join  <room>         — join or create a room
  /rooms                — list all rooms
  /users                — list users in current room
  /msg   <user> <text>  — private message
  /quit                 — disconnect

Everything else is a message to your current room.
";

/// Browser client served on plain HTTP GET
const INDEX_HTML: &str = include_str!("../static/index.html");

/// Accept connections forever, one handler task per connection
pub async fn serve(listener: TcpListener, server: Arc<ChatServer>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New TCP connection from {}", addr);
                let server = Arc::clone(&server);

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, server).await {
                        debug!("Connection {} ended: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a new TCP connection
pub async fn handle_connection(stream: TcpStream, server: Arc<ChatServer>) -> Result<(), AppError> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let _ = stream.set_nodelay(true);

    handle_stream(stream, &peer, server).await
}

/// Sniff and serve any byte stream
pub async fn handle_stream<S>(stream: S, peer: &str, server: Arc<ChatServer>) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (protocol, stream) = match sniff(stream).await {
        Ok(sniffed) => sniffed,
        Err(e) => {
            debug!("Connection {} closed before sending anything: {}", peer, e);
            return Ok(());
        }
    };
    debug!("Connection {} routed to {:?}", peer, protocol);

    let (reader, writer) = tokio::io::split(stream);
    let writer = SharedWriter::new(writer);

    match protocol {
        Protocol::Line => line_session(reader, writer, peer, server).await,
        Protocol::Http => http_session(reader, writer, peer, server).await,
    }
}

async fn line_session<R, W>(
    reader: R,
    writer: SharedWriter<W>,
    peer: &str,
    server: Arc<ChatServer>,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let config = server.config();
    let mut lines = LineReader::new(reader, writer.clone(), config.max_line_len);

    writer.write_all(BANNER.as_bytes()).await?;
    writer.write_all(PROMPT.as_bytes()).await?;
    let Some(raw_name) = next_line(&mut lines, config.idle_timeout).await? else {
        return Ok(());
    };

    let (client, mailbox) = Client::new(
        sanitize_username(&raw_name),
        Transport::Line,
        config.mailbox_capacity,
    );
    let drain = tokio::spawn(drain_mailbox(mailbox, writer.clone(), Transport::Line));
    info!(
        "Client {} ({}) connected from {} [line]",
        client.username(),
        client.id(),
        peer
    );

    client.deliver(&Envelope::system(HELP));
    server.dispatch(&client, Command::Join(LOBBY.to_string()));

    let result = loop {
        match next_line(&mut lines, config.idle_timeout).await {
            Ok(Some(line)) => match Command::parse_line(&line) {
                Ok(Some(command)) => {
                    if server.dispatch(&client, command) == Flow::Quit {
                        break Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    client.deliver(&e.into());
                }
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    finish(&server, &client, drain, &writer).await;
    info!("Client {} ({}) disconnected", client.username(), client.id());
    result
}

/// Next line under the idle deadline; a timeout ends the session
async fn next_line<R, W>(
    lines: &mut LineReader<R, W>,
    idle: Duration,
) -> Result<Option<String>, AppError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match timeout(idle, lines.next_line()).await {
        Ok(line) => Ok(line?),
        Err(_) => Err(AppError::Timeout),
    }
}

async fn http_session<R, W>(
    reader: R,
    writer: SharedWriter<W>,
    peer: &str,
    server: Arc<ChatServer>,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let config = server.config();
    let mut reader = BufReader::new(reader);

    let head = match timeout(config.handshake_timeout, read_request_head(&mut reader)).await {
        Ok(Ok(head)) => head,
        Ok(Err(HandshakeError::Io(e))) => return Err(e.into()),
        Ok(Err(err)) => return reject(&writer, err).await,
        Err(_) => return reject(&writer, HandshakeError::Timeout).await,
    };
    debug!("{} {} {}", peer, head.method, head.path);

    if head.route() != config.upgrade_path {
        return serve_static(&writer, &head).await;
    }

    let key = match head.upgrade_key() {
        Ok(key) => key,
        Err(err) => return reject(&writer, err).await,
    };
    writer
        .write_all(switching_protocols(&accept_key(key)).as_bytes())
        .await?;
    debug!("Connection {} upgraded", peer);

    framed_session(reader, writer, peer, server).await
}

/// Answer with a 4xx and close
async fn reject<W>(writer: &SharedWriter<W>, err: HandshakeError) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(rejection(&err).as_bytes()).await?;
    let _ = writer.shutdown().await;
    Err(err.into())
}

async fn serve_static<W>(writer: &SharedWriter<W>, head: &RequestHead) -> Result<(), AppError>
where
    W: AsyncWrite + Unpin,
{
    if head.method != "GET" {
        return reject(writer, HandshakeError::MethodNotAllowed(head.method.clone())).await;
    }
    let response = match head.route() {
        "/" | "/index.html" => plain_response("200 OK", "text/html; charset=utf-8", INDEX_HTML),
        _ => plain_response("404 Not Found", "text/plain; charset=utf-8", "Not found\n"),
    };
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

async fn framed_session<R, W>(
    mut reader: R,
    writer: SharedWriter<W>,
    peer: &str,
    server: Arc<ChatServer>,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let config = server.config();

    let username = loop {
        match next_envelope(&mut reader, &writer, config.max_frame_len).await? {
            Some(env) if env.kind == ClientKind::Login => {
                break sanitize_username(env.text.as_deref().unwrap_or_default());
            }
            Some(env) => debug!("Ignoring {:?} from {} before login", env.kind, peer),
            None => return Ok(()),
        }
    };

    let (client, mailbox) = Client::new(username, Transport::Framed, config.mailbox_capacity);
    let drain = tokio::spawn(drain_mailbox(mailbox, writer.clone(), Transport::Framed));
    info!(
        "Client {} ({}) connected from {} [framed]",
        client.username(),
        client.id(),
        peer
    );

    client.deliver(&Envelope::system(format!("👋  Welcome, {}!", client.username())));
    server.dispatch(&client, Command::Join(LOBBY.to_string()));

    let result = loop {
        match next_envelope(&mut reader, &writer, config.max_frame_len).await {
            Ok(Some(env)) => match Command::try_from(env) {
                Ok(command) => {
                    if server.dispatch(&client, command) == Flow::Quit {
                        break Ok(());
                    }
                }
                Err(e) => {
                    client.deliver(&e.into());
                }
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    finish(&server, &client, drain, &writer).await;
    info!("Client {} ({}) disconnected", client.username(), client.id());
    result
}

/// Next decodable envelope, `None` once the peer sends a close frame
///
/// Pings are answered, other non-text frames and undecodable JSON skipped.
async fn next_envelope<R, W>(
    reader: &mut R,
    writer: &SharedWriter<W>,
    max_len: usize,
) -> Result<Option<ClientEnvelope>, AppError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(frame) = read_frame(reader, max_len).await? else {
            return Ok(None);
        };
        match frame.opcode {
            OpCode::Text => match serde_json::from_slice::<ClientEnvelope>(&frame.payload) {
                Ok(env) => return Ok(Some(env)),
                Err(e) => debug!("Skipping undecodable envelope: {}", e),
            },
            OpCode::Ping => writer.send_frame(OpCode::Pong, &frame.payload).await?,
            other => trace!("Ignoring {:?} frame", other),
        }
    }
}

/// Writer task: mailbox → socket, until the mailbox closes or a write fails
async fn drain_mailbox<W>(
    mut mailbox: mpsc::Receiver<String>,
    writer: SharedWriter<W>,
    transport: Transport,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = mailbox.recv().await {
        let sent = match transport {
            Transport::Line => writer.write_all(wire_line(&msg).as_bytes()).await,
            Transport::Framed => writer.send_frame(OpCode::Text, msg.as_bytes()).await,
        };
        if let Err(e) = sent {
            debug!("Write failed, ending writer task: {}", e);
            return;
        }
    }

    if transport == Transport::Framed {
        let _ = writer.send_frame(OpCode::Close, &[]).await;
    }
    trace!("Writer task ended");
}

/// Line-protocol framing: CRLF everywhere, CRLF terminated
fn wire_line(msg: &str) -> String {
    let mut line = msg.replace("\r\n", "\n").replace('\n', "\r\n");
    line.push_str("\r\n");
    line
}

/// Leave the room, let the writer flush what is queued, close the socket
async fn finish<W>(
    server: &ChatServer,
    client: &Arc<Client>,
    mut drain: JoinHandle<()>,
    writer: &SharedWriter<W>,
) where
    W: AsyncWrite + Unpin,
{
    server.disconnect(client);
    if timeout(server.config().drain_grace, &mut drain).await.is_err() {
        debug!("Writer for {} did not drain in time", client.id());
        drain.abort();
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::config::ServerConfig;
    use crate::frame::encode_frame_with_mask;
    use crate::handshake::MAX_HEAD_LEN;

    fn spawn_stream(server: &Arc<ChatServer>) -> DuplexStream {
        let (client, conn) = duplex(64 * 1024);
        let server = Arc::clone(server);
        tokio::spawn(async move {
            let _ = handle_stream(conn, "test", server).await;
        });
        client
    }

    async fn read_until(stream: &mut DuplexStream, needle: &str) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        timeout(Duration::from_secs(5), async {
            while !String::from_utf8_lossy(&seen).contains(needle) {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "stream closed before {needle:?}");
                seen.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"));
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[test]
    fn test_wire_line() {
        assert_eq!(wire_line("hi"), "hi\r\n");
        assert_eq!(wire_line("a\nb"), "a\r\nb\r\n");
        assert_eq!(wire_line("a\r\nb"), "a\r\nb\r\n");
    }

    #[tokio::test]
    async fn test_line_session_login_and_quit() {
        let server = Arc::new(ChatServer::new(ServerConfig::default()));
        let mut conn = spawn_stream(&server);

        read_until(&mut conn, PROMPT).await;
        conn.write_all(b"alice\r\n").await.unwrap();
        read_until(&mut conn, "✅  Joined #lobby").await;
        assert_eq!(server.registry().get(LOBBY).unwrap().usernames(), vec!["alice"]);

        conn.write_all(b"/quit\n").await.unwrap();
        read_until(&mut conn, "👋  Goodbye!").await;

        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), conn.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(server.registry().get(LOBBY).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_line_idle_timeout_disconnects() {
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(100),
            ..ServerConfig::default()
        };
        let server = Arc::new(ChatServer::new(config));
        let mut conn = spawn_stream(&server);

        read_until(&mut conn, PROMPT).await;
        conn.write_all(b"alice\n").await.unwrap();
        read_until(&mut conn, "Joined #lobby").await;

        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), conn.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(server.registry().get(LOBBY).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_framed_session_login_and_ping() {
        let server = Arc::new(ChatServer::new(ServerConfig::default()));
        let mut conn = spawn_stream(&server);

        conn.write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();
        read_until(&mut conn, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n").await;

        let mask = Some([1, 2, 3, 4]);
        let login = br#"{"type":"login","text":"bob"}"#;
        conn.write_all(&encode_frame_with_mask(OpCode::Text, login, mask))
            .await
            .unwrap();

        let mut frames = Vec::new();
        while frames.len() < 3 {
            let frame = read_frame(&mut conn, 1 << 20).await.unwrap().unwrap();
            frames.push(String::from_utf8(frame.payload).unwrap());
        }
        assert!(frames[0].contains("Welcome, bob"));
        assert!(frames[1].contains("Joined #lobby"));
        assert!(frames[2].contains("\"type\":\"users\""));

        conn.write_all(&encode_frame_with_mask(OpCode::Ping, b"tick", mask))
            .await
            .unwrap();
        let pong = read_frame(&mut conn, 1 << 20).await.unwrap().unwrap();
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(pong.payload, b"tick");

        conn.write_all(&encode_frame_with_mask(OpCode::Close, &[], mask))
            .await
            .unwrap();
        let close = read_frame(&mut conn, 1 << 20).await.unwrap();
        assert!(close.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_envelope_is_skipped() {
        let server = Arc::new(ChatServer::new(ServerConfig::default()));
        let mut conn = spawn_stream(&server);

        conn.write_all(
            b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: x3JJHMbDL1EzLkh9GBhXDw==\r\n\r\n",
        )
        .await
        .unwrap();
        read_until(&mut conn, "\r\n\r\n").await;

        let mask = Some([9, 8, 7, 6]);
        for payload in [&b"not json"[..], br#"{"type":"login","text":"carol"}"#] {
            conn.write_all(&encode_frame_with_mask(OpCode::Text, payload, mask))
                .await
                .unwrap();
        }
        let frame = read_frame(&mut conn, 1 << 20).await.unwrap().unwrap();
        assert!(String::from_utf8(frame.payload).unwrap().contains("Welcome, carol"));
    }

    #[tokio::test]
    async fn test_bad_upgrade_rejected() {
        let server = Arc::new(ChatServer::new(ServerConfig::default()));
        let mut conn = spawn_stream(&server);

        conn.write_all(b"GET /ws HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = String::new();
        timeout(Duration::from_secs(5), conn.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_misrouted_name_rejected_immediately() {
        let config = ServerConfig {
            handshake_timeout: Duration::from_secs(30),
            ..ServerConfig::default()
        };
        let server = Arc::new(ChatServer::new(config));
        let mut conn = spawn_stream(&server);

        conn.write_all(b"Gabriel\r\n").await.unwrap();
        let response = read_until(&mut conn, "\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let server = Arc::new(ChatServer::new(ServerConfig::default()));
        let mut conn = spawn_stream(&server);

        let mut flood = b"GET /".to_vec();
        flood.resize(2 * MAX_HEAD_LEN, b'a');
        conn.write_all(&flood).await.unwrap();
        let response = read_until(&mut conn, "\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 431 "));
    }

    #[tokio::test]
    async fn test_static_page() {
        let server = Arc::new(ChatServer::new(ServerConfig::default()));
        let mut conn = spawn_stream(&server);

        conn.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = String::new();
        timeout(Duration::from_secs(5), conn.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("text/html"));
        assert!(response.ends_with(INDEX_HTML));
    }
}
