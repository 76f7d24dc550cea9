//! Interactive client for poking at a running relay by hand.

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use http::HeaderValue;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "wsproxy-client")]
#[command(about = "Send test messages through a wsproxy-rs relay")]
struct Cli {
    #[arg(long, env = "SERVER_URL", default_value = "ws://localhost:8080")]
    server_url: String,

    #[arg(long, env = "DEEPGRAM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Send the key as an Authorization header instead of subprotocols
    #[arg(long, env = "USE_AUTH_HEADER")]
    use_auth_header: bool,
}

enum Command {
    Config,
    Text(String),
    Binary(Vec<u8>),
    Exit,
    Help,
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim() == "config" {
            Command::Config
        } else if line.trim() == "exit" {
            Command::Exit
        } else if let Some(text) = line.strip_prefix("text:") {
            Command::Text(text.to_string())
        } else if let Some(data) = line.strip_prefix("binary:") {
            Command::Binary(data.as_bytes().to_vec())
        } else {
            Command::Help
        }
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  config - Send a Settings message");
    println!("  text:<message> - Send a text message");
    println!("  binary:<message> - Send a binary message");
    println!("  exit - Close connection and exit");
}

fn print_text(text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("Received message: {}", pretty),
            Err(_) => println!("Received message: {}", text),
        },
        Err(_) => println!("Received message: {}", text),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Some(api_key) = cli.api_key else {
        bail!("DEEPGRAM_API_KEY environment variable is required");
    };

    let mut request = cli
        .server_url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid server URL {}", cli.server_url))?;

    let method = if cli.use_auth_header {
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Token {}", api_key)).context("invalid API key")?,
        );
        "Authorization header"
    } else {
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&format!("token, {}", api_key)).context("invalid API key")?,
        );
        "subprotocol"
    };

    println!("Connecting to {} with API key via {}...", cli.server_url, method);
    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {}", cli.server_url))?;
    println!("Connected to server");
    print_help();

    let (mut sink, mut stream) = socket.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Closing connection...");
                sink.send(Message::Close(None)).await.ok();
                stdin_open = false;
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("failed to read stdin")? else {
                    stdin_open = false;
                    sink.send(Message::Close(None)).await.ok();
                    continue;
                };
                match Command::parse(&line) {
                    Command::Config => {
                        sink.send(Message::Text(r#"{"type":"Settings"}"#.to_string())).await?;
                        println!("Sent Settings message");
                    }
                    Command::Text(text) => {
                        sink.send(Message::Text(text)).await?;
                        println!("Sent text message");
                    }
                    Command::Binary(data) => {
                        sink.send(Message::Binary(data)).await?;
                        println!("Sent binary message");
                    }
                    Command::Exit => {
                        println!("Closing connection...");
                        sink.send(Message::Close(None)).await?;
                        stdin_open = false;
                    }
                    Command::Help => print_help(),
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => print_text(&text),
                Some(Ok(Message::Binary(data))) => {
                    println!("Received binary data: {} bytes", data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    match frame {
                        Some(frame) => println!("Connection closed: {} - {}", u16::from(frame.code), frame.reason),
                        None => println!("Connection closed: 1005 - "),
                    }
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => bail!("WebSocket error: {}", e),
                None => {
                    println!("Connection closed");
                    return Ok(());
                }
            }
        }
    }
}
