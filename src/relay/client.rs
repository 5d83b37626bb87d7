//! Console client.
//!
//! Connects to the relay, answers the `ready` prompt with the username,
//! prints relayed events through the configured templates and turns console
//! input into protocol lines.
use futures::SinkExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use super::codec::LineCodec;
use super::config::{render, RelayConfig, Templates};
use super::message::Command;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Unknown command \"{0}\"")]
    UnknownCommand(String),
}

/// Translate one line of console input into a protocol line.
///
/// Returns `Ok(None)` for blank input.
pub fn translate_input(input: &str) -> Result<Option<String>, ClientError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }

    let Some(rest) = input.strip_prefix('/') else {
        return Ok(Some(Command::new("message", input).to_client_line()));
    };

    let (name, body) = match rest.split_once(char::is_whitespace) {
        Some((name, body)) => (name, body.trim_start()),
        None => (rest, ""),
    };

    let command = match name {
        "enter" | "ignore" => Command::new(name, body),
        "leave" | "disconnect" => Command::new(name, ""),
        other => return Err(ClientError::UnknownCommand(other.to_owned())),
    };
    Ok(Some(command.to_client_line()))
}

/// Render a relayed event for display. `None` for events that print
/// nothing, including this user's own messages.
pub fn render_event(command: &Command, me: &str, templates: &Templates) -> Option<String> {
    let user = command.username.as_deref().unwrap_or_default();
    let body = command.body.as_str();
    let text = match command.name.as_str() {
        "connect" => render(&templates.has_entered_the_lobby_message, &[user]),
        "disconnect" => render(&templates.has_left_the_lobby_message, &[user]),
        "enter" => render(&templates.has_entered_the_room_message, &[user, body]),
        "leave" => render(&templates.has_left_the_room_message, &[user, body]),
        "message" if user != me => render(&templates.received_a_message, &[user, body]),
        "ignoring" => render(&templates.ignoring_message, &[body]),
        "unrecognized" => "The server did not understand that command".to_owned(),
        _ => return None,
    };
    Some(text)
}

/// Connect as `username` and bridge the console to the relay until either
/// side closes.
pub async fn run(
    config: &RelayConfig,
    username: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.hostname, config.port);
    let socket = TcpStream::connect(&addr).await?;
    info!(%addr, "connected");

    let mut framed = Framed::new(socket, LineCodec::new(config.max_line_length));
    let mut console = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("server closed the connection");
                        return Ok(());
                    }
                };

                let command = Command::parse_server(&line);
                if command.name == "ready" {
                    framed.send(Command::new("user", username).to_client_line()).await?;
                } else if let Some(text) = render_event(&command, username, &config.templates) {
                    println!("{text}");
                } else {
                    debug!(%line, "nothing to display");
                }
            }

            input = console.next_line() => {
                let Some(input) = input? else {
                    return Ok(());
                };
                match translate_input(&input) {
                    Ok(Some(line)) => {
                        let leaving = line.starts_with("/disconnect");
                        framed.send(line).await?;
                        if leaving {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                }
            }
        }
    }
}
