//! Network front end.
//!
//! TCP listener on the supervisor's port. Each connection speaks RESP:
//! regular commands are answered from `commands`, and SUBSCRIBE turns the
//! connection into a live feed of supervisor events.

use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::resp::{self, ParseError, RespValue};

use super::commands::{self, glob_match};
use super::events::PublishedEvent;
use super::state::SupervisorState;

/// Maximum bytes buffered for one client before the connection is closed.
const MAX_BUFFER_SIZE: usize = 65536;

pub async fn run_listener(listener: TcpListener, state: Arc<SupervisorState>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, state).await {
                        log::debug!("Client {} error: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(socket: TcpStream, state: Arc<SupervisorState>) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let mut buffer = BytesMut::with_capacity(4096);
    let mut channels: HashSet<String> = HashSet::new();
    let mut patterns: HashSet<String> = HashSet::new();
    let mut events_rx = state.events.subscribe();

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                if buffer.len() > MAX_BUFFER_SIZE {
                    let reply = RespValue::error("ERR max buffer size exceeded");
                    writer.write_all(&reply.serialize()).await?;
                    return Ok(());
                }

                loop {
                    match resp::parse_command(&buffer) {
                        Ok((args, consumed)) => {
                            let _ = buffer.split_to(consumed);
                            if args.is_empty() {
                                continue;
                            }
                            let quit = dispatch(
                                &args,
                                &state,
                                &mut writer,
                                &mut channels,
                                &mut patterns,
                            )
                            .await?;
                            if quit {
                                return Ok(());
                            }
                        }
                        Err(ParseError::Incomplete) => break,
                        Err(e) => {
                            let reply = RespValue::error(&format!("ERR {}", e));
                            writer.write_all(&reply.serialize()).await?;
                            buffer.clear();
                            break;
                        }
                    }
                }
            }
            event = events_rx.recv(), if !channels.is_empty() || !patterns.is_empty() => {
                match event {
                    Ok(event) => {
                        deliver_event(&event, &channels, &patterns, &mut writer).await?;
                    }
                    // Lagging subscribers just lose events.
                    Err(_) => {}
                }
            }
        }
    }
}

/// Execute one command; returns true when the connection should close.
async fn dispatch(
    args: &[bytes::Bytes],
    state: &Arc<SupervisorState>,
    writer: &mut OwnedWriteHalf,
    channels: &mut HashSet<String>,
    patterns: &mut HashSet<String>,
) -> std::io::Result<bool> {
    let command = String::from_utf8_lossy(&args[0]).to_uppercase();

    match command.as_str() {
        "QUIT" => {
            writer.write_all(&RespValue::ok().serialize()).await?;
            return Ok(true);
        }
        "SUBSCRIBE" | "PSUBSCRIBE" => {
            if args.len() < 2 {
                let reply =
                    RespValue::error("ERR wrong number of arguments for 'subscribe' command");
                writer.write_all(&reply.serialize()).await?;
                return Ok(false);
            }
            let kind = if command == "SUBSCRIBE" {
                "subscribe"
            } else {
                "psubscribe"
            };
            for channel in &args[1..] {
                let name = String::from_utf8_lossy(channel).to_string();
                if kind == "subscribe" {
                    channels.insert(name.clone());
                } else {
                    patterns.insert(name.clone());
                }
                let confirm = RespValue::Array(vec![
                    RespValue::bulk(kind),
                    RespValue::bulk(&name),
                    RespValue::Integer((channels.len() + patterns.len()) as i64),
                ]);
                writer.write_all(&confirm.serialize()).await?;
            }
        }
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
            let kind = if command == "UNSUBSCRIBE" {
                "unsubscribe"
            } else {
                "punsubscribe"
            };
            for channel in &args[1..] {
                let name = String::from_utf8_lossy(channel).to_string();
                if kind == "unsubscribe" {
                    channels.remove(&name);
                } else {
                    patterns.remove(&name);
                }
                let confirm = RespValue::Array(vec![
                    RespValue::bulk(kind),
                    RespValue::bulk(&name),
                    RespValue::Integer((channels.len() + patterns.len()) as i64),
                ]);
                writer.write_all(&confirm.serialize()).await?;
            }
        }
        _ => {
            let reply = commands::execute(args, state);
            writer.write_all(&reply.serialize()).await?;
        }
    }

    Ok(false)
}

async fn deliver_event(
    event: &PublishedEvent,
    channels: &HashSet<String>,
    patterns: &HashSet<String>,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    let exact = channels.contains(&event.channel);
    let by_pattern = patterns
        .iter()
        .any(|p| glob_match(p.as_bytes(), event.channel.as_bytes()));
    if !exact && !by_pattern {
        return Ok(());
    }

    let push = RespValue::Array(vec![
        RespValue::bulk("message"),
        RespValue::bulk(&event.channel),
        RespValue::bulk(&event.message),
    ]);
    writer.write_all(&push.serialize()).await
}
