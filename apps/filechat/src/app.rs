//! Terminal front end: bridges stdin to the connection and prints inbound
//! events as status lines.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use filechat_data_channel::{
    ChatServer, DirectorySink, Inbound, Outbound, Receiver, ServerEvent, connect,
};
use filechat_protocol::is_farewell;

use crate::config::Config;

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Send(PathBuf),
    Quit,
    Usage(&'static str),
}

/// Parses a line typed by the operator. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "/quit" {
        return Some(Command::Quit);
    }
    if let Some(rest) = trimmed.strip_prefix("/send") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            let path = rest.trim();
            if path.is_empty() {
                return Some(Command::Usage("usage: /send <path>"));
            }
            return Some(Command::Send(PathBuf::from(path)));
        }
    }
    Some(Command::Chat(line.to_string()))
}

/// Renders an inbound event for the terminal.
pub fn status_line(event: &Inbound) -> String {
    match event {
        Inbound::Chat(line) => line.to_string(),
        Inbound::File(stored) => match &stored.path {
            Some(path) => format!(
                "[RECEIVED] {} ({} bytes) saved as {}",
                stored.filename,
                stored.size,
                path.display()
            ),
            None => format!("[RECEIVED] {} ({} bytes)", stored.filename, stored.size),
        },
        Inbound::Rejected { header, reason } => {
            format!("[REJECTED] {header}: {reason}")
        }
        Inbound::Malformed(e) => format!("[ERROR] invalid file transfer command: {e}"),
    }
}

fn server_status_line(event: &ServerEvent) -> String {
    match event {
        ServerEvent::Connected { id, peer } => format!("[INFO] {id} connected from {peer}"),
        ServerEvent::Inbound { id, event } => format!("{id} {}", status_line(event)),
        ServerEvent::Disconnected { id, error: None } => format!("[INFO] {id} disconnected"),
        ServerEvent::Disconnected {
            id,
            error: Some(e),
        } => format!("[INFO] {id} disconnected: {e}"),
    }
}

/// Runs the server until `/quit`, end of input or cancellation.
pub async fn run_server(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let identity = config.identity()?;
    let server = ChatServer::new(config.server_config()?);
    let listener = server.bind().await?;
    if let Some(addr) = server.local_addr().await {
        println!("Server listening on {addr}");
    }

    let mut events = server.subscribe();
    let serve_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => match event {
                Ok(event) => println!("{}", server_status_line(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },

            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    None => {}
                    Some(Command::Quit) => break,
                    Some(Command::Usage(usage)) => println!("{usage}"),
                    Some(Command::Send(path)) => {
                        let peers = server.broadcast(Outbound::File(path.clone())).await;
                        println!("[INFO] sending {} to {peers} peer(s)", path.display());
                    }
                    Some(Command::Chat(text)) => match identity.chat_line(&text) {
                        Ok(line) => {
                            let peers = server.broadcast(Outbound::Line(line.to_string())).await;
                            println!("[SENT] {line} ({peers} peer(s))");
                        }
                        Err(e) => println!("[ERROR] {e}"),
                    },
                }
            }
        }
    }

    server.shutdown();
    match serve_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server error: {e}"),
        Err(e) => tracing::error!("server task failed: {e}"),
    }
    Ok(())
}

/// Connects to the configured server and chats until `bye`, `/quit`, end
/// of input, disconnect or cancellation.
pub async fn run_client(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    let identity = config.identity()?;
    let address = config.address();
    let conn = connect(address.as_str(), &config.client_options(), &cancel).await?;
    println!("Connected to {address} as {}", identity.nickname());

    let (reader, mut writer) = conn.into_split();
    let sink = DirectorySink::with_prefix(&config.download_dir, &config.received_prefix);
    let mut receiver = Receiver::new(reader, sink, config.policy());

    let recv_cancel = cancel.clone();
    let recv_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = recv_cancel.cancelled() => {
                    if let Some(e) = receiver.cancel().await {
                        println!("[ERROR] {e}");
                    }
                    break;
                }

                next = receiver.next() => match next {
                    Ok(Some(event)) => println!("{}", status_line(&event)),
                    Ok(None) => {
                        println!("Connection to server closed.");
                        break;
                    }
                    Err(e) => {
                        println!("Connection to server interrupted: {e}");
                        break;
                    }
                },
            }
        }
        // Stop the input loop once the server is gone.
        recv_cancel.cancel();
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let result = match parse_command(&line) {
            None => continue,
            Some(Command::Quit) => break,
            Some(Command::Usage(usage)) => {
                println!("{usage}");
                continue;
            }
            Some(Command::Send(path)) => writer.send_file(&path).await.map(|header| {
                println!("[SENT] file {header}");
            }),
            Some(Command::Chat(text)) => {
                let sent = writer.send_chat(&identity, &text).await.map(|line| {
                    println!("[SENT] {line}");
                });
                if sent.is_ok() && is_farewell(&text) {
                    break;
                }
                sent
            }
        };

        if let Err(e) = result {
            println!("[ERROR] {e}");
            if e.is_fatal() {
                break;
            }
        }
    }

    cancel.cancel();
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("shutdown failed: {e}");
    }
    if let Err(e) = recv_task.await {
        tracing::error!("receive task failed: {e}");
    }
    Ok(())
}
