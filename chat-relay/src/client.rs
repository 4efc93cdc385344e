use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    message::{BROADCAST_MARKER, ClientFrame, Delivery, encode},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One line of terminal input, already interpreted.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Quit,
    Direct { to: &'a str, text: &'a str },
    Broadcast(&'a str),
}

fn parse_input(line: &str) -> Option<Input<'_>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if line.eq_ignore_ascii_case("/quit") {
        return Some(Input::Quit);
    }
    if let Some(rest) = line.strip_prefix('@') {
        return match rest.split_once(char::is_whitespace) {
            Some((to, text)) if !to.is_empty() && !text.trim().is_empty() => Some(Input::Direct {
                to,
                text: text.trim(),
            }),
            _ => None,
        };
    }
    Some(Input::Broadcast(line))
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut socket = establish_connection(&args.server).await?;
    send_frame(
        &mut socket,
        &ClientFrame::Login {
            user_id: args.user_id.clone(),
        },
    )
    .await?;
    write_stdout(&format!("*** connected as {}", args.user_id)).await?;

    let mut stdin = BufReader::new(io::stdin());
    let mut input = String::new();

    run_client_loop(&mut socket, &mut stdin, &mut input, &args.user_id).await?;
    shutdown_connection(&mut socket).await;

    Ok(())
}

async fn establish_connection(server: &str) -> Result<Socket> {
    let (socket, _) = connect_async(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    info!("connected to {server}");
    Ok(socket)
}

async fn run_client_loop(
    socket: &mut Socket,
    stdin: &mut BufReader<io::Stdin>,
    input: &mut String,
    user_id: &str,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_message = socket.next() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, socket, user_id).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Result<bool> {
    match message {
        Some(Ok(Message::Text(text))) => {
            match serde_json::from_str::<Delivery>(&text) {
                Ok(Delivery { from, message }) => {
                    write_stdout(&format!("<{from}> {message}")).await?
                }
                Err(error) => debug!(%error, "ignoring unexpected frame from relay"),
            }
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("failed to read from relay"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    socket: &mut Socket,
    user_id: &str,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let frame = match parse_input(input) {
        None => return Ok(true),
        Some(Input::Quit) => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Some(Input::Direct { to, text }) => ClientFrame::Message {
            from: user_id.to_string(),
            to: Some(to.to_string()),
            message: text.to_string(),
        },
        Some(Input::Broadcast(text)) => ClientFrame::Message {
            from: user_id.to_string(),
            to: Some(BROADCAST_MARKER.to_string()),
            message: text.to_string(),
        },
    };

    send_frame(socket, &frame).await?;
    Ok(true)
}

async fn send_frame(socket: &mut Socket, frame: &ClientFrame) -> Result<()> {
    let text = encode(frame).context("failed to encode frame")?;
    socket
        .send(Message::Text(text))
        .await
        .context("failed to send frame")
}

async fn shutdown_connection(socket: &mut Socket) {
    if let Err(error) = socket.close(None).await {
        warn!(?error, "failed to close connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
