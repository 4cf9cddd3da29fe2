use anyhow::Result;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    error::ClientError,
    reconnect::{self, ClientEvent, ClientHandle},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let connector = args.server.connector(args.write_timeout());
    info!("connecting to {}", args.server);
    let (handle, mut events) = reconnect::spawn(connector, args.controller_config());

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let outcome = run_client_loop(&handle, &mut events, &mut stdin, &mut input).await;
    handle.quit();
    handle.closed().await;

    outcome
}

async fn run_client_loop(
    handle: &ClientHandle,
    events: &mut mpsc::Receiver<ClientEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if !render_event(event).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, handle).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                write_stdout("*** leaving chat").await?;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    handle: &ClientHandle,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match handle.submit(text) {
        Ok(()) => Ok(true),
        Err(ClientError::NotConnected) => {
            write_stderr("!!! not connected, message not sent").await?;
            Ok(true)
        }
        Err(ClientError::Backlogged) => {
            write_stderr("!!! hub is not keeping up, message not sent").await?;
            Ok(true)
        }
        Err(ClientError::Closed) => Ok(false),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Prints one event. Returns `false` once the controller is gone.
async fn render_event(event: ClientEvent) -> io::Result<bool> {
    match event {
        ClientEvent::Connected { endpoint } => {
            write_stdout(&format!("*** connected to {endpoint}")).await?;
        }
        ClientEvent::Line(line) => write_stdout(&line).await?,
        ClientEvent::Disconnected { reason } => {
            write_stdout(&format!("*** connection lost: {reason}")).await?;
        }
        ClientEvent::Retrying {
            attempt,
            delay,
            error,
        } => {
            warn!(attempt, %error, "connect attempt failed");
            write_stdout(&format!(
                "*** reconnecting in {}s (attempt {})",
                delay.as_secs(),
                attempt + 1
            ))
            .await?;
        }
        ClientEvent::Rejected(_) => write_stderr("!!! not connected, message not sent").await?,
        ClientEvent::Dropped(count) => write_stderr(&format!("!!! {count} events dropped")).await?,
        ClientEvent::Terminated => {
            write_stdout("*** disconnected").await?;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
