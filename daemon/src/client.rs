// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io;
use std::net::Ipv4Addr;

use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use log::debug;
use nails::Config;
use nails::execution::{ChildInput, ChildOutput, ExitCode};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum ConnectionError {
    /// An error before the connection was established: the server may be stale or absent,
    /// and a restart is reasonable.
    PreConnect(String),
    /// An error after the connection was established.
    PostConnect(String),
}

async fn handle_client_output(
    mut stdio_read: impl Stream<Item = ChildOutput> + Unpin,
) -> Result<(), io::Error> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    while let Some(output) = stdio_read.next().await {
        match output {
            ChildOutput::Stdout(bytes) => stdout.write_all(&bytes).await?,
            ChildOutput::Stderr(bytes) => stderr.write_all(&bytes).await?,
        }
    }
    stdout.flush().await?;
    stderr.flush().await
}

async fn handle_client_input(mut stdin_write: mpsc::Sender<ChildInput>) -> Result<(), io::Error> {
    use nails::execution::send_to_io;
    use std::io::Read;

    // Sync stdin reads run on their own thread, forwarding via a channel.
    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<Box<[u8]>>();
    let _handle = tokio::task::spawn_blocking(move || {
        let mut sync_stdin = std::io::stdin();
        let mut buf = vec![0; 8192];
        loop {
            match sync_stdin.read(&mut buf[..]) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if sender.send(buf[0..read].to_vec().into_boxed_slice()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(input_bytes) = receiver.recv().await {
        stdin_write
            .send(ChildInput::Stdin(bytes::Bytes::copy_from_slice(&input_bytes)))
            .await
            .map_err(send_to_io)?;
    }
    Ok(())
}

///
/// Executes the given command against the server at the given local port, streaming stdio
/// live, and returns the exit code.
///
pub async fn client_execute(
    port: u16,
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
) -> Result<i32, ConnectionError> {
    use nails::execution::{Command, child_channel};

    let working_dir =
        std::env::current_dir().map_err(|e| ConnectionError::PreConnect(e.to_string()))?;

    let config = Config::default();
    let command = Command {
        command,
        args,
        env,
        working_dir,
    };

    let (stdin_write, stdin_read) = child_channel::<ChildInput>();
    let _input_handler = tokio::spawn(handle_client_input(stdin_write));

    let localhost = Ipv4Addr::new(127, 0, 0, 1);
    let socket = TcpStream::connect((localhost, port)).await.map_err(|err| {
        ConnectionError::PreConnect(format!("Error connecting to the local server: {err}"))
    })?;

    let mut child = nails::client::handle_connection(config, socket, command, async { stdin_read })
        .await
        .map_err(|err| ConnectionError::PostConnect(format!("Client error: {err}")))?;

    let output_stream = child.output_stream.take().unwrap();
    let output_handler = tokio::spawn(handle_client_output(output_stream));

    let exit_code: ExitCode = child
        .wait()
        .await
        .map_err(|err| ConnectionError::PostConnect(format!("Client error: {err}")))?;

    debug!("Connection complete with {exit_code:?}");
    let () = output_handler
        .await
        .map_err(|join_error| {
            ConnectionError::PostConnect(format!("Error joining output task: {join_error}"))
        })?
        .map_err(|err| ConnectionError::PostConnect(format!("Output stream error: {err}")))?;

    Ok(exit_code.0)
}
