// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::channel::oneshot;
use futures::{FutureExt, SinkExt, StreamExt, TryStreamExt, future, sink, stream};
use log::{debug, info};
use nails::Nail;
use nails::execution::{self, ChildInput, ChildOutput, ExitCode, child_channel, sink_for, stream_for};
use pool::Executor;
use syncutil::AsyncLatch;
use tokio::fs::File;
use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};

pub struct Server {
    exit_sender: oneshot::Sender<()>,
    exited_receiver: oneshot::Receiver<Result<(), String>>,
    port: u16,
}

impl Server {
    ///
    /// Spawns the server on a background Task.
    ///
    /// A `port_requested` of 0 requests a random port, readable afterwards via
    /// `Server::port`.
    ///
    pub async fn new(
        executor: Executor,
        port_requested: u16,
        runner: impl RawFdRunner + 'static,
    ) -> Result<Server, String> {
        let listener = TcpListener::bind((Ipv4Addr::new(127, 0, 0, 1), port_requested))
            .await
            .map_err(|e| format!("Could not bind to port {port_requested}: {e:?}"))?;
        let port_actual = listener
            .local_addr()
            .map_err(|e| format!("No local address for listener: {e:?}"))?
            .port();

        // NB: The classic C client requires noisy_stdin; ours does not.
        let config = nails::Config::default().noisy_stdin(false);
        let nail = RawFdNail {
            executor: executor.clone(),
            runner: Arc::new(runner),
        };

        let (exited_sender, exited_receiver) = oneshot::channel();
        let (exit_sender, exit_receiver) = oneshot::channel();

        let _join = executor.native_spawn(Self::serve(
            executor.clone(),
            config,
            nail,
            exit_receiver,
            exited_sender,
            listener,
        ));

        Ok(Server {
            exit_sender,
            exited_receiver,
            port: port_actual,
        })
    }

    ///
    /// The main loop of the server. Public (in effect) via `Server::new`.
    ///
    async fn serve(
        executor: Executor,
        config: nails::Config,
        nail: RawFdNail,
        should_exit: oneshot::Receiver<()>,
        exited: oneshot::Sender<Result<(), String>>,
        listener: TcpListener,
    ) {
        let exit_result = Self::accept_loop(executor, config, nail, should_exit, listener).await;
        info!("Server exiting with {exit_result:?}");
        let _ = exited.send(exit_result);
    }

    async fn accept_loop(
        executor: Executor,
        config: nails::Config,
        nail: RawFdNail,
        mut should_exit: oneshot::Receiver<()>,
        listener: TcpListener,
    ) -> Result<(), String> {
        // Connections in flight hold `read`; a graceful shutdown acquires `write` to prove
        // that all of them have completed.
        let ongoing_connections = Arc::new(RwLock::new(()));

        let result = loop {
            let tcp_stream = match future::select(listener.accept().boxed(), should_exit).await {
                future::Either::Left((Ok((tcp_stream, _addr)), s_e)) => {
                    should_exit = s_e;
                    tcp_stream
                }
                future::Either::Left((Err(e), _)) => {
                    break Err(format!("Server failed to accept connections: {e}"));
                }
                future::Either::Right((_, _)) => {
                    break Ok(());
                }
            };

            debug!("Accepted connection: {tcp_stream:?}");

            // Wait until the connection task has acquired the ongoing-connections lock
            // before accepting another connection, so that shutdown cannot observe an
            // empty lock while a connection is still starting.
            let connection_started = Arc::new(Notify::new());
            let _join = executor.native_spawn({
                let config = config.clone();
                let nail = nail.clone();
                let connection_started = connection_started.clone();
                let ongoing_connections = ongoing_connections.clone();
                async move {
                    let ongoing_connection_guard = ongoing_connections.read().await;
                    connection_started.notify_one();
                    let result =
                        nails::server::handle_connection(config, nail, tcp_stream).await;
                    std::mem::drop(ongoing_connection_guard);
                    result
                }
            });
            connection_started.notified().await;
        };

        // Prove that all connections have completed before exiting.
        debug!("Server waiting for connections to complete...");
        let _ = ongoing_connections.write().await;
        debug!("All connections completed.");
        result
    }

    ///
    /// The port that the server is listening on.
    ///
    pub fn port(&self) -> u16 {
        self.port
    }

    ///
    /// Shuts the server down by refusing new connections and then waiting for all ongoing
    /// connections to complete.
    ///
    pub async fn shutdown(self) -> Result<(), String> {
        // A send failure means the task has already shut down.
        let _ = self.exit_sender.send(());
        self.exited_receiver
            .await
            .map_err(|_| "Server exited uncleanly.".to_owned())?
    }
}

pub struct RawFdExecution {
    pub cmd: execution::Command,
    pub cancelled: AsyncLatch,
    pub stdin_fd: RawFd,
    pub stdout_fd: RawFd,
    pub stderr_fd: RawFd,
}

///
/// Implementations run one client invocation against raw stdio file handles (which the
/// caller closes), returning the exit code for the client.
///
pub trait RawFdRunner: Fn(RawFdExecution) -> ExitCode + Send + Sync {}

impl<T: Fn(RawFdExecution) -> ExitCode + Send + Sync> RawFdRunner for T {}

///
/// A Nail implementation that proxies stdio to file handles consumable by the runner.
///
/// If any of stdio is a tty (detected via environment variables set by our client), the
/// relevant protocol stream is ignored and new handles are opened directly on the tty path
/// (addressable as a file on both Linux and macOS).
///
#[derive(Clone)]
struct RawFdNail {
    executor: Executor,
    runner: Arc<dyn RawFdRunner>,
}

impl Nail for RawFdNail {
    fn spawn(&self, cmd: execution::Command) -> Result<nails::server::Child, io::Error> {
        let env = cmd.env.iter().cloned().collect::<HashMap<_, _>>();

        // Handle stdin.
        let (stdin_handle, stdin_sink) = Self::input(Self::ttypath_from_env(&env, 0))?;
        let maybe_stdin_write = if let Some(mut stdin_sink) = stdin_sink {
            let (stdin_write, stdin_read) = child_channel::<ChildInput>();
            // A task propagates the client's input stream into the pipe.
            let _join = self.executor.native_spawn(async move {
                let mut input_stream = stdin_read.map(|child_input| match child_input {
                    ChildInput::Stdin(bytes) => Ok(bytes),
                });
                let _ = stdin_sink.send_all(&mut input_stream).await;
            });
            Some(stdin_write)
        } else {
            // Stdin is handled directly by the TTY.
            None
        };

        // And stdout/stderr.
        let (stdout_stream, stdout_handle) = Self::output(Self::ttypath_from_env(&env, 1))?;
        let (stderr_stream, stderr_handle) = Self::output(Self::ttypath_from_env(&env, 2))?;

        // Cancellation is triggered by client disconnect.
        let cancelled = AsyncLatch::new();
        let shutdown = {
            let cancelled = cancelled.clone();
            async move {
                cancelled.trigger();
            }
        };

        // The runner executes as a blocking task, with its exit code appended to the output
        // stream.
        let nail = self.clone();
        let exit_code = self
            .executor
            .spawn_blocking(
                move || {
                    // This closure captures the stdio handles, and closes them by dropping
                    // them when it completes.
                    (nail.runner)(RawFdExecution {
                        cmd,
                        cancelled,
                        stdin_fd: stdin_handle.as_raw_fd(),
                        stdout_fd: stdout_handle.as_raw_fd(),
                        stderr_fd: stderr_handle.as_raw_fd(),
                    })
                },
                |join_error| {
                    log::error!("Connection runner task failed: {join_error}");
                    ExitCode(1)
                },
            )
            .boxed();

        // Select a single stdout/stderr stream.
        let stdout_stream = stdout_stream.map_ok(ChildOutput::Stdout);
        let stderr_stream = stderr_stream.map_ok(ChildOutput::Stderr);
        let output_stream = stream::select(stdout_stream, stderr_stream).boxed();

        Ok(nails::server::Child::new(
            output_stream,
            maybe_stdin_write,
            exit_code,
            Some(shutdown.boxed()),
        ))
    }
}

impl RawFdNail {
    ///
    /// Returns a readable handle for the runner's stdin, and (unless a TTY carries the data
    /// directly) a sink for the protocol's stdin stream.
    ///
    #[allow(clippy::type_complexity)]
    fn input(
        tty_path: Option<PathBuf>,
    ) -> Result<(Box<dyn AsRawFd + Send>, Option<impl sink::Sink<Bytes>>), io::Error> {
        if let Some(tty_path) = tty_path {
            Ok((Box::new(std::fs::File::open(tty_path)?), None))
        } else {
            let (stdin_reader, stdin_writer) = os_pipe::pipe()?;
            let write_handle =
                File::from_std(unsafe { std::fs::File::from_raw_fd(stdin_writer.into_raw_fd()) });
            Ok((Box::new(stdin_reader), Some(sink_for(write_handle))))
        }
    }

    ///
    /// Returns a (possibly empty) stream for the protocol to read output from, and a
    /// writable handle for the runner's stdout/stderr.
    ///
    #[allow(clippy::type_complexity)]
    fn output(
        tty_path: Option<PathBuf>,
    ) -> Result<
        (
            stream::BoxStream<'static, Result<Bytes, io::Error>>,
            Box<dyn AsRawFd + Send>,
        ),
        io::Error,
    > {
        if let Some(tty_path) = tty_path {
            let tty = std::fs::OpenOptions::new()
                .write(true)
                .create(false)
                .open(tty_path)?;
            Ok((stream::empty().boxed(), Box::new(tty)))
        } else {
            let (pipe_reader, pipe_writer) = os_pipe::pipe()?;
            let read_handle =
                File::from_std(unsafe { std::fs::File::from_raw_fd(pipe_reader.into_raw_fd()) });
            Ok((stream_for(read_handle).boxed(), Box::new(pipe_writer)))
        }
    }

    ///
    /// The tty path for the given fd number, as set by the client's environment variables.
    ///
    fn ttypath_from_env(env: &HashMap<String, String>, fd_number: usize) -> Option<PathBuf> {
        env.get(&format!("GANTRY_TTY_PATH_{fd_number}")).map(PathBuf::from)
    }
}
