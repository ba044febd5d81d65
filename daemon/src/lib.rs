// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The persistent server and its client: a long-lived process hosts one scheduler, and
//! accepts framed invocations (command, args, env, cwd, stdio) over a local socket, one
//! fresh session per connection.

mod client;
pub use client::{ConnectionError, client_execute};
mod pidfile;
pub use pidfile::{Metadata, PidFile, config_fingerprint, read_metadata};
mod server;
pub use server::{RawFdExecution, RawFdRunner, Server};

#[cfg(test)]
mod tests;
