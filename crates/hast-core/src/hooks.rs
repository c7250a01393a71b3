//! Event hook execution.
//!
//! A resource may name a program to run when something happens to it. The
//! hook gets the event name and the resource name as arguments, runs
//! detached, and is never waited for.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

/// Start `program` with `args` and return without waiting for it.
pub fn exec(program: &str, args: &[&str]) {
    match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(child) => debug!(%program, ?args, pid = ?child.id(), "Hook started"),
        Err(err) => warn!(%program, ?args, error = %err, "Unable to execute hook"),
    }
}
