//! Unit tests for child output sinks.

#![cfg(unix)]

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use marionette::lifecycle::output::pipe_lines;

/// A child that prints invalid UTF-8 and an oversize line keeps running
/// and exits cleanly; the sink keeps draining its output.
#[tokio::test]
async fn undecodable_output_does_not_close_the_pipe() {
    let script = "printf '\\377\\n'; \
                  head -c 70000 /dev/zero | tr '\\0' x; echo; \
                  sleep 0.3; \
                  i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done; \
                  exit 0";
    let mut child = Command::new("sh")
        .args(["-c", script])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    pipe_lines("test", "stdout", child.stdout.take().unwrap());

    let status = tokio::time::timeout(Duration::from_secs(30), child.wait())
        .await
        .expect("child must finish")
        .unwrap();

    assert!(status.success(), "child status = {status:?}");
}
