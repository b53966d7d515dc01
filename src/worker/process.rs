//! One worker process and its stdio pipes.

use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::WorkerRequest;
use super::frame::{self, RequestHeader, ResponseHeader};
use crate::proxy::MethodKey;
use crate::server::config::WorkerConfig;
use crate::{BifrostError, Result};

pub(crate) struct WorkerProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    pid: Option<u32>,
}

impl WorkerProcess {
    /// Spawn one worker. `slot` only labels its log output.
    pub(crate) fn spawn(config: &WorkerConfig, slot: usize) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| BifrostError::Spawn("empty worker command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| BifrostError::Spawn(format!("{program}: {e}")))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BifrostError::Spawn("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BifrostError::Spawn("worker stdout not captured".to_string()))?;

        // stderr is diagnostics only; forward it to the log
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker = slot, ?pid, "{line}");
                }
            });
        }

        debug!(worker = slot, ?pid, %program, "worker spawned");

        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            pid,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send one request and wait for its reply.
    ///
    /// The outer error means the process is unusable (pipe closed, garbage
    /// on stdout); the inner result is the worker's answer for this call.
    pub(crate) async fn exchange(
        &mut self,
        method: &MethodKey,
        request: &WorkerRequest,
        max_frame_bytes: u32,
    ) -> Result<Result<Bytes>> {
        let header = RequestHeader {
            method: method.to_string(),
            metadata: request.metadata.clone(),
        };
        frame::write_frame(&mut self.stdin, &header, &request.payload)
            .await
            .map_err(|e| BifrostError::WorkerCrashed(format!("write failed: {e}")))?;

        let reply = frame::read_frame::<ResponseHeader, _>(&mut self.stdout, max_frame_bytes)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidData => BifrostError::MalformedResponse(e.to_string()),
                _ => BifrostError::WorkerCrashed(format!("read failed: {e}")),
            })?;

        match reply {
            None => Err(BifrostError::WorkerCrashed(
                "worker closed stdout".to_string(),
            )),
            Some((ResponseHeader { error: Some(fault) }, _)) => Ok(Err(BifrostError::Worker {
                code: fault.code,
                message: fault.message,
            })),
            Some((ResponseHeader { error: None }, payload)) => Ok(Ok(payload)),
        }
    }

    /// Resolves when the process exits, with a description of how.
    pub(crate) async fn exited(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        }
    }

    pub(crate) async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(pid = ?self.pid, error = %e, "worker already gone");
        }
    }
}
