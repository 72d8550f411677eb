use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{cmd} i/o: {source}")]
    Io {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{cmd} exited with code {code:?}")]
    Exit {
        cmd: String,
        code: Option<i32>,
        output: Vec<u8>,
    },
}

impl CommandError {
    /// Combined stdout and stderr of a command that exited unsuccessfully.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            CommandError::Exit { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Runs external programs for the command backed firewall and authorization.
#[async_trait]
pub trait CommandExecutor: Send + Sync + std::fmt::Debug {
    /// Runs `cmd args...`, feeding `stdin` when given, and returns stdout.
    async fn execute(
        &self,
        cmd: &str,
        stdin: Option<&[u8]>,
        args: &[String],
    ) -> Result<Vec<u8>, CommandError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        cmd: &str,
        stdin: Option<&[u8]>,
        args: &[String],
    ) -> Result<Vec<u8>, CommandError> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                cmd: cmd.to_string(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await.map_err(|source| CommandError::Io {
                cmd: cmd.to_string(),
                source,
            })?;
            drop(pipe);
        }

        let out = child
            .wait_with_output()
            .await
            .map_err(|source| CommandError::Io {
                cmd: cmd.to_string(),
                source,
            })?;

        if !out.status.success() {
            let mut output = out.stdout;
            output.extend_from_slice(&out.stderr);
            return Err(CommandError::Exit {
                cmd: cmd.to_string(),
                code: out.status.code(),
                output,
            });
        }
        Ok(out.stdout)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Invocation {
        pub cmd: String,
        pub stdin: Option<Vec<u8>>,
        pub args: Vec<String>,
    }

    /// Records every invocation and replays queued results, defaulting to an
    /// empty stdout.
    #[derive(Debug, Default)]
    pub struct RecordingExecutor {
        pub calls: Mutex<Vec<Invocation>>,
        pub results: Mutex<VecDeque<Result<Vec<u8>, CommandError>>>,
    }

    impl RecordingExecutor {
        pub fn push_result(&self, result: Result<Vec<u8>, CommandError>) {
            self.results.lock().push_back(result);
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(
            &self,
            cmd: &str,
            stdin: Option<&[u8]>,
            args: &[String],
        ) -> Result<Vec<u8>, CommandError> {
            self.calls.lock().push(Invocation {
                cmd: cmd.to_string(),
                stdin: stdin.map(<[u8]>::to_vec),
                args: args.to_vec(),
            });
            self.results.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }
}
