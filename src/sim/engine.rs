// src/sim/engine.rs
//
// Transport to the battle simulator.
//
// The simulator speaks the `simulate-battle` stdio protocol: `>`-prefixed
// command lines in, blank-line-separated messages out:
//
//   update\n<log lines>
//   sideupdate\n<p1|p2>\n<private lines>
//   end\n<json>
//
// `BattleEngine` abstracts the transport so tests can drive the battle loop
// with the in-process scripted engine.

use std::process::Stdio;

use anyhow::{anyhow, Context};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::rl::learner_client::BoxFuture;
use crate::rl::state_tracker::Side;

pub const DEFAULT_ENGINE_CMD: &str = "node pokemon-showdown simulate-battle";

#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// Public battle log lines.
    Update(Vec<String>),
    /// Private lines for one side (requests, errors).
    SideUpdate { side: Side, lines: Vec<String> },
    End(JsonValue),
}

impl EngineMessage {
    /// Parse one blank-line-delimited chunk. Unknown headers yield `None`.
    pub fn parse(chunk: &str) -> Option<Self> {
        let chunk = chunk.trim_matches('\n');
        let (header, rest) = match chunk.split_once('\n') {
            Some((h, r)) => (h, r),
            None => (chunk, ""),
        };
        match header.trim() {
            "update" => Some(EngineMessage::Update(collect_lines(rest))),
            "sideupdate" => {
                let (side, body) = rest.split_once('\n').unwrap_or((rest, ""));
                let side = Side::parse(side.trim())?;
                Some(EngineMessage::SideUpdate {
                    side,
                    lines: collect_lines(body),
                })
            }
            "end" => {
                let value = serde_json::from_str(rest.trim()).unwrap_or(JsonValue::Null);
                Some(EngineMessage::End(value))
            }
            _ => None,
        }
    }
}

fn collect_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Spectator view of update lines: after `|split|pN` the next line is the
/// owner's private copy and the one after it the public twin.
pub fn spectator_lines(lines: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut skip_next = false;
    for line in lines {
        if skip_next {
            skip_next = false;
            continue;
        }
        if line.starts_with("|split|") {
            skip_next = true;
            continue;
        }
        out.push(line.clone());
    }
    out
}

/// Split a `|cmd|rest` line into `(cmd, rest)`.
pub fn split_protocol_line(line: &str) -> Option<(&str, &str)> {
    let body = line.strip_prefix('|')?;
    Some(body.split_once('|').unwrap_or((body, "")))
}

pub trait BattleEngine: Send {
    /// Write one command line (without trailing newline).
    fn send(&mut self, line: String) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Next message, or `None` once the engine closed its output.
    ///
    /// Must be cancel-safe: the driver drains ready messages by polling this
    /// future once and dropping it when it is not ready.
    fn next_message(&mut self) -> BoxFuture<'_, anyhow::Result<Option<EngineMessage>>>;
}

/// Simulator child process driven over stdio.
pub struct ProcessEngine {
    child: Child,
    stdin: ChildStdin,
    messages: mpsc::Receiver<EngineMessage>,
}

impl ProcessEngine {
    /// Spawn `cmdline` (whitespace-separated program and args).
    pub fn spawn(cmdline: &str) -> anyhow::Result<Self> {
        let mut parts = cmdline.split_whitespace();
        let program = parts.next().ok_or_else(|| anyhow!("empty engine command"))?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn engine '{cmdline}'"))?;
        let stdin = child.stdin.take().context("engine stdin not piped")?;
        let stdout = child.stdout.take().context("engine stdout not piped")?;

        let (tx, messages) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut chunk = String::new();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.is_empty() => {
                        if let Some(msg) = EngineMessage::parse(&chunk) {
                            if tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        chunk.clear();
                    }
                    Ok(Some(line)) => {
                        chunk.push_str(&line);
                        chunk.push('\n');
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "engine stdout read failed");
                        break;
                    }
                }
            }
            if let Some(msg) = EngineMessage::parse(&chunk) {
                let _ = tx.send(msg).await;
            }
            debug!("engine output closed");
        });

        Ok(Self { child, stdin, messages })
    }

    pub async fn shutdown(mut self) {
        drop(self.stdin);
        if let Err(err) = self.child.kill().await {
            debug!(error = %err, "engine kill failed");
        }
    }
}

impl BattleEngine for ProcessEngine {
    fn send(&mut self, line: String) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await?;
            Ok(())
        })
    }

    fn next_message(&mut self) -> BoxFuture<'_, anyhow::Result<Option<EngineMessage>>> {
        Box::pin(async move { Ok(self.messages.recv().await) })
    }
}
