// SPDX-License-Identifier: GPL-2.0
//
// inputboostd: control socket.
//
// Line-oriented Unix-socket endpoint for collaborators outside the input
// subsystem: inject a boost through the same debounce gate, or read the
// metrics snapshot. One command per connection.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::boost::BoostEngine;
use crate::debounce::Debouncer;
use crate::dispatch::Dispatcher;
use crate::stats::Counters;

pub struct ControlContext {
    pub debouncer: Arc<Debouncer>,
    pub dispatcher: Arc<Dispatcher>,
    pub counters: Arc<Counters>,
    pub engine: Arc<BoostEngine>,
}

pub struct ControlServer {
    shutdown: Arc<AtomicBool>,
    path: PathBuf,
    _thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn spawn(path: PathBuf, ctx: ControlContext) -> Result<Self> {
        // A previous instance may have left its socket behind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind control socket {}", path.display()))?;
        listener
            .set_nonblocking(true)
            .context("failed to set control socket non-blocking")?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("control-socket".to_string())
            .spawn(move || accept_loop(listener, ctx, thread_shutdown))
            .context("failed to spawn control socket thread")?;

        info!("control socket listening on {}", path.display());
        Ok(Self {
            shutdown,
            path,
            _thread: Some(thread),
        })
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self._thread.take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn accept_loop(listener: UnixListener, ctx: ControlContext, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(err) = handle_client(stream, &ctx) {
                    warn!("control: client error: {:#}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                warn!("control: accept failed: {}", err);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_client(stream: UnixStream, ctx: &ControlContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let mut stream = stream;
    match line.trim() {
        "ping" => writeln!(stream, "pong")?,
        "boost" => {
            ctx.debouncer.external_boost_trigger(&ctx.dispatcher);
            writeln!(stream, "ok")?;
        }
        "stats" => {
            let metrics = ctx.counters.snapshot(ctx.engine.is_active());
            writeln!(stream, "{}", serde_json::to_string(&metrics)?)?;
        }
        other => writeln!(stream, "err unknown command '{}'", other)?,
    }
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Tunables, TunablesHandle};
    use crate::provider::{BoostOps, MockBoost};

    fn test_server(dir: &std::path::Path) -> (Arc<MockBoost>, ControlServer, PathBuf) {
        let mock = Arc::new(MockBoost::new());
        let counters = Counters::new();
        let handle = TunablesHandle::new(Tunables::default());
        let engine = Arc::new(
            BoostEngine::spawn("top-app", Arc::clone(&mock) as Arc<dyn BoostOps>, handle.clone(), Arc::clone(&counters))
                .unwrap(),
        );
        let dispatcher = Arc::new(Dispatcher::spawn(Arc::clone(&engine), &[], 2).unwrap());
        let debouncer = Arc::new(Debouncer::new(handle, Arc::clone(&counters)));

        let path = dir.join("inputboostd.sock");
        let server = ControlServer::spawn(
            path.clone(),
            ControlContext {
                debouncer,
                dispatcher,
                counters,
                engine,
            },
        )
        .unwrap();
        (mock, server, path)
    }

    fn roundtrip(path: &std::path::Path, command: &str) -> String {
        let mut stream = UnixStream::connect(path).unwrap();
        writeln!(stream, "{}", command).unwrap();
        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        reply.trim().to_string()
    }

    #[test]
    fn ping_answers_pong() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, _server, path) = test_server(dir.path());
        assert_eq!(roundtrip(&path, "ping"), "pong");
    }

    #[test]
    fn boost_command_triggers_an_apply() {
        let dir = tempfile::tempdir().unwrap();
        let (mock, _server, path) = test_server(dir.path());

        assert_eq!(roundtrip(&path, "boost"), "ok");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while mock.applies.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "boost never applied");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn stats_returns_json_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, _server, path) = test_server(dir.path());

        let reply = roundtrip(&path, "stats");
        let metrics: crate::stats::Metrics = serde_json::from_str(&reply).unwrap();
        assert_eq!(metrics.boosts_failed, 0);
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_mock, _server, path) = test_server(dir.path());
        assert!(roundtrip(&path, "frobnicate").starts_with("err"));
    }
}
