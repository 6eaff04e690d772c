//! Session Orchestrator (spec.md §4.6, §6): owns one Vt, one Queue, one Tracker, and the set of
//! currently attached clients, plus the local stream-socket listener clients attach through.
//! Grounded on the teacher's `web_server.rs` `handle_socket_attach` (multi-client fanout via
//! broadcast channel, dump-buffer for late joiners, resize via a side channel) and `session.rs`'s
//! `SessionId`/`SessionMetadata`/registry shape, generalized from a websocket-attached single
//! shared session to the spec's local-socket-attached, single-owner-passthrough design.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;

use crate::client::{Client, ClientCaps, ClientId, InputAction, MenuAction};
use crate::delivery::DeliveryLoop;
use crate::error::{ProtocolError, SessionError, StartupError};
use crate::protocol::{self, FrameKind, Request, Response};
use crate::queue::{Priority, Queue};
use crate::tracker::{self, SourceRank, Tracker};
use crate::vt::Vt;

/// Waits until `rx` carries `true`. Used at every T1-T6 suspension point so a `stop` request can
/// unwind the whole session in one shot (spec.md §5).
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionMetadata {
    pub name: String,
    pub created_at: u64,
    pub command: String,
}

pub fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Single-owner passthrough arbitration: holds the id of whichever client currently owns raw
/// passthrough, or none. A client's own attempt to re-acquire its own slot succeeds (spec.md
/// §4.5: "succeeds iff the slot is empty or already holds its own id").
struct PassthroughGate(StdMutex<Option<ClientId>>);

impl PassthroughGate {
    fn new() -> Self {
        PassthroughGate(StdMutex::new(None))
    }

    fn try_acquire(&self, id: ClientId) -> bool {
        let mut slot = self.0.lock().expect("passthrough gate mutex");
        match *slot {
            None => {
                *slot = Some(id);
                true
            }
            Some(existing) => existing == id,
        }
    }

    fn release(&self, id: ClientId) {
        let mut slot = self.0.lock().expect("passthrough gate mutex");
        if *slot == Some(id) {
            *slot = None;
        }
    }
}

/// Everything one running session owns. Lives for as long as the child process does.
pub struct Session {
    pub id: SessionId,
    pub metadata: SessionMetadata,
    pub vt: Vt,
    pub queue: Arc<Queue>,
    pub tracker: Arc<Tracker>,
    passthrough: Arc<PassthroughGate>,
    /// Fan-out of raw PTY output to every attached client's stream-stdout writer task. Carries no
    /// payload of its own (each client re-renders from the shared Vt on wake) — `Bytes` is kept as
    /// the channel's element type to match the teacher's own broadcast-fanout shape rather than
    /// `Vec<u8>`, which would clone its buffer on every subscriber delivery instead of bumping a
    /// refcount.
    output_tx: broadcast::Sender<bytes::Bytes>,
    messages_dir: PathBuf,
    socket_path: PathBuf,
    /// Flipped to `true` by a `stop` request; observed by the delivery loop, the accept loop, and
    /// every attached client's tasks at their next suspension point (spec.md §5).
    shutdown_tx: watch::Sender<bool>,
}

const OUTPUT_FANOUT_CAP: usize = 1024;

impl Session {
    /// Spawn the child, start the output pump, start the delivery loop and telemetry receiver,
    /// and bind the local listener socket. Does not accept connections yet; call `serve` for
    /// that.
    pub async fn start(
        name: String,
        command: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        cols: u16,
        rows: u16,
    ) -> Result<Self, StartupError> {
        let cfg = crate::config::ensure_loaded();
        let id = SessionId::new();

        let (output_tx, _) = broadcast::channel(OUTPUT_FANOUT_CAP);
        let fanout_tx = output_tx.clone();
        let tracker = Tracker::new();
        let heuristic_tracker = tracker.clone();
        let last_chunk_at = Arc::new(StdMutex::new(std::time::Instant::now()));
        let heuristic_last = last_chunk_at.clone();

        let on_data: crate::vt::OnData = Arc::new(move || {
            let _ = fanout_tx.send(bytes::Bytes::new());
            let mut last = heuristic_last.lock().expect("last-chunk mutex");
            let was_idle = last.elapsed() > Duration::from_millis(500);
            *last = std::time::Instant::now();
            if was_idle {
                heuristic_tracker.observe_output_heuristic(tracker::AgentState::Active);
            }
        });

        let exit_tracker = tracker.clone();
        let on_exit: crate::vt::OnExit = Arc::new(move || {
            exit_tracker.report(
                SourceRank::OutputHeuristic,
                tracker::AgentState::Exited {
                    reason: "pty closed".to_string(),
                },
            );
        });

        let vt = Vt::start(&command, &args, &env, rows, cols, on_data, on_exit)?;

        let (shutdown_tx, delivery_shutdown_rx) = watch::channel(false);

        let queue = Queue::new();
        let delivery_tracker = tracker.clone();
        let delivery_queue = queue.clone();
        let delivery_vt = vt.clone();
        let delivery_loop = DeliveryLoop::new(
            delivery_queue,
            delivery_vt,
            cfg.pty_write_deadline,
            cfg.idle_threshold,
            Arc::new(move |_id, _status| {
                // Any delivery implies the agent just received input; rely on the hook/telemetry
                // sources to report the resulting state, this callback only exists so message
                // status could be persisted by a richer store in the future.
                let _ = &delivery_tracker;
            }),
        );
        tokio::spawn(delivery_loop.run(delivery_shutdown_rx));

        let (_telemetry_addr, _telemetry_handle) = tracker::start_telemetry_receiver(tracker.clone())
            .await
            .map_err(|e| StartupError::SocketBind {
                path: PathBuf::from("127.0.0.1:0"),
                source: e,
            })?;

        let messages_dir = cfg.messages_root.join(id.to_string());
        tokio::fs::create_dir_all(&messages_dir)
            .await
            .map_err(|e| StartupError::SocketBind {
                path: messages_dir.clone(),
                source: e,
            })?;

        let socket_path = bind_path(&cfg.sockets_dir, &name);

        Ok(Session {
            id,
            metadata: SessionMetadata {
                name,
                created_at: unix_now_secs(),
                command,
            },
            vt,
            queue,
            tracker,
            passthrough: Arc::new(PassthroughGate::new()),
            output_tx,
            messages_dir,
            socket_path,
            shutdown_tx,
        })
    }

    /// Bind the listener socket (falling back to a short symlink if the path is too long for
    /// `sockaddr_un`, spec.md §6) and accept connections until the process is asked to stop.
    pub async fn serve(self: Arc<Self>, cfg_sockets_dir: &Path) -> Result<(), StartupError> {
        std::fs::create_dir_all(cfg_sockets_dir).map_err(|e| StartupError::SocketBind {
            path: cfg_sockets_dir.to_path_buf(),
            source: e,
        })?;
        let _ = std::fs::remove_file(&self.socket_path);

        let bind_target = if self.socket_path.as_os_str().len() > 100 {
            let cfg = crate::config::ensure_loaded();
            std::fs::create_dir_all(&cfg.short_socket_dir).map_err(StartupError::SymlinkCreate)?;
            let short = cfg.short_socket_dir.join(format!("{}.sock", self.id));
            let _ = std::fs::remove_file(&short);
            std::os::unix::fs::symlink(&self.socket_path, &short)
                .map_err(StartupError::SymlinkCreate)?;
            short
        } else {
            self.socket_path.clone()
        };

        let listener = UnixListener::bind(&bind_target).map_err(|e| StartupError::SocketBind {
            path: bind_target.clone(),
            source: e,
        })?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let session = self.clone();
                    let mut client_shutdown = shutdown_rx.clone();
                    connections.spawn(async move {
                        tokio::select! {
                            res = session.handle_connection(stream) => {
                                if let Err(e) = res {
                                    log::debug!("connection closed: {e}");
                                }
                            }
                            _ = wait_for_shutdown(&mut client_shutdown) => {}
                        }
                    });
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    break;
                }
            }
        }

        drop(listener);
        let _ = std::fs::remove_file(&bind_target);
        if bind_target != self.socket_path {
            let _ = std::fs::remove_file(&self.socket_path);
        }

        // Session shutdown returns only after every accept-handler task has completed
        // (spec.md §4.6).
        while connections.join_next().await.is_some() {}

        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, mut stream: UnixStream) -> Result<(), SessionError> {
        let frame = protocol::read_frame(&mut stream)
            .await
            .map_err(|_| SessionError::ChildExited)?;
        if frame.kind != FrameKind::JsonRequest {
            return Ok(());
        }
        let req = match protocol::decode_request(&frame) {
            Ok(req) => req,
            // Only a desynchronized frame boundary forces a connection close (error.rs's own
            // documented contract); a malformed or unrecognized request still gets a response.
            Err(ProtocolError::Desynchronized) => return Err(SessionError::ChildExited),
            Err(e) => {
                let resp = Response::Error { message: e.to_string() };
                return protocol::write_json_response(&mut stream, &resp)
                    .await
                    .map_err(|_| SessionError::ChildExited);
            }
        };

        match req {
            Request::Attach { cols, rows, default_priority } => {
                self.handle_attach(stream, cols, rows, default_priority.unwrap_or(Priority::Normal))
                    .await
            }
            Request::Status => {
                let resp = Response::Status {
                    state: self.tracker.current(),
                    pending_messages: self.queue.pending_count(),
                };
                protocol::write_json_response(&mut stream, &resp)
                    .await
                    .map_err(|_| SessionError::ChildExited)
            }
            Request::Send { from, priority, body } => {
                let path = self.persist_message(&body).await?;
                self.queue.enqueue(from, priority, path);
                protocol::write_json_response(&mut stream, &Response::Ok)
                    .await
                    .map_err(|_| SessionError::ChildExited)
            }
            Request::Hook { state } => {
                self.tracker.report(SourceRank::Hook, state);
                protocol::write_json_response(&mut stream, &Response::Ok)
                    .await
                    .map_err(|_| SessionError::ChildExited)
            }
            Request::Stop => {
                // Wake the delivery loop, the accept loop, and every attached client's tasks
                // before actually closing the pty, so they unwind instead of erroring out from
                // under a dead Vt (spec.md §4.6, §5).
                let _ = self.shutdown_tx.send(true);
                self.vt.close(Duration::from_secs(3)).await;
                protocol::write_json_response(&mut stream, &Response::Ok)
                    .await
                    .map_err(|_| SessionError::ChildExited)
            }
        }
    }

    /// Persist a `send` request body verbatim to
    /// `<messages-dir>/<YYYYMMDD-HHMMSS>-<id8>.md`, mode 0600 (spec.md §6), and return its path
    /// for the queue entry.
    async fn persist_message(&self, body: &str) -> Result<PathBuf, SessionError> {
        write_message_file(&self.messages_dir, body)
            .await
            .map_err(|source| SessionError::MessagePersist {
                path: self.messages_dir.clone(),
                source,
            })
    }

    async fn handle_attach(
        self: Arc<Self>,
        mut stream: UnixStream,
        cols: u16,
        rows: u16,
        default_priority: Priority,
    ) -> Result<(), SessionError> {
        protocol::write_json_response(&mut stream, &Response::Attached { cols, rows })
            .await
            .map_err(|_| SessionError::ChildExited)?;

        let client_id = ClientId::new();
        let vt_for_caps = self.vt.clone();
        let vt_for_scrollback = self.vt.clone();
        let passthrough_try = self.passthrough.clone();
        let passthrough_release = self.passthrough.clone();
        let caps = ClientCaps {
            try_passthrough: Arc::new(move || passthrough_try.try_acquire(client_id)),
            release_passthrough: Arc::new(move || passthrough_release.release(client_id)),
            read_live: Arc::new(move || vt_for_caps.with_live_screen(screen_to_string)),
            read_scrollback: Arc::new(move || vt_for_scrollback.with_scrollback_screen(screen_to_string)),
        };
        let client = StdMutex::new(Client::new(client_id, caps, cols, rows, default_priority));
        // Fires whenever client-local state changes (mode switch, keystroke, menu action) so the
        // render loop repaints promptly instead of waiting for the next PTY byte or 1Hz tick.
        let redraw = Arc::new(tokio::sync::Notify::new());

        let mut output_rx = self.output_tx.subscribe();
        let (mut read_half, mut write_half) = stream.into_split();
        let session = self.clone();

        let render_task = async {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                let frame = {
                    let c = client.lock().expect("client mutex");
                    c.render(&session.tracker.current())
                };
                if protocol::write_frame(&mut write_half, FrameKind::StreamStdout, frame.as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::select! {
                    res = output_rx.recv() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = redraw.notified() => {}
                    _ = tick.tick() => {}
                }
            }
        };

        let redraw_for_input = redraw.clone();
        let input_task = async {
            loop {
                let frame = match protocol::read_frame(&mut read_half).await {
                    Ok(f) => f,
                    Err(_) => break,
                };
                match frame.kind {
                    FrameKind::StreamStdin => {
                        let actions = {
                            let mut c = client.lock().expect("client mutex");
                            c.handle_input(&frame.payload)
                        };
                        let mut keep_going = true;
                        for action in actions {
                            if !self.apply_client_action(action).await {
                                keep_going = false;
                            }
                        }
                        redraw_for_input.notify_waiters();
                        if !keep_going {
                            break;
                        }
                    }
                    FrameKind::JsonRequest => {
                        if let Ok(Request::Hook { state }) = protocol::decode_request(&frame) {
                            self.tracker.report(SourceRank::Hook, state);
                        }
                    }
                    _ => {}
                }
            }
        };

        // Drives the 50ms bare-ESC and 250ms pending-slash deadlines even when no further bytes
        // ever arrive from this client (spec.md §4.5).
        let redraw_for_timer = redraw.clone();
        let timer_task = async {
            let mut poll = tokio::time::interval(Duration::from_millis(20));
            loop {
                poll.tick().await;
                let action = {
                    let mut c = client.lock().expect("client mutex");
                    c.poll_timers()
                };
                if let Some(action) = action {
                    self.apply_client_action(action).await;
                    redraw_for_timer.notify_waiters();
                }
            }
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = render_task => {}
            _ = input_task => {}
            _ = timer_task => {}
            _ = wait_for_shutdown(&mut shutdown_rx) => {}
        }

        self.passthrough.release(client_id);

        Ok(())
    }

    /// Apply one decoded client action: forward raw bytes to the PTY, enqueue a submitted
    /// message, or run a Menu action. Returns `false` if the client connection should close
    /// (Menu's Quit action).
    async fn apply_client_action(&self, action: InputAction) -> bool {
        match action {
            InputAction::ForwardRaw(bytes) => {
                let cfg = crate::config::ensure_loaded();
                let _ = self.vt.write_pty(bytes, cfg.pty_write_deadline).await;
                true
            }
            InputAction::Submitted { body, priority } => {
                if let Ok(path) = self.persist_message(&body).await {
                    self.queue.enqueue("client".to_string(), priority, path);
                }
                true
            }
            InputAction::Menu(MenuAction::Quit) => false,
            InputAction::Menu(_) => true,
            InputAction::None | InputAction::PassthroughDenied => true,
        }
    }
}

fn screen_to_string(screen: &vt100::Screen) -> String {
    screen.contents()
}

fn bind_path(sockets_dir: &Path, name: &str) -> PathBuf {
    sockets_dir.join(format!("session.{name}.sock"))
}

#[allow(dead_code)]
pub type Registry = Arc<DashMap<SessionId, Arc<Session>>>;

/// Write `body` verbatim to `<dir>/<YYYYMMDD-HHMMSS>-<id8>.md` at mode 0600 (spec.md §6, §8
/// invariant 5: persisted contents equal the request's `body` exactly). `from` is not written into
/// the file — it's already carried in-band in the `[h2-message from=...]` delivery line. Factored
/// out of `Session::persist_message` so the on-disk format can be exercised without spinning up a
/// PTY-backed session.
async fn write_message_file(dir: &Path, body: &str) -> std::io::Result<PathBuf> {
    let now = chrono::Utc::now();
    let id8 = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    let filename = format!("{}-{}.md", now.format("%Y%m%d-%H%M%S"), id8);
    let path = dir.join(filename);

    tokio::fs::write(&path, body).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persisted_message_has_body_verbatim_and_md_filename() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_message_file(dir.path(), "hello there").await.unwrap();

        assert_eq!(path.parent(), Some(dir.path()));
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with(".md"));

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "hello there");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn persisted_message_is_mode_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = write_message_file(dir.path(), "secret").await.unwrap();
        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn bind_path_uses_session_dot_name_dot_sock() {
        let path = bind_path(Path::new("/run/h2"), "my-session");
        assert_eq!(path, PathBuf::from("/run/h2/session.my-session.sock"));
    }
}
