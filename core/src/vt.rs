//! Virtual Terminal: owns the PTY master, the child process, and two vt100 emulator buffers
//! (live screen + append-only scrollback). Reads child output, feeds both emulators, exposes a
//! mutex-guarded snapshot. Grounded on the teacher's `pty.rs` (`spawn_pty`/`PtyBridge`), with the
//! tool-specific shell wrapping removed in favor of an arbitrary caller-supplied command line and
//! a real VT100 grid (`vt100::Parser`) in place of the teacher's raw `CircularBuffer`.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{SessionError, StartupError};

/// Visible height of the scrollback emulator's own screen. Bounded rather than literally
/// infinite for the same reason the teacher's `CircularBuffer` capped at 2 MiB: unbounded growth
/// is not implementable without O(session length) memory. See DESIGN.md.
const SCROLLBACK_VISIBLE_ROWS: u16 = 2000;
/// Additional history vt100 itself retains beyond the visible scrollback rows.
const SCROLLBACK_EXTRA_ROWS: usize = 50_000;

/// Outcome of a single `write_pty` call.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The write completed; `n` bytes were accepted by the PTY.
    Written(usize),
    /// The deadline elapsed before the write completed. The write itself is not cancelled (see
    /// spec.md §4.1) — it keeps running on the writer task and subsequent writes queue behind it.
    Timeout,
}

struct WriteJob {
    data: Vec<u8>,
    done: oneshot::Sender<std::io::Result<usize>>,
}

enum ResizeJob {
    Resize {
        size: PtySize,
        ack: oneshot::Sender<std::io::Result<()>>,
    },
}

/// State guarded by the VT mutex: both emulators, `last_output_at`, and the cached OSC replies.
struct VtState {
    live: vt100::Parser,
    scrollback: vt100::Parser,
    last_output_at: Instant,
    osc_fg: String,
    osc_bg: String,
}

/// Virtual Terminal handle. Cheap to clone (`Arc` internally); every clone shares the same
/// emulators, PTY, and child.
#[derive(Clone)]
pub struct Vt {
    inner: Arc<VtInner>,
}

struct VtInner {
    state: StdMutex<VtState>,
    write_tx: mpsc::UnboundedSender<WriteJob>,
    resize_tx: std::sync::mpsc::Sender<ResizeJob>,
    child: Arc<StdMutex<Box<dyn Child + Send + Sync>>>,
}

/// Callback invoked after every chunk is fed to both emulators, under the VT mutex's release
/// (not while held) so it may do async work like re-rendering clients.
pub type OnData = Arc<dyn Fn() + Send + Sync>;
/// Callback invoked once, when the child's PTY master hits EOF.
pub type OnExit = Arc<dyn Fn() + Send + Sync>;

impl Vt {
    /// Spawn `command args...` in a PTY sized `child_rows x cols`, with `env_overrides` replacing
    /// matching keys of the inherited environment and otherwise additive (spec.md §6). The
    /// returned `Vt` already has its child-output pump (T1) running; `on_data` fires after each
    /// chunk is merged into both emulators, `on_exit` fires once on PTY EOF.
    pub fn start(
        command: &str,
        args: &[String],
        env_overrides: &[(String, String)],
        child_rows: u16,
        cols: u16,
        on_data: OnData,
        on_exit: OnExit,
    ) -> Result<Self, StartupError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: child_rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| StartupError::PtyOpen(to_io_err(e)))?;

        let mut cmd = CommandBuilder::new(command);
        cmd.args(args);
        for (k, v) in env_overrides {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| StartupError::SpawnChild(to_io_err(e)))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| StartupError::PtyOpen(to_io_err(e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| StartupError::PtyOpen(to_io_err(e)))?;
        let master = pair.master;

        let cfg = crate::config::ensure_loaded();
        let live = vt100::Parser::new(child_rows, cols, 0);
        let scrollback = vt100::Parser::new(SCROLLBACK_VISIBLE_ROWS, cols, SCROLLBACK_EXTRA_ROWS);

        let state = StdMutex::new(VtState {
            live,
            scrollback,
            last_output_at: Instant::now(),
            osc_fg: cfg.osc_fg.clone(),
            osc_bg: cfg.osc_bg.clone(),
        });

        // Single writer task: serializes all PTY writes. A caller that times out waiting for
        // its oneshot leaves the job in this queue; the next caller's job simply queues behind
        // it, giving "at-most-one-in-flight with a follower slot" for free (spec.md §4.1).
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteJob>();
        std::thread::Builder::new()
            .name("vt-writer".into())
            .spawn(move || {
                let mut writer = writer;
                while let Some(job) = write_rx.blocking_recv() {
                    let res = writer
                        .write_all(&job.data)
                        .and_then(|_| writer.flush())
                        .map(|_| job.data.len());
                    let _ = job.done.send(res);
                }
            })
            .expect("spawn vt-writer thread");

        // Dedicated thread owns the PTY master exclusively; resize and (eventually) drop both
        // go through it, matching the teacher's pattern in pty.rs of never sharing `MasterPty`
        // across threads directly.
        let (resize_tx, resize_rx) = std::sync::mpsc::channel::<ResizeJob>();
        std::thread::Builder::new()
            .name("vt-master".into())
            .spawn(move || {
                let master = master;
                while let Ok(job) = resize_rx.recv() {
                    match job {
                        ResizeJob::Resize { size, ack } => {
                            let res = master.resize(size).map_err(to_io_err);
                            let _ = ack.send(res);
                        }
                    }
                }
            })
            .expect("spawn vt-master thread");

        let child = Arc::new(StdMutex::new(child));

        let inner = Arc::new(VtInner {
            state,
            write_tx,
            resize_tx,
            child,
        });
        let vt = Vt { inner };

        // T1: child-output pump. Blocking reads happen on a dedicated OS thread; the actual
        // emulator feed + callbacks run on a tokio task so `on_data`/`on_exit` may do async work.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(256);
        std::thread::Builder::new()
            .name("vt-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .expect("spawn vt-reader thread");

        let pump_vt = vt.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                pump_vt.reply_osc_color_queries(&chunk).await;
                {
                    let mut state = pump_vt.inner.state.lock().expect("vt state mutex");
                    state.last_output_at = Instant::now();
                    state.live.process(&chunk);
                    state.scrollback.process(&chunk);
                }
                on_data();
            }
            on_exit();
        });

        Ok(vt)
    }

    /// Scan a chunk for OSC 10/11 `?` color queries and reply on the PTY master with the cached
    /// values — the emulator would otherwise silently swallow these (spec.md §4.1).
    async fn reply_osc_color_queries(&self, chunk: &[u8]) {
        for query in scan_osc_color_queries(chunk) {
            let (fg, bg) = {
                let state = self.inner.state.lock().expect("vt state mutex");
                (state.osc_fg.clone(), state.osc_bg.clone())
            };
            let reply = match query {
                OscColorQuery::Foreground => format!("\x1b]10;{fg}\x07"),
                OscColorQuery::Background => format!("\x1b]11;{bg}\x07"),
            };
            let _ = self.write_pty(reply.into_bytes(), Duration::from_millis(200)).await;
        }
    }

    /// Write `bytes` to the PTY, giving up (but not cancelling) after `deadline`.
    pub async fn write_pty(
        &self,
        bytes: Vec<u8>,
        deadline: Duration,
    ) -> Result<WriteOutcome, SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .inner
            .write_tx
            .send(WriteJob { data: bytes, done: done_tx })
            .is_err()
        {
            return Err(SessionError::VtDead(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "vt writer thread gone",
            )));
        }
        match tokio::time::timeout(deadline, done_rx).await {
            Ok(Ok(Ok(n))) => Ok(WriteOutcome::Written(n)),
            Ok(Ok(Err(e))) => Err(SessionError::VtDead(e)),
            Ok(Err(_)) => Err(SessionError::VtDead(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "vt writer thread gone",
            ))),
            Err(_) => Ok(WriteOutcome::Timeout),
        }
    }

    /// Resize the live emulator to `child_rows x cols`, widen (never shrink height of) the
    /// scrollback emulator, and set the PTY window size — all under the VT mutex so the three
    /// updates appear atomic to any other caller (spec.md §4.1).
    pub async fn resize(&self, cols: u16, child_rows: u16) -> Result<(), SessionError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut state = inner.state.lock().expect("vt state mutex");
            state.live.set_size(child_rows, cols);
            let scrollback_rows = state.scrollback.screen().size().0;
            state.scrollback.set_size(scrollback_rows, cols);

            let (ack_tx, ack_rx) = oneshot::channel();
            inner
                .resize_tx
                .send(ResizeJob::Resize {
                    size: PtySize {
                        rows: child_rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    },
                    ack: ack_tx,
                })
                .map_err(|_| {
                    SessionError::VtDead(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "vt master thread gone",
                    ))
                })?;
            // Block (we're already on a blocking-pool thread) until the kernel resize lands,
            // keeping the state mutex held for the whole critical section.
            ack_rx
                .blocking_recv()
                .map_err(|_| {
                    SessionError::VtDead(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "vt master thread gone",
                    ))
                })?
                .map_err(SessionError::VtDead)
        })
        .await
        .expect("resize blocking task panicked")
    }

    /// Borrowed snapshot of the live screen, rendered into whatever the caller's closure wants.
    pub fn with_live_screen<R>(&self, f: impl FnOnce(&vt100::Screen) -> R) -> R {
        let state = self.inner.state.lock().expect("vt state mutex");
        f(state.live.screen())
    }

    /// Borrowed snapshot of the scrollback screen.
    pub fn with_scrollback_screen<R>(&self, f: impl FnOnce(&vt100::Screen) -> R) -> R {
        let state = self.inner.state.lock().expect("vt state mutex");
        f(state.scrollback.screen())
    }

    pub fn last_output_at(&self) -> Instant {
        self.inner.state.lock().expect("vt state mutex").last_output_at
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.last_output_at().elapsed() > threshold
    }

    /// Signal the child to terminate: SIGTERM, wait up to `grace`, then SIGKILL (spec.md §5).
    pub async fn close(&self, grace: Duration) {
        let child = self.inner.child.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = match child.lock() {
                Ok(g) => g,
                Err(_) => return,
            };

            #[cfg(unix)]
            {
                match guard.process_id() {
                    Some(pid) => unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    },
                    None => {
                        let _ = guard.kill();
                        let _ = guard.wait();
                        return;
                    }
                }

                let deadline = Instant::now() + grace;
                loop {
                    match guard.try_wait() {
                        Ok(Some(_)) | Err(_) => return,
                        Ok(None) => {
                            if Instant::now() >= deadline {
                                break;
                            }
                            std::thread::sleep(Duration::from_millis(20));
                        }
                    }
                }
                let _ = guard.kill();
                let _ = guard.wait();
            }

            #[cfg(not(unix))]
            {
                let _ = grace;
                let _ = guard.kill();
                let _ = guard.wait();
            }
        })
        .await
        .ok();
    }
}

#[derive(Debug, Clone, Copy)]
enum OscColorQuery {
    Foreground,
    Background,
}

/// Scan for `ESC ] 10 ; ? (BEL|ST)` and `ESC ] 11 ; ? (BEL|ST)` OSC color queries.
fn scan_osc_color_queries(chunk: &[u8]) -> Vec<OscColorQuery> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 4 < chunk.len() {
        if chunk[i] == 0x1b && chunk[i + 1] == b']' {
            let rest = &chunk[i + 2..];
            for (prefix, kind) in [
                (b"10;?".as_slice(), OscColorQuery::Foreground),
                (b"11;?".as_slice(), OscColorQuery::Background),
            ] {
                if rest.starts_with(prefix) {
                    out.push(kind);
                }
            }
        }
        i += 1;
    }
    out
}

fn to_io_err(e: anyhow::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}
