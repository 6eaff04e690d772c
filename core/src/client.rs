//! Per-client UI (spec.md §4.5): one instance per attached connection. Tracks the client's mode
//! (message composition vs. raw passthrough vs. menu vs. scrollback browsing), decodes raw input
//! bytes into either composed-message keystrokes or raw bytes to forward, and renders an
//! absolute-positioned frame of screen + status bar + input bar. Grounded on the teacher's
//! `web_server.rs` per-connection state (`ClientCaps`-shaped closures breaking the client/session
//! reference cycle, matching the teacher's use of channels rather than back-references into the
//! session for each attached websocket).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::queue::Priority;
use crate::tracker::AgentState;

/// Unique per-attached-connection identifier (spec.md §3 Client attribute `unique client id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub uuid::Uuid);

impl ClientId {
    pub fn new() -> Self {
        ClientId(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Message,
    Passthrough,
    Menu,
    Scroll,
    ScrollPassthrough,
}

/// Closures a `Client` uses to talk to its `Session` without holding a reference back to it
/// (spec.md §9's explicit note to break the Client<->Session cycle this way). `try_passthrough`
/// and `release_passthrough` already close over this client's id, so the gate can tell "this
/// client's own slot" apart from "someone else's" (spec.md §4.5's ownership rule).
pub struct ClientCaps {
    pub try_passthrough: Arc<dyn Fn() -> bool + Send + Sync>,
    pub release_passthrough: Arc<dyn Fn() + Send + Sync>,
    pub read_live: Arc<dyn Fn() -> String + Send + Sync>,
    pub read_scrollback: Arc<dyn Fn() -> String + Send + Sync>,
}

const HISTORY_CAP: usize = 200;
const PENDING_SLASH_TIMEOUT: Duration = Duration::from_millis(250);
const BARE_ESC_TIMEOUT: Duration = Duration::from_millis(50);
const MENU_ITEMS: [&str; 3] = ["Clear input", "Redraw", "Quit"];

/// Action to execute when the Menu mode's selected item is activated with Enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    ClearInput,
    Redraw,
    Quit,
}

/// Result of feeding bytes (or a pending timer) through the decoder.
pub enum InputAction {
    /// Nothing further to do; state updated in place (e.g. a character was appended).
    None,
    /// Forward these raw bytes straight to the PTY in one contiguous write (passthrough mode, or
    /// a completed escape sequence within it).
    ForwardRaw(Vec<u8>),
    /// The composed message was submitted at the client's currently chosen priority.
    Submitted { body: String, priority: Priority },
    /// A Menu selection was activated.
    Menu(MenuAction),
    /// The client tried to enter Passthrough but another client already holds it.
    PassthroughDenied,
}

pub struct Client {
    pub id: ClientId,
    pub mode: Mode,
    /// Mode to restore when leaving Scroll / ScrollPassthrough (spec.md §4.5 doesn't name an
    /// explicit return transition; this implementation restores the mode scrolling was entered
    /// from — see DESIGN.md).
    prior_mode: Mode,
    caps: ClientCaps,
    input: String,
    history: Vec<String>,
    history_cursor: Option<usize>,
    saved_draft: String,
    cols: u16,
    rows: u16,
    default_priority: Priority,
    pending_escape: Vec<u8>,
    escape_started_at: Option<Instant>,
    pending_slash_at: Option<Instant>,
    menu_selection: usize,
    scroll_offset: usize,
}

impl Client {
    pub fn new(id: ClientId, caps: ClientCaps, cols: u16, rows: u16, default_priority: Priority) -> Self {
        Client {
            id,
            mode: Mode::Message,
            prior_mode: Mode::Message,
            caps,
            input: String::new(),
            history: Vec::new(),
            history_cursor: None,
            saved_draft: String::new(),
            cols,
            rows,
            default_priority,
            pending_escape: Vec::new(),
            escape_started_at: None,
            pending_slash_at: None,
            menu_selection: 0,
            scroll_offset: 0,
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    pub fn set_default_priority(&mut self, priority: Priority) {
        self.default_priority = priority;
    }

    /// Decode one chunk of raw bytes from the client connection, returning every action the
    /// chunk produced in order (a chunk may, e.g., submit a message and then start composing the
    /// next one).
    pub fn handle_input(&mut self, bytes: &[u8]) -> Vec<InputAction> {
        let mut actions = Vec::new();
        for &b in bytes {
            if let Some(action) = self.step_byte(b) {
                actions.push(action);
            }
        }
        actions
    }

    /// Called periodically (spec.md §4.5's 50ms ESC timeout and 250ms pending-slash timeout are
    /// both wall-clock deadlines that must fire even if no further bytes ever arrive).
    pub fn poll_timers(&mut self) -> Option<InputAction> {
        if self.pending_escape == [0x1b] {
            if let Some(started) = self.escape_started_at {
                if started.elapsed() > BARE_ESC_TIMEOUT {
                    self.pending_escape.clear();
                    self.escape_started_at = None;
                    return self.resolve_bare_escape();
                }
            }
        }
        if let Some(started) = self.pending_slash_at {
            if started.elapsed() > PENDING_SLASH_TIMEOUT {
                self.pending_slash_at = None;
                return Some(self.resolve_pending_slash_timeout());
            }
        }
        None
    }

    /// The pending-slash window elapsed with no second byte: the stored `/` starts passthrough
    /// (spec.md §4.5's "any other byte / timeout -> Passthrough" row, timeout branch).
    fn resolve_pending_slash_timeout(&mut self) -> InputAction {
        if self.enter_passthrough() {
            InputAction::ForwardRaw(b"/".to_vec())
        } else {
            self.input.push('/');
            InputAction::PassthroughDenied
        }
    }

    fn step_byte(&mut self, b: u8) -> Option<InputAction> {
        // A lone pending `/` must be resolved against the very next byte, even when that byte
        // starts an escape sequence (spec.md §4.5's "any other byte" row) — `step_message_byte`
        // already knows how to seed the shared escape buffer when it forwards into passthrough,
        // so hand it off before the generic escape-buffer shortcut below would otherwise eat the
        // byte first and leave the slash timer stale.
        if self.pending_escape.is_empty()
            && b == 0x1b
            && matches!(self.mode, Mode::Message)
            && self.pending_slash_at.is_some()
        {
            return self.step_message_byte(b);
        }

        // A byte continuing (or starting) an escape sequence is handled uniformly across modes;
        // once complete, dispatch on the current mode.
        if !self.pending_escape.is_empty() || b == 0x1b {
            self.pending_escape.push(b);
            if self.escape_started_at.is_none() {
                self.escape_started_at = Some(Instant::now());
            }
            return self.feed_escape_byte();
        }

        match self.mode {
            Mode::Message => self.step_message_byte(b),
            Mode::Menu => self.step_menu_byte(b),
            Mode::Scroll => self.step_scroll_byte(b),
            Mode::Passthrough | Mode::ScrollPassthrough => {
                Some(InputAction::ForwardRaw(vec![b]))
            }
        }
    }

    fn feed_escape_byte(&mut self) -> Option<InputAction> {
        match classify_escape(&self.pending_escape) {
            EscapeProgress::Pending => None,
            EscapeProgress::Complete(outcome) => {
                let buf = std::mem::take(&mut self.pending_escape);
                self.escape_started_at = None;
                self.dispatch_escape(outcome, buf)
            }
        }
    }

    fn dispatch_escape(&mut self, outcome: EscapeOutcome, buf: Vec<u8>) -> Option<InputAction> {
        match outcome {
            EscapeOutcome::Wheel(dir) => Some(self.scroll_by_wheel(dir)),
            EscapeOutcome::ShiftEnter if matches!(self.mode, Mode::Message) => {
                self.input.push('\n');
                None
            }
            EscapeOutcome::ShiftEnter if matches!(self.mode, Mode::Passthrough | Mode::ScrollPassthrough) => {
                Some(InputAction::ForwardRaw(b"\r".to_vec()))
            }
            EscapeOutcome::ArrowUp if matches!(self.mode, Mode::Menu) => {
                self.menu_move(-1);
                None
            }
            EscapeOutcome::ArrowDown if matches!(self.mode, Mode::Menu) => {
                self.menu_move(1);
                None
            }
            EscapeOutcome::ArrowUp if matches!(self.mode, Mode::Message) => {
                self.history_up();
                None
            }
            EscapeOutcome::ArrowDown if matches!(self.mode, Mode::Message) => {
                self.history_down();
                None
            }
            EscapeOutcome::ArrowUp if matches!(self.mode, Mode::Scroll | Mode::ScrollPassthrough) => {
                self.scroll_offset = self.scroll_offset.saturating_add(1);
                None
            }
            EscapeOutcome::ArrowDown if matches!(self.mode, Mode::Scroll | Mode::ScrollPassthrough) => {
                self.scroll_offset = self.scroll_offset.saturating_sub(1);
                None
            }
            _ => match self.mode {
                Mode::Passthrough | Mode::ScrollPassthrough => Some(InputAction::ForwardRaw(buf)),
                // A non-actionable escape sequence arriving outside passthrough is swallowed —
                // there's no buffered-input representation for raw control sequences here.
                _ => None,
            },
        }
    }

    /// A bare ESC (not followed by `[` or `O` within the timeout) only means something in
    /// passthrough: it ends the mode (spec.md §4.5).
    fn resolve_bare_escape(&mut self) -> Option<InputAction> {
        if matches!(self.mode, Mode::Passthrough | Mode::ScrollPassthrough) {
            self.exit_passthrough();
            None
        } else {
            None
        }
    }

    fn step_message_byte(&mut self, b: u8) -> Option<InputAction> {
        if self.pending_slash_at.take().is_some() {
            if b == b'/' {
                self.mode = Mode::Menu;
                self.menu_selection = 0;
                return None;
            }
            if self.enter_passthrough() {
                if b == 0x1b {
                    // The next byte starts its own escape sequence; let the shared escape buffer
                    // track it rather than folding it into this forward.
                    self.pending_escape.push(b);
                    self.escape_started_at = Some(Instant::now());
                    return Some(InputAction::ForwardRaw(b"/".to_vec()));
                }
                return Some(InputAction::ForwardRaw(vec![b'/', b]));
            }
            // Passthrough denied: the stored slash becomes a literal character, and `b` is
            // processed as ordinary composition input below.
            self.input.push('/');
        }
        self.handle_message_normal_byte(b)
    }

    fn handle_message_normal_byte(&mut self, b: u8) -> Option<InputAction> {
        match b {
            b'/' if self.input.is_empty() => {
                self.pending_slash_at = Some(Instant::now());
                None
            }
            b'\r' | b'\n' => {
                let submitted = std::mem::take(&mut self.input);
                if submitted.is_empty() {
                    return None;
                }
                self.history.push(submitted.clone());
                if self.history.len() > HISTORY_CAP {
                    self.history.remove(0);
                }
                self.history_cursor = None;
                self.saved_draft.clear();
                Some(InputAction::Submitted {
                    body: submitted,
                    priority: self.default_priority,
                })
            }
            0x7f | 0x08 => {
                self.input.pop();
                None
            }
            _ => {
                if let Some(c) = char::from_u32(b as u32) {
                    if !c.is_control() {
                        self.input.push(c);
                    }
                }
                None
            }
        }
    }

    fn step_menu_byte(&mut self, b: u8) -> Option<InputAction> {
        match b {
            b'\r' | b'\n' => {
                let action = MENU_ITEMS[self.menu_selection];
                self.mode = Mode::Message;
                match action {
                    "Clear input" => {
                        self.input.clear();
                        Some(InputAction::Menu(MenuAction::ClearInput))
                    }
                    "Redraw" => Some(InputAction::Menu(MenuAction::Redraw)),
                    "Quit" => Some(InputAction::Menu(MenuAction::Quit)),
                    _ => unreachable!(),
                }
            }
            0x1b => None, // handled by the shared escape buffer path before reaching here
            _ => None,
        }
    }

    fn step_scroll_byte(&mut self, b: u8) -> Option<InputAction> {
        match b {
            b'\r' | b'\n' => {
                self.exit_scroll();
                None
            }
            _ => None,
        }
    }

    fn menu_move(&mut self, delta: i32) {
        let len = MENU_ITEMS.len() as i32;
        let next = (self.menu_selection as i32 + delta).rem_euclid(len);
        self.menu_selection = next as usize;
    }

    fn scroll_by_wheel(&mut self, dir: WheelDir) -> InputAction {
        match dir {
            WheelDir::Up => self.scroll_offset = self.scroll_offset.saturating_add(3),
            WheelDir::Down => self.scroll_offset = self.scroll_offset.saturating_sub(3),
        }
        if !matches!(self.mode, Mode::Scroll | Mode::ScrollPassthrough) {
            self.prior_mode = self.mode;
            self.mode = match self.mode {
                Mode::Passthrough => Mode::ScrollPassthrough,
                _ => Mode::Scroll,
            };
        }
        InputAction::None
    }

    fn exit_scroll(&mut self) {
        self.scroll_offset = 0;
        self.mode = self.prior_mode;
    }

    fn history_up(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let next = match self.history_cursor {
            None => {
                self.saved_draft = self.input.clone();
                self.history.len() - 1
            }
            Some(0) => 0,
            Some(i) => i - 1,
        };
        self.history_cursor = Some(next);
        self.input = self.history[next].clone();
    }

    fn history_down(&mut self) {
        match self.history_cursor {
            None => {}
            Some(i) if i + 1 < self.history.len() => {
                self.history_cursor = Some(i + 1);
                self.input = self.history[i + 1].clone();
            }
            Some(_) => {
                self.history_cursor = None;
                self.input = std::mem::take(&mut self.saved_draft);
            }
        }
    }

    /// Attempt to acquire single-owner passthrough. On success, switches mode and returns true.
    pub fn enter_passthrough(&mut self) -> bool {
        if (self.caps.try_passthrough)() {
            self.mode = Mode::Passthrough;
            true
        } else {
            false
        }
    }

    pub fn exit_passthrough(&mut self) {
        if matches!(self.mode, Mode::Passthrough | Mode::ScrollPassthrough) {
            (self.caps.release_passthrough)();
        }
        self.mode = Mode::Message;
        self.scroll_offset = 0;
    }

    /// Render the absolute-positioned frame: screen body, then a status bar, then the input bar,
    /// each with an SGR reset between regions so one region's styling never bleeds into the next
    /// (spec.md §4.5).
    pub fn render(&self, agent_state: &AgentState) -> String {
        let body = match self.mode {
            Mode::Scroll | Mode::ScrollPassthrough => (self.caps.read_scrollback)(),
            _ => (self.caps.read_live)(),
        };

        let mut out = String::new();
        out.push_str("\x1b[H\x1b[0m");
        out.push_str(&body);
        out.push_str("\x1b[0m\r\n");
        out.push_str(&self.render_status_bar(agent_state));
        out.push_str("\x1b[0m\r\n");
        out.push_str(&self.render_input_bar());
        out.push_str("\x1b[0m");
        out
    }

    fn render_status_bar(&self, agent_state: &AgentState) -> String {
        let label = match agent_state {
            AgentState::Active => "active".to_string(),
            AgentState::ActiveDetail { detail } => format!("active: {detail}"),
            AgentState::Idle => "idle".to_string(),
            AgentState::BlockedOnPermission { tool } => format!("blocked on permission: {tool}"),
            AgentState::Compacting => "compacting".to_string(),
            AgentState::Exited { reason } => format!("exited: {reason}"),
        };
        format!(
            "\x1b[7m {label} | {:?} | priority={:?} \x1b[0m",
            self.mode, self.default_priority
        )
    }

    fn render_input_bar(&self) -> String {
        match self.mode {
            Mode::Message => format!("> {}", self.input),
            Mode::Passthrough => "[passthrough]".to_string(),
            Mode::Menu => {
                let items: Vec<String> = MENU_ITEMS
                    .iter()
                    .enumerate()
                    .map(|(i, label)| {
                        if i == self.menu_selection {
                            format!("[{label}]")
                        } else {
                            format!(" {label} ")
                        }
                    })
                    .collect();
                format!("[menu] {}", items.join(" "))
            }
            Mode::Scroll => format!("[scroll offset={}]", self.scroll_offset),
            Mode::ScrollPassthrough => format!("[scroll+passthrough offset={}]", self.scroll_offset),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WheelDir {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
enum EscapeOutcome {
    ShiftEnter,
    ArrowUp,
    ArrowDown,
    Wheel(WheelDir),
    Other,
}

enum EscapeProgress {
    Pending,
    Complete(EscapeOutcome),
}

/// Classify a buffer that starts with ESC (0x1b). A CSI sequence (ESC `[`) ends at the first byte
/// in `0x40..=0x7e` following zero or more parameter (`0x30..=0x3f`) / intermediate (`0x20..=0x2f`)
/// bytes; an SS3 (ESC `O`) consumes exactly one final byte; any other second byte makes a
/// two-byte sequence (spec.md §4.5).
fn classify_escape(buf: &[u8]) -> EscapeProgress {
    if buf.len() < 2 {
        return EscapeProgress::Pending;
    }
    if buf.len() == 2 && buf[1] == b'O' {
        // SS3: needs exactly one more byte.
        return EscapeProgress::Pending;
    }
    if buf.len() == 2 && buf[1] != b'[' {
        // Two-byte sequence (ESC + one non-CSI, non-SS3 byte) — complete here.
        return EscapeProgress::Complete(EscapeOutcome::Other);
    }
    if buf[1] == b'O' {
        return EscapeProgress::Complete(EscapeOutcome::Other);
    }

    // CSI: ESC [ params... intermediates... final
    match buf {
        [0x1b, b'[', b'A'] => return EscapeProgress::Complete(EscapeOutcome::ArrowUp),
        [0x1b, b'[', b'B'] => return EscapeProgress::Complete(EscapeOutcome::ArrowDown),
        b"\x1b[27;2;13~" | b"\x1b[13;2~" | b"\x1b[13;2u" => {
            return EscapeProgress::Complete(EscapeOutcome::ShiftEnter)
        }
        _ => {}
    }

    let last = *buf.last().unwrap();
    if buf.len() > 2 && (0x40..=0x7e).contains(&last) {
        if let Some(dir) = classify_mouse_wheel(buf) {
            return EscapeProgress::Complete(EscapeOutcome::Wheel(dir));
        }
        return EscapeProgress::Complete(EscapeOutcome::Other);
    }
    if buf.len() > 32 {
        // Runaway sequence: give up rather than buffer forever.
        return EscapeProgress::Complete(EscapeOutcome::Other);
    }
    EscapeProgress::Pending
}

/// SGR mouse reporting: `ESC [ < Cb ; Cx ; Cy (M|m)`. Button codes 64/65 (plus modifier bits) are
/// the wheel-up/wheel-down events xterm and its descendants emit (spec.md names "scroll wheel" as
/// an input without specifying its wire encoding — SGR mouse mode is the de facto standard this
/// implementation assumes; see DESIGN.md).
fn classify_mouse_wheel(buf: &[u8]) -> Option<WheelDir> {
    if !buf.starts_with(b"\x1b[<") {
        return None;
    }
    let last = *buf.last()?;
    if last != b'M' && last != b'm' {
        return None;
    }
    let params = &buf[3..buf.len() - 1];
    let first = params.split(|&b| b == b';').next()?;
    let code: u32 = std::str::from_utf8(first).ok()?.parse().ok()?;
    match code & 0x43 {
        0x40 => Some(WheelDir::Up),
        0x41 => Some(WheelDir::Down),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn test_caps() -> (ClientCaps, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let release_count = Arc::new(AtomicUsize::new(0));
        let passthrough_granted = Arc::new(AtomicBool::new(true));
        let rc = release_count.clone();
        let pg = passthrough_granted.clone();
        let caps = ClientCaps {
            try_passthrough: Arc::new(move || pg.load(Ordering::SeqCst)),
            release_passthrough: Arc::new(move || {
                rc.fetch_add(1, Ordering::SeqCst);
            }),
            read_live: Arc::new(|| "live".to_string()),
            read_scrollback: Arc::new(|| "scrollback".to_string()),
        };
        (caps, release_count, passthrough_granted)
    }

    fn actions_submitted(actions: &[InputAction]) -> Option<&str> {
        actions.iter().find_map(|a| match a {
            InputAction::Submitted { body, .. } => Some(body.as_str()),
            _ => None,
        })
    }

    #[test]
    fn composes_and_submits_message() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        client.handle_input(b"hello");
        let actions = client.handle_input(b"\r");
        assert_eq!(actions_submitted(&actions), Some("hello"));
        assert_eq!(client.input, "");
    }

    #[test]
    fn shift_enter_inserts_newline_without_submitting() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        client.handle_input(b"line one");
        client.handle_input(b"\x1b[13;2u");
        client.handle_input(b"line two");
        let actions = client.handle_input(b"\r");
        assert_eq!(actions_submitted(&actions), Some("line one\nline two"));
    }

    #[test]
    fn history_up_restores_previous_entry_and_saves_draft() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        client.handle_input(b"first");
        client.handle_input(b"\r");
        client.handle_input(b"draft");
        client.handle_input(b"\x1b[A");
        assert_eq!(client.input, "first");
        client.handle_input(b"\x1b[B");
        assert_eq!(client.input, "draft");
    }

    #[test]
    fn passthrough_denied_keeps_message_mode() {
        let (caps, _, granted) = test_caps();
        granted.store(false, Ordering::SeqCst);
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        assert!(!client.enter_passthrough());
        assert_eq!(client.mode, Mode::Message);
    }

    #[test]
    fn passthrough_forwards_complete_csi_sequence_in_one_piece() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        assert!(client.enter_passthrough());
        let actions = client.handle_input(b"\x1b[A");
        let forwarded: Vec<u8> = actions
            .into_iter()
            .filter_map(|a| match a {
                InputAction::ForwardRaw(bytes) => Some(bytes),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(forwarded, b"\x1b[A");
    }

    #[test]
    fn bare_esc_times_out_and_exits_passthrough() {
        let (caps, release_count, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        assert!(client.enter_passthrough());
        client.handle_input(&[0x1b]);
        std::thread::sleep(Duration::from_millis(60));
        let action = client.poll_timers();
        assert!(action.is_none());
        assert_eq!(client.mode, Mode::Message);
        assert_eq!(release_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_slash_within_window_opens_menu() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        client.handle_input(b"/");
        client.handle_input(b"/");
        assert_eq!(client.mode, Mode::Menu);
    }

    #[test]
    fn slash_then_other_byte_enters_passthrough_and_forwards_slash() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        client.handle_input(b"/");
        let actions = client.handle_input(b"x");
        assert_eq!(client.mode, Mode::Passthrough);
        let forwarded: Vec<u8> = actions
            .into_iter()
            .filter_map(|a| match a {
                InputAction::ForwardRaw(bytes) => Some(bytes),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(forwarded, b"/x");
    }

    #[test]
    fn menu_enter_executes_selected_action() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        client.handle_input(b"/");
        client.handle_input(b"/");
        assert_eq!(client.mode, Mode::Menu);
        let actions = client.handle_input(b"\r");
        assert_eq!(client.mode, Mode::Message);
        assert!(actions
            .iter()
            .any(|a| matches!(a, InputAction::Menu(MenuAction::ClearInput))));
    }

    #[test]
    fn menu_arrow_moves_selection_then_enter_quits() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        client.handle_input(b"/");
        client.handle_input(b"/");
        client.handle_input(b"\x1b[B");
        client.handle_input(b"\x1b[B");
        let actions = client.handle_input(b"\r");
        assert!(actions
            .iter()
            .any(|a| matches!(a, InputAction::Menu(MenuAction::Quit))));
    }

    #[test]
    fn wheel_up_enters_scroll_mode() {
        let (caps, _, _) = test_caps();
        let mut client = Client::new(ClientId::new(), caps, 80, 24, Priority::Normal);
        client.handle_input(b"\x1b[<64;10;10M");
        assert_eq!(client.mode, Mode::Scroll);
        assert!(client.scroll_offset > 0);
    }
}
