//! Agent State Tracker (spec.md §4.4): maintains a best-known state for the agent running in the
//! PTY, fed from three sources of descending trust — hook events, telemetry HTTP events, and an
//! output-timing heuristic. A higher-ranked source's state is "committed": once set, a
//! lower-ranked source cannot overwrite it until the higher-ranked source explicitly releases it
//! (by reporting `Idle` or `Exited`). Grounded on the teacher's `config.rs` `OnceLock` singleton
//! idiom for one-time setup, and on `web_server.rs`'s axum route wiring for the supplemented
//! telemetry receiver.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use axum::extract::State as AxumState;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentState {
    Active,
    ActiveDetail { detail: String },
    Idle,
    BlockedOnPermission { tool: String },
    Compacting,
    Exited { reason: String },
}

/// Lower number wins: a report from a lower-ranked source cannot overwrite a state committed by
/// a higher-ranked source until that source reports `Idle` or `Exited` (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SourceRank {
    Hook = 1,
    Telemetry = 2,
    OutputHeuristic = 3,
}

struct Inner {
    state: AgentState,
    committed_by: SourceRank,
}

pub struct Tracker {
    inner: StdMutex<Inner>,
    /// Mirrors `inner.committed_by` for lock-free reads from hot paths (the output-timing
    /// heuristic checks this on every chunk).
    committed_rank: AtomicU8,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Tracker {
            inner: StdMutex::new(Inner {
                state: AgentState::Idle,
                committed_by: SourceRank::OutputHeuristic,
            }),
            committed_rank: AtomicU8::new(SourceRank::OutputHeuristic as u8),
        })
    }

    /// Report a state from `source`. Releasing states (`Idle`, `Exited`) always apply and drop
    /// the commit all the way to the lowest-authority rank, opening the door for every source
    /// again regardless of which source released. Non-releasing states only apply if `source`
    /// outranks (or equals) whoever currently holds the commit.
    pub fn report(&self, source: SourceRank, state: AgentState) {
        let releasing = matches!(state, AgentState::Idle | AgentState::Exited { .. });
        let mut inner = self.inner.lock().expect("tracker mutex");
        if releasing || source <= inner.committed_by {
            inner.committed_by = if releasing { SourceRank::OutputHeuristic } else { source };
            inner.state = state;
            self.committed_rank.store(inner.committed_by as u8, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> AgentState {
        self.inner.lock().expect("tracker mutex").state.clone()
    }

    /// Rank 3 heuristic input: call on every PTY output chunk timing observation. Only takes
    /// effect if no higher-ranked source currently holds the commit.
    pub fn observe_output_heuristic(&self, state: AgentState) {
        if self.committed_rank.load(Ordering::Relaxed) >= SourceRank::OutputHeuristic as u8 {
            self.report(SourceRank::OutputHeuristic, state);
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelemetryEvent {
    state: AgentState,
}

/// Start the supplemented telemetry HTTP receiver on an ephemeral localhost port. Returns the
/// bound port so the caller can pass it to the child via environment variable. Not part of
/// spec.md's component table verbatim — added because spec.md §4.4 names "telemetry events" as
/// rank 2 input without specifying a transport; a loopback HTTP POST endpoint matches how the
/// teacher's own `web_server.rs` exposes local control surfaces.
pub async fn start_telemetry_receiver(
    tracker: Arc<Tracker>,
) -> std::io::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = Router::new()
        .route("/events", post(handle_event))
        .with_state(tracker);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((addr, handle))
}

async fn handle_event(
    AxumState(tracker): AxumState<Arc<Tracker>>,
    Json(event): Json<TelemetryEvent>,
) -> &'static str {
    tracker.report(SourceRank::Telemetry, event.state);
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_state_resists_lower_ranked_overwrite() {
        let t = Tracker::new();
        t.report(SourceRank::Hook, AgentState::BlockedOnPermission { tool: "bash".into() });
        t.observe_output_heuristic(AgentState::Active);
        assert_eq!(
            t.current(),
            AgentState::BlockedOnPermission { tool: "bash".into() }
        );
    }

    #[test]
    fn releasing_state_reopens_lower_ranks() {
        let t = Tracker::new();
        t.report(SourceRank::Hook, AgentState::Compacting);
        t.report(SourceRank::Hook, AgentState::Idle);
        t.observe_output_heuristic(AgentState::Active);
        assert_eq!(t.current(), AgentState::Active);
    }

    #[test]
    fn telemetry_outranks_heuristic() {
        let t = Tracker::new();
        t.report(SourceRank::Telemetry, AgentState::Compacting);
        t.observe_output_heuristic(AgentState::Active);
        assert_eq!(t.current(), AgentState::Compacting);
    }
}
