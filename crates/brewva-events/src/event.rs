//! Event types published on the channel bus.

use serde::{Deserialize, Serialize};

/// All events emitted by the channel orchestration subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// An inbound turn passed dedupe and was appended to the WAL.
    ChannelTurnAccepted {
        /// Scope the turn was queued under.
        scope_key: String,
        /// Envelope turn id.
        turn_id: String,
        /// WAL record id, when the WAL is enabled.
        wal_id: Option<String>,
    },

    /// A turn was handed to an agent session.
    ChannelTurnDispatched {
        /// Scope the turn was queued under.
        scope_key: String,
        /// Envelope turn id.
        turn_id: String,
        /// Target agent.
        agent_id: String,
    },

    /// A turn finished its pipeline and was marked done.
    ChannelTurnDone {
        /// Scope the turn was queued under.
        scope_key: String,
        /// Envelope turn id.
        turn_id: String,
    },

    /// A turn's pipeline failed; the WAL record was marked failed.
    ChannelTurnFailed {
        /// Scope the turn was queued under.
        scope_key: String,
        /// Envelope turn id.
        turn_id: String,
        /// Error rendered to a string.
        error: String,
    },

    /// An outbound provider send failed; later sends still proceed.
    ChannelTurnOutboundError {
        /// Turn the outbound emission belonged to.
        turn_id: String,
        /// Agent that produced the outbound turn.
        agent_id: String,
        /// Error rendered to a string.
        error: String,
    },

    /// A durable store could not persist; in-memory state stays authoritative.
    StorePersistFailed {
        /// Store name, e.g. `approval-state`.
        store: String,
        /// Error rendered to a string.
        error: String,
    },

    /// The ingress rejected a request.
    IngressRejected {
        /// Rejection reason, e.g. `replayed nonce`.
        reason: String,
    },

    /// An agent was created or reactivated.
    AgentCreated {
        /// The agent id.
        agent_id: String,
    },

    /// An agent was soft-deleted.
    AgentDeleted {
        /// The agent id.
        agent_id: String,
    },

    /// A runtime (and its sessions) was evicted from the pool.
    RuntimeEvicted {
        /// The agent whose runtime was evicted.
        agent_id: String,
        /// `lru` or `idle_ttl`.
        reason: String,
    },

    /// Startup recovery replayed WAL records.
    WalRecovered {
        /// WAL scope that was scanned.
        scope: String,
        /// Number of non-terminal records re-enqueued.
        replayed: usize,
    },

    /// Periodic compaction rewrote the WAL.
    WalCompacted {
        /// WAL scope that was compacted.
        scope: String,
        /// Terminal records dropped.
        dropped: usize,
    },

    /// A discussion ended early on a stop signal.
    DiscussionStopped {
        /// Agent that emitted the stop signal.
        stopped_by: String,
        /// Round in which the signal appeared (1-based).
        round: u32,
    },

    /// Graceful shutdown began.
    ShutdownStarted,

    /// Graceful shutdown finished.
    ShutdownComplete,
}

impl ChannelEvent {
    /// Stable snake_case name of the event, for logs and filters.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ChannelTurnAccepted { .. } => "channel_turn_accepted",
            Self::ChannelTurnDispatched { .. } => "channel_turn_dispatched",
            Self::ChannelTurnDone { .. } => "channel_turn_done",
            Self::ChannelTurnFailed { .. } => "channel_turn_failed",
            Self::ChannelTurnOutboundError { .. } => "channel_turn_outbound_error",
            Self::StorePersistFailed { .. } => "store_persist_failed",
            Self::IngressRejected { .. } => "ingress_rejected",
            Self::AgentCreated { .. } => "agent_created",
            Self::AgentDeleted { .. } => "agent_deleted",
            Self::RuntimeEvicted { .. } => "runtime_evicted",
            Self::WalRecovered { .. } => "wal_recovered",
            Self::WalCompacted { .. } => "wal_compacted",
            Self::DiscussionStopped { .. } => "discussion_stopped",
            Self::ShutdownStarted => "shutdown_started",
            Self::ShutdownComplete => "shutdown_complete",
        }
    }
}
