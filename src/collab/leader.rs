use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use utoipa::ToSchema;

/// Outcome of an election round for `key`, as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LeaderChangeEvent {
    pub key: String,
    pub is_leader: bool,
    /// Peer endpoint (`host:port`) of the elected leader.
    pub leader_host: String,
}

pub trait LeaderElection: Send + Sync {
    /// Joins the election for `key`. Results arrive as [`LeaderChangeEvent`]s.
    fn start_leader_election(&self, key: &str) -> Result<()>;
}

/// Election with a leader fixed by configuration.
///
/// Announces the configured leader once per started key. Later changes are
/// published by whoever owns the event channel.
pub struct StaticLeaderElection {
    local_id: String,
    leader_host: String,
    events: broadcast::Sender<LeaderChangeEvent>,
}

impl StaticLeaderElection {
    pub fn new(
        local_id: impl Into<String>,
        leader_host: impl Into<String>,
        events: broadcast::Sender<LeaderChangeEvent>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            leader_host: leader_host.into(),
            events,
        }
    }

    /// Picks the smallest endpoint of the fleet, so every node agrees
    /// without talking to the others.
    pub fn leader_of<'a>(fleet: impl IntoIterator<Item = &'a str>) -> Option<String> {
        fleet.into_iter().min().map(str::to_string)
    }
}

impl LeaderElection for StaticLeaderElection {
    fn start_leader_election(&self, key: &str) -> Result<()> {
        let event = LeaderChangeEvent {
            key: key.to_string(),
            is_leader: self.leader_host == self.local_id,
            leader_host: self.leader_host.clone(),
        };

        info!(
            "leader for {key} is {} (local node is {})",
            event.leader_host, self.local_id
        );

        self.events
            .send(event)
            .context("nobody is listening for leader changes")?;

        Ok(())
    }
}
