// Event publishing: resolves an application-level scope to the rooms
// that must hear about it, then fans a single serialized envelope out
// through the registry. Delivery is best-effort; publishing never
// waits on any recipient.

use std::sync::Arc;

use beacon_common::protocol::ws::{EventKind, ServerEvent};
use beacon_common::room::Room;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::realtime::registry::ConnectionRegistry;

/// Where in the workspace an event happened. Each scope resolves to
/// the set of rooms whose subscribers should receive the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    /// Issue mutations notify the owning team and the issue's own room.
    Issue { team_id: String, issue_id: String },
    /// Comments follow the same routing as their parent issue.
    Comment { team_id: String, issue_id: String },
    Project { project_id: String },
    Cycle { cycle_id: String },
    /// Typing indicators only go to viewers of the issue itself.
    Typing { issue_id: String },
    /// Personal notifications target a single user's room.
    Notification { user_id: Uuid },
    Workspace { workspace_id: String },
}

impl EventScope {
    pub fn rooms(&self) -> Vec<String> {
        match self {
            Self::Issue { team_id, issue_id } | Self::Comment { team_id, issue_id } => vec![
                Room::Team(team_id.clone()).to_string(),
                Room::Issue(issue_id.clone()).to_string(),
            ],
            Self::Project { project_id } => vec![Room::Project(project_id.clone()).to_string()],
            Self::Cycle { cycle_id } => vec![Room::Cycle(cycle_id.clone()).to_string()],
            Self::Typing { issue_id } => vec![Room::Issue(issue_id.clone()).to_string()],
            Self::Notification { user_id } => {
                vec![Room::User(user_id.to_string()).to_string()]
            }
            Self::Workspace { workspace_id } => {
                vec![Room::Workspace(workspace_id.clone()).to_string()]
            }
        }
    }
}

/// Handle the rest of the application uses to emit realtime events.
#[derive(Clone)]
pub struct EventPublisher {
    registry: Arc<ConnectionRegistry>,
}

impl EventPublisher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Serialize the event once and deliver it to every current member
    /// of the scope's rooms. A connection subscribed to more than one
    /// of those rooms receives exactly one copy. Returns the number of
    /// deliveries made; members whose transport has gone away are
    /// skipped, never retried.
    pub async fn publish(
        &self,
        scope: EventScope,
        kind: EventKind,
        payload: Value,
        acting_user: Option<Uuid>,
    ) -> anyhow::Result<usize> {
        let rooms = scope.rooms();
        let event = ServerEvent::new(kind, payload, acting_user);
        let raw: Arc<str> = Arc::from(event.encode()?);

        let delivered = self.registry.fan_out(&rooms, &raw).await;
        debug!(kind = kind.as_str(), ?rooms, delivered, "published event");
        Ok(delivered)
    }
}
