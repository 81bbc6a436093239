// Room naming convention.
//
// A room is a named logical channel; its name encodes the scope it
// covers: `workspace:<id>`, `team:<id>`, `issue:<id>`, `project:<id>`,
// `cycle:<id>`, `user:<id>`. The relay stores room names as plain
// strings; this type is how publishers construct them without typos.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    Workspace(String),
    Team(String),
    Issue(String),
    Project(String),
    Cycle(String),
    User(String),
}

impl Room {
    pub fn scope(&self) -> &'static str {
        match self {
            Self::Workspace(_) => "workspace",
            Self::Team(_) => "team",
            Self::Issue(_) => "issue",
            Self::Project(_) => "project",
            Self::Cycle(_) => "cycle",
            Self::User(_) => "user",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Workspace(id)
            | Self::Team(id)
            | Self::Issue(id)
            | Self::Project(id)
            | Self::Cycle(id)
            | Self::User(id) => id,
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope(), self.id())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoomParseError {
    #[error("room name `{0}` has no `scope:id` separator")]
    MissingSeparator(String),
    #[error("unknown room scope `{0}`")]
    UnknownScope(String),
    #[error("room name has an empty id")]
    EmptyId,
}

impl FromStr for Room {
    type Err = RoomParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (scope, id) = value
            .split_once(':')
            .ok_or_else(|| RoomParseError::MissingSeparator(value.to_string()))?;

        if id.is_empty() {
            return Err(RoomParseError::EmptyId);
        }

        let id = id.to_string();
        match scope {
            "workspace" => Ok(Self::Workspace(id)),
            "team" => Ok(Self::Team(id)),
            "issue" => Ok(Self::Issue(id)),
            "project" => Ok(Self::Project(id)),
            "cycle" => Ok(Self::Cycle(id)),
            "user" => Ok(Self::User(id)),
            other => Err(RoomParseError::UnknownScope(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Room, RoomParseError};

    #[test]
    fn names_follow_the_scope_id_convention() {
        assert_eq!(Room::Workspace("w1".into()).name(), "workspace:w1");
        assert_eq!(Room::Team("7".into()).name(), "team:7");
        assert_eq!(Room::Issue("42".into()).name(), "issue:42");
        assert_eq!(Room::Project("p9".into()).name(), "project:p9");
        assert_eq!(Room::Cycle("c3".into()).name(), "cycle:c3");
        assert_eq!(Room::User("u5".into()).name(), "user:u5");
    }

    #[test]
    fn parse_round_trips_every_scope() {
        for name in
            ["workspace:w1", "team:7", "issue:42", "project:p9", "cycle:c3", "user:u5"]
        {
            let room: Room = name.parse().expect("conventional name should parse");
            assert_eq!(room.name(), name);
        }
    }

    #[test]
    fn parse_rejects_unconventional_names() {
        assert_eq!(
            "lobby".parse::<Room>(),
            Err(RoomParseError::MissingSeparator("lobby".to_string()))
        );
        assert_eq!(
            "galaxy:9".parse::<Room>(),
            Err(RoomParseError::UnknownScope("galaxy".to_string()))
        );
        assert_eq!("issue:".parse::<Room>(), Err(RoomParseError::EmptyId));
    }

    #[test]
    fn ids_may_contain_further_colons() {
        let room: Room = "issue:org:42".parse().expect("id with colon should parse");
        assert_eq!(room, Room::Issue("org:42".into()));
    }
}
