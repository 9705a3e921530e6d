//! Node identity types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Deployment role of a node, fixed at provisioning time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Coordinating node; hosts the broker and issues playback commands
    Brain,
    /// Display node that executes playback commands
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Brain => write!(f, "brain"),
            Role::Client => write!(f, "client"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "brain" => Ok(Role::Brain),
            "client" => Ok(Role::Client),
            other => Err(format!("unknown role '{}', expected 'brain' or 'client'", other)),
        }
    }
}

/// A node in the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Role deciding which components run
    pub role: Role,
    /// Node id; doubles as the broker client id
    pub id: String,
    /// Host name of the machine
    pub hostname: String,
}

impl Node {
    /// Build a node identity, falling back to the machine host name for
    /// missing values.
    pub fn resolve(role: Role, id: Option<&str>, hostname: Option<&str>) -> Self {
        let hostname = hostname
            .map(str::to_string)
            .or_else(sysinfo::System::host_name)
            .unwrap_or_else(|| "localhost".to_string());
        let id = match id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("{}-{}", role, hostname),
        };
        Self { role, id, hostname }
    }

    pub fn is_brain(&self) -> bool {
        self.role == Role::Brain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("brain".parse::<Role>().unwrap(), Role::Brain);
        assert_eq!(" Client ".parse::<Role>().unwrap(), Role::Client);
        assert!("server".parse::<Role>().is_err());
        assert_eq!(Role::Client.to_string(), "client");
    }

    #[test]
    fn test_node_id_defaults_to_role_and_hostname() {
        let node = Node::resolve(Role::Client, None, Some("pi-3"));
        assert_eq!(node.id, "client-pi-3");
        assert_eq!(node.hostname, "pi-3");

        let named = Node::resolve(Role::Brain, Some("brain-1"), Some("pi-0"));
        assert_eq!(named.id, "brain-1");
        assert!(named.is_brain());
    }
}
