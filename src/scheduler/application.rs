use serde::{Deserialize, Serialize};

use crate::scheduler::job::Resources;

/// How a task is executed on the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Container {
    /// Run the command directly in the agent's sandbox.
    #[default]
    Mesos,
    /// Run the command inside the given image.
    Docker { image: String },
}

/// Execution template that jobs are submitted against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub appid: String,
    pub owner: String,
    /// URIs staged into the sandbox before the command runs, in order.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub container: Container,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Used for jobs that are submitted without a resource request.
    #[serde(default)]
    pub default_resources: Option<Resources>,
}

fn enabled_by_default() -> bool {
    true
}

impl Application {
    pub fn new(appid: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            appid: appid.into(),
            owner: owner.into(),
            files: Vec::new(),
            container: Container::Mesos,
            enabled: true,
            default_resources: None,
        }
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.container = container;
        self
    }

    pub fn with_file(mut self, uri: impl Into<String>) -> Self {
        self.files.push(uri.into());
        self
    }

    pub fn with_default_resources(mut self, resources: Resources) -> Self {
        self.default_resources = Some(resources);
        self
    }

    /// Ownership gate: only the owner may see or mutate the application and its jobs.
    pub fn is_owned_by(&self, requester: &str) -> bool {
        self.owner == requester
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_is_tagged_by_type() {
        let docker = Container::Docker {
            image: "alpine:latest".to_string(),
        };
        let json = serde_json::to_value(&docker).unwrap();
        assert_eq!(json["type"], "docker");
        assert_eq!(json["image"], "alpine:latest");

        let mesos: Container = serde_json::from_str(r#"{"type":"mesos"}"#).unwrap();
        assert_eq!(mesos, Container::Mesos);
    }

    #[test]
    fn application_defaults_when_fields_missing() {
        let app: Application = serde_json::from_str(r#"{"appid":"t","owner":"alice"}"#).unwrap();
        assert!(app.enabled);
        assert!(app.files.is_empty());
        assert_eq!(app.container, Container::Mesos);
        assert!(app.is_owned_by("alice"));
        assert!(!app.is_owned_by("bob"));
    }
}
