//! Parsing of a pipeline's `pipeline_definition` JSON document: enough of
//! it to resolve which environments a run depends on. The full authoring
//! format (step positions, file paths, data connections) is a front-end
//! concern; the control plane only needs the DAG's environment
//! references in order to drive the Resource Locker (§4.4).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pipeline step references an environment by uuid; `services` are
/// sidecar containers that may also reference an environment image via
/// the `environment@<uuid>` convention, or an arbitrary external image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub steps: std::collections::HashMap<Uuid, Step>,
    #[serde(default)]
    pub services: std::collections::HashMap<String, Service>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub environment: Uuid,
    #[serde(default)]
    pub incoming_connections: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
}

const ENVIRONMENT_IMAGE_PREFIX: &str = "environment@";

impl PipelineDefinition {
    pub fn parse(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Every environment uuid referenced by any step or by a
    /// `services[*].image` of the form `environment@<uuid>`. Services
    /// pointing at an external image (no `environment@` prefix) do not
    /// contribute a reference — they are not materialized by the CRA
    /// build pipeline and need no lock row.
    pub fn referenced_environments(&self) -> BTreeSet<Uuid> {
        let mut envs: BTreeSet<Uuid> = self.steps.values().map(|step| step.environment).collect();

        for service in self.services.values() {
            if let Some(uuid_str) = service.image.strip_prefix(ENVIRONMENT_IMAGE_PREFIX) {
                if let Ok(uuid) = Uuid::parse_str(uuid_str) {
                    envs.insert(uuid);
                }
            }
        }

        envs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn collects_environments_from_steps() {
        let def = PipelineDefinition::parse(&json!({
            "steps": {
                uuid(1).to_string(): { "environment": uuid(2).to_string() },
                uuid(3).to_string(): { "environment": uuid(2).to_string() },
            },
            "services": {},
        }))
        .unwrap();

        assert_eq!(def.referenced_environments(), BTreeSet::from([uuid(2)]));
    }

    #[test]
    fn service_with_environment_prefixed_image_contributes_a_reference() {
        let def = PipelineDefinition::parse(&json!({
            "steps": {},
            "services": {
                "memory-server": { "image": format!("environment@{}", uuid(9)) },
            },
        }))
        .unwrap();

        assert_eq!(def.referenced_environments(), BTreeSet::from([uuid(9)]));
    }

    #[test]
    fn service_with_external_image_contributes_nothing() {
        let def = PipelineDefinition::parse(&json!({
            "steps": {},
            "services": {
                "redis": { "image": "redis:7" },
            },
        }))
        .unwrap();

        assert!(def.referenced_environments().is_empty());
    }

    #[test]
    fn missing_steps_and_services_default_to_empty() {
        let def = PipelineDefinition::parse(&json!({})).unwrap();
        assert!(def.referenced_environments().is_empty());
    }
}
