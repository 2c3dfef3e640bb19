//! Discovery descriptor served at `{base_path}/service-info`.

use crate::config::ServiceConfig;
use serde::{Deserialize, Serialize};

/// Organization running the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub url: String,
}

/// Service descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub organization: Organization,
    pub contact_url: String,
    pub version: String,
}

impl From<&ServiceConfig> for ServiceInfo {
    fn from(config: &ServiceConfig) -> Self {
        let kind = config
            .kind
            .clone()
            .unwrap_or_else(|| format!("{}:{}", config.id, config.version));

        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            kind,
            description: config.description.clone(),
            organization: Organization {
                name: config.organization_name.clone(),
                url: config.organization_url.clone(),
            },
            contact_url: config.contact_url.clone(),
            version: config.version.clone(),
        }
    }
}
