use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::domain::{ApproverRole, RequestType};

/// Whether steps of a route may be answered in any order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRouting {
    #[default]
    Parallel,
    Sequential,
}

/// Approver roles prescribed for one request type, in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRoute {
    pub roles: Vec<ApproverRole>,
    #[serde(default)]
    pub routing: ApprovalRouting,
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("no approval route defined for request type `{}`", .0.label())]
    MissingRoute(RequestType),
    #[error("approval route for `{}` lists no approver roles", .0.label())]
    EmptyRoute(RequestType),
    #[error("approval route for `{}` lists role `{role}` more than once", .request_type.label())]
    DuplicateRole {
        request_type: RequestType,
        role: ApproverRole,
    },
    #[error("failed to read workflow definition {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse workflow definition {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Declarative table mapping each request type to the roles that must sign off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WorkflowDefinition {
    routes: BTreeMap<RequestType, ApprovalRoute>,
}

impl WorkflowDefinition {
    pub fn standard() -> Self {
        Self {
            routes: standard_routes(),
        }
    }

    /// Build a table from raw routes, requiring a non-empty, duplicate-free route per type.
    pub fn from_routes(
        routes: BTreeMap<RequestType, ApprovalRoute>,
    ) -> Result<Self, DefinitionError> {
        for request_type in RequestType::ordered() {
            let route = routes
                .get(&request_type)
                .ok_or(DefinitionError::MissingRoute(request_type))?;
            if route.roles.is_empty() {
                return Err(DefinitionError::EmptyRoute(request_type));
            }
            let mut seen = BTreeSet::new();
            for role in &route.roles {
                if !seen.insert(*role) {
                    return Err(DefinitionError::DuplicateRole {
                        request_type,
                        role: *role,
                    });
                }
            }
        }

        Ok(Self { routes })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let routes: BTreeMap<RequestType, ApprovalRoute> = serde_json::from_str(raw)?;
        Self::from_routes(routes).map_err(serde::de::Error::custom)
    }

    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: display.clone(),
            source,
        })?;
        let routes: BTreeMap<RequestType, ApprovalRoute> = serde_json::from_str(&raw)
            .map_err(|source| DefinitionError::Parse {
                path: display,
                source,
            })?;
        Self::from_routes(routes)
    }

    pub fn route(&self, request_type: RequestType) -> Option<&ApprovalRoute> {
        self.routes.get(&request_type)
    }

    pub fn routes(&self) -> impl Iterator<Item = (RequestType, &ApprovalRoute)> {
        self.routes.iter().map(|(kind, route)| (*kind, route))
    }

    /// Every approver role referenced by any route.
    pub fn role_vocabulary(&self) -> BTreeSet<ApproverRole> {
        self.routes
            .values()
            .flat_map(|route| route.roles.iter().copied())
            .collect()
    }
}

impl Default for WorkflowDefinition {
    fn default() -> Self {
        Self::standard()
    }
}

fn standard_routes() -> BTreeMap<RequestType, ApprovalRoute> {
    BTreeMap::from([
        (
            RequestType::Withdrawal,
            ApprovalRoute {
                roles: vec![
                    ApproverRole::ProgramLeader,
                    ApproverRole::Finance,
                    ApproverRole::Library,
                    ApproverRole::Registrar,
                ],
                routing: ApprovalRouting::Parallel,
            },
        ),
        (
            RequestType::Deferment,
            ApprovalRoute {
                roles: vec![
                    ApproverRole::AcademicAdvisor,
                    ApproverRole::ProgramLeader,
                    ApproverRole::Registrar,
                ],
                routing: ApprovalRouting::Parallel,
            },
        ),
        (
            RequestType::Reinstatement,
            ApprovalRoute {
                roles: vec![
                    ApproverRole::StudentAffairs,
                    ApproverRole::ProgramLeader,
                    ApproverRole::Registrar,
                ],
                routing: ApprovalRouting::Sequential,
            },
        ),
    ])
}
