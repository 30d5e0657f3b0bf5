use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const ANONYMOUS_ACTOR: &str = "anonymous";

/// Session metadata captured alongside every administrative change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Client program or host the change came from.
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Identity of whoever performs an administrative call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminContext {
    pub actor: String,
    #[serde(default)]
    pub session: SessionContext,
}

impl AdminContext {
    pub fn new(actor: impl Into<String>) -> Self {
        let actor = actor.into();
        let actor = if actor.trim().is_empty() {
            ANONYMOUS_ACTOR.to_string()
        } else {
            actor.trim().to_string()
        };
        Self {
            actor,
            session: SessionContext::default(),
        }
    }

    /// Context for internal callers such as maintenance sweeps or seeding.
    pub fn system(component: &str) -> Self {
        Self::new(format!("system:{component}")).with_client("beacon")
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session.session_id = Some(session_id.into());
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.session.client = Some(client.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.session.attributes.insert(key.into(), value.into());
        self
    }
}

impl Default for AdminContext {
    fn default() -> Self {
        Self::new(ANONYMOUS_ACTOR)
    }
}
