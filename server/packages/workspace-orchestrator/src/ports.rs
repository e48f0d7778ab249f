//! Deterministic port assignment.
//!
//! Each repository in a sandbox owns a slot; the slot alone decides the three
//! ports its services bind. The base ranges never overlap for slots below
//! [`MAX_SLOTS`], so two repositories can never collide.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use workspace_orchestrator_error::OrchestratorError;

use crate::services::ServiceKind;

pub const EDITOR_BASE_PORT: u16 = 8080;
pub const TERMINAL_BASE_PORT: u16 = 10000;
pub const AGENT_BASE_PORT: u16 = 4000;

/// Number of slots each base range can hold.
pub const MAX_SLOTS: u32 = 1000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
    JsonSchema,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct RepositorySlot(u32);

impl TryFrom<u32> for RepositorySlot {
    type Error = OrchestratorError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RepositorySlot> for u32 {
    fn from(value: RepositorySlot) -> Self {
        value.0
    }
}

impl RepositorySlot {
    pub fn new(slot: u32) -> Result<Self, OrchestratorError> {
        if slot >= MAX_SLOTS {
            return Err(OrchestratorError::InvalidRequest {
                message: format!("repository slot {slot} exceeds the limit of {MAX_SLOTS}"),
            });
        }
        Ok(Self(slot))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    fn offset(self) -> u16 {
        // Bounded by MAX_SLOTS, which fits in u16.
        self.0 as u16
    }
}

impl std::fmt::Display for RepositorySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct PortTriple {
    pub editor: u16,
    pub terminal: u16,
    pub agent: u16,
}

impl PortTriple {
    pub fn port(&self, service: ServiceKind) -> u16 {
        match service {
            ServiceKind::Editor => self.editor,
            ServiceKind::Terminal => self.terminal,
            ServiceKind::AgentTerminal => self.agent,
        }
    }

    pub fn all(&self) -> [u16; 3] {
        [self.editor, self.terminal, self.agent]
    }
}

pub fn ports_for_slot(slot: RepositorySlot) -> PortTriple {
    PortTriple {
        editor: EDITOR_BASE_PORT + slot.offset(),
        terminal: TERMINAL_BASE_PORT + slot.offset(),
        agent: AGENT_BASE_PORT + slot.offset(),
    }
}

/// Ports as persisted on a repository record. Records written before a
/// service existed are missing that service's port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct StoredPorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<u16>,
}

impl StoredPorts {
    pub fn complete(&self) -> Option<PortTriple> {
        Some(PortTriple {
            editor: self.editor?,
            terminal: self.terminal?,
            agent: self.agent?,
        })
    }

    /// Fills only the missing ports from `slot`, keeping the ones already
    /// assigned. Returns the full triple and whether anything was filled.
    pub fn repair(&mut self, slot: RepositorySlot) -> (PortTriple, bool) {
        let derived = ports_for_slot(slot);
        let mut repaired = false;
        for (stored, fresh) in [
            (&mut self.editor, derived.editor),
            (&mut self.terminal, derived.terminal),
            (&mut self.agent, derived.agent),
        ] {
            if stored.is_none() {
                *stored = Some(fresh);
                repaired = true;
            }
        }
        let triple = PortTriple {
            editor: self.editor.unwrap_or(derived.editor),
            terminal: self.terminal.unwrap_or(derived.terminal),
            agent: self.agent.unwrap_or(derived.agent),
        };
        (triple, repaired)
    }
}

impl From<PortTriple> for StoredPorts {
    fn from(value: PortTriple) -> Self {
        Self {
            editor: Some(value.editor),
            terminal: Some(value.terminal),
            agent: Some(value.agent),
        }
    }
}
