use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One message on a branch. Immutable once appended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message about to be appended. Id and creation time are optional and
/// assigned by the tree on append when absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl MessageDraft {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            created_at: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// Fill in the missing id and timestamp.
    pub fn finalize(self, now: DateTime<Utc>) -> Message {
        Message {
            id: self.id.unwrap_or_default(),
            role: self.role,
            content: self.content,
            created_at: self.created_at.unwrap_or(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_assigns_id_and_time() {
        let now = Utc::now();
        let msg = MessageDraft::user("hello").finalize(now);
        assert!(msg.id.as_str().starts_with("msg_"));
        assert_eq!(msg.created_at, now);
        assert_eq!(msg.role, Role::User);
    }

    #[test]
    fn finalize_keeps_caller_supplied_fields() {
        let id = MessageId::from_raw("msg_fixed");
        let at = Utc::now() - chrono::Duration::hours(1);
        let mut draft = MessageDraft::assistant("reply");
        draft.id = Some(id.clone());
        draft.created_at = Some(at);

        let msg = draft.finalize(Utc::now());
        assert_eq!(msg.id, id);
        assert_eq!(msg.created_at, at);
    }

    #[test]
    fn role_serde_uses_snake_case() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn role_display_and_from_str_roundtrip() {
        for role in [Role::User, Role::Assistant, Role::Tool, Role::System] {
            let parsed: Role = role.to_string().parse().unwrap();
            assert_eq!(role, parsed);
        }
    }
}
