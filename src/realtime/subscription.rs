use thiserror::Error;

/// Subscribes to every chat the token can see.
pub const WILDCARD: &str = "*";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("--all cannot be combined with --chat-id")]
    AllWithChatIds,
    #[error("provide --chat-id (repeatable) or --all")]
    Empty,
    #[error("chat id at position {0} is empty")]
    BlankChatId(usize),
    #[error("the wildcard chat id \"*\" cannot be combined with other chat ids")]
    WildcardWithChatIds,
    #[error("{0}")]
    Invalid(String),
}

/// Validated set of chat ids to stream, re-sent as-is after every reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSet {
    chat_ids: Vec<String>,
}

impl SubscriptionSet {
    pub fn wildcard() -> Self {
        Self {
            chat_ids: vec![WILDCARD.to_string()],
        }
    }

    pub fn chat_ids(&self) -> &[String] {
        &self.chat_ids
    }

    pub fn is_wildcard(&self) -> bool {
        self.chat_ids.len() == 1 && self.chat_ids[0] == WILDCARD
    }
}

pub fn resolve(all: bool, explicit_ids: &[String]) -> Result<SubscriptionSet, UsageError> {
    if all && !explicit_ids.is_empty() {
        return Err(UsageError::AllWithChatIds);
    }
    if all {
        return Ok(SubscriptionSet::wildcard());
    }
    if explicit_ids.is_empty() {
        return Err(UsageError::Empty);
    }

    let mut chat_ids: Vec<String> = Vec::with_capacity(explicit_ids.len());
    for (index, id) in explicit_ids.iter().enumerate() {
        let id = id.trim();
        if id.is_empty() {
            return Err(UsageError::BlankChatId(index + 1));
        }
        if !chat_ids.iter().any(|existing| existing == id) {
            chat_ids.push(id.to_string());
        }
    }

    if chat_ids.len() > 1 && chat_ids.iter().any(|id| id == WILDCARD) {
        return Err(UsageError::WildcardWithChatIds);
    }

    Ok(SubscriptionSet { chat_ids })
}
