//! Server identifiers and capability namespacing.
//!
//! A capability exposed by server `alpha` is renamed so it can never collide
//! with a capability of another server:
//!
//! | kind              | namespaced form        |
//! |-------------------|------------------------|
//! | tool              | `alpha_t_search`       |
//! | prompt            | `alpha_p_summarize`    |
//! | resource          | `alpha:file:///notes`  |
//! | resource template | `alpha:file:///{path}` |
//!
//! [`ServerId`] validation guarantees that splitting a namespaced id at the
//! first separator recovers exactly the original pair.

use crate::error::RouterError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

pub const TOOL_SEPARATOR: &str = "_t_";
pub const PROMPT_SEPARATOR: &str = "_p_";
pub const RESOURCE_SEPARATOR: &str = ":";

/// Validated, stable identifier of a downstream server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Result<Self, RouterError> {
        let id = id.into();
        let invalid = |reason: &str| RouterError::InvalidServerId {
            id: id.clone(),
            reason: reason.to_string(),
        };

        if id.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(invalid("must not contain whitespace"));
        }
        if id.contains(RESOURCE_SEPARATOR) {
            return Err(invalid("must not contain ':'"));
        }
        if id.contains(TOOL_SEPARATOR) || id.contains(PROMPT_SEPARATOR) {
            return Err(invalid("must not contain '_t_' or '_p_'"));
        }
        if id.ends_with("_t") || id.ends_with("_p") {
            return Err(invalid("must not end with '_t' or '_p'"));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ServerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ServerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServerId {
    type Error = RouterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ServerId {
    type Error = RouterError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServerId> for String {
    fn from(id: ServerId) -> Self {
        id.0
    }
}

/// The four kinds of capability a server can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
    ResourceTemplate,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 4] = [
        CapabilityKind::Tool,
        CapabilityKind::Prompt,
        CapabilityKind::Resource,
        CapabilityKind::ResourceTemplate,
    ];

    pub fn separator(self) -> &'static str {
        match self {
            Self::Tool => TOOL_SEPARATOR,
            Self::Prompt => PROMPT_SEPARATOR,
            Self::Resource | Self::ResourceTemplate => RESOURCE_SEPARATOR,
        }
    }

    /// Method used to enumerate this kind.
    pub fn list_method(self) -> &'static str {
        use crate::protocol::methods;
        match self {
            Self::Tool => methods::TOOLS_LIST,
            Self::Prompt => methods::PROMPTS_LIST,
            Self::Resource => methods::RESOURCES_LIST,
            Self::ResourceTemplate => methods::RESOURCE_TEMPLATES_LIST,
        }
    }

    /// Field of the list result holding the entries.
    pub fn result_field(self) -> &'static str {
        match self {
            Self::Tool => "tools",
            Self::Prompt => "prompts",
            Self::Resource => "resources",
            Self::ResourceTemplate => "resourceTemplates",
        }
    }

    /// Field of an entry holding its identifier.
    pub fn id_field(self) -> &'static str {
        match self {
            Self::Tool | Self::Prompt => "name",
            Self::Resource => "uri",
            Self::ResourceTemplate => "uriTemplate",
        }
    }

    /// Key of the `initialize` capabilities object advertising this kind.
    pub fn server_capability(self) -> &'static str {
        match self {
            Self::Tool => "tools",
            Self::Prompt => "prompts",
            Self::Resource | Self::ResourceTemplate => "resources",
        }
    }

    pub fn list_changed_method(self) -> &'static str {
        use crate::protocol::methods;
        match self {
            Self::Tool => methods::TOOLS_LIST_CHANGED,
            Self::Prompt => methods::PROMPTS_LIST_CHANGED,
            Self::Resource | Self::ResourceTemplate => methods::RESOURCES_LIST_CHANGED,
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tool => "tool",
            Self::Prompt => "prompt",
            Self::Resource => "resource",
            Self::ResourceTemplate => "resource template",
        };
        f.write_str(name)
    }
}

/// Derive the namespaced id of a capability.
pub fn namespace(server: &ServerId, kind: CapabilityKind, original: &str) -> String {
    format!("{}{}{}", server, kind.separator(), original)
}

/// Split a namespaced id into its server and original id.
///
/// Returns `None` when the prefix is not a valid server id.
pub fn split(kind: CapabilityKind, namespaced: &str) -> Option<(ServerId, String)> {
    let (server, original) = namespaced.split_once(kind.separator())?;
    let server = ServerId::new(server).ok()?;
    Some((server, original.to_string()))
}

/// Match a concrete URI against an RFC 6570 level-1 template such as
/// `file:///{path}`. Each `{var}` expands to one or more characters.
pub fn template_matches(template: &str, uri: &str) -> bool {
    let mut literals = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        literals.push(&rest[..start]);
        rest = &rest[start + end + 1..];
    }
    literals.push(rest);

    if literals.len() == 1 {
        return template == uri;
    }

    let Some(mut remaining) = uri.strip_prefix(literals[0]) else {
        return false;
    };
    let last = literals.len() - 1;
    for (index, literal) in literals.iter().enumerate().skip(1) {
        if index == last {
            return remaining.len() > literal.len() && remaining.ends_with(literal);
        }
        if literal.is_empty() {
            // Adjacent variables: the next one takes whatever follows.
            continue;
        }
        // Variable must consume at least one character.
        let Some(first) = remaining.chars().next().map(char::len_utf8) else {
            return false;
        };
        match remaining[first..].find(literal) {
            Some(pos) => remaining = &remaining[first + pos + literal.len()..],
            None => return false,
        }
    }
    true
}
