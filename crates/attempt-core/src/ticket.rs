//! Splitting agent-written ticket markdown into title and description.

use serde::{Deserialize, Serialize};

/// A card title and description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketParts {
    pub title: String,
    pub description: String,
}

/// Split markdown of the form `# Title\nBody` into its parts.
///
/// Leading blank lines are skipped. When the first line is not a `# ` heading,
/// or the heading is empty, the defaults are returned unchanged.
pub fn split_ticket(markdown: &str, default_title: &str, default_description: &str) -> TicketParts {
    let fallback = || TicketParts {
        title: default_title.to_string(),
        description: default_description.to_string(),
    };

    let body = markdown.trim_start_matches(['\n', '\r']);
    let (first_line, rest) = match body.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (body, ""),
    };

    let Some(title) = first_line.trim_end().strip_prefix("# ") else {
        return fallback();
    };
    let title = title.trim();
    if title.is_empty() {
        return fallback();
    }

    TicketParts {
        title: title.to_string(),
        description: rest.trim().to_string(),
    }
}
