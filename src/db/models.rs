//! Row types handed across the persistence boundary.

use serde::Serialize;

/// Author snapshot attached to an accepted message.
/// Profile fields are read at publish time and never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Author {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Author {
    /// Snapshot carrying only the id, used when the profile lookup fails.
    pub fn bare(id: i64) -> Self {
        Self {
            id,
            email: None,
            display_name: None,
            avatar_url: None,
        }
    }
}

/// A file reference attached to a chat message, stored one row per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub filesize: i64,
}

/// Identifiers the store assigned to an inserted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    /// Epoch milliseconds
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_author_serializes_only_id() {
        let value = serde_json::to_value(Author::bare(7)).unwrap();
        assert_eq!(value, json!({"id": 7}));
    }

    #[test]
    fn test_attachment_serializes_stored_columns() {
        let attachment = Attachment {
            url: "https://cdn/a.png".to_string(),
            filename: "a.png".to_string(),
            filesize: 12,
        };
        assert_eq!(
            serde_json::to_value(&attachment).unwrap(),
            json!({"url": "https://cdn/a.png", "filename": "a.png", "filesize": 12})
        );
    }
}
