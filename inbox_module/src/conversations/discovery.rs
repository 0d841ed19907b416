use crate::platform::PlatformError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryConversation {
    pub external_id: String,
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryPage {
    pub conversations: Vec<DirectoryConversation>,
    pub next_cursor: Option<String>,
}

/// Paginated listing of the configured account's conversations.
/// Implementations are expected to rate-limit their own calls.
pub trait ConversationDirectory: Send + Sync {
    fn list_conversations(&self, cursor: Option<&str>) -> Result<DirectoryPage, PlatformError>;
}

/// Walks up to `max_pages` of the listing looking for a thread whose
/// participants include `counterparty_id`.
pub(crate) fn find_by_participant(
    directory: &dyn ConversationDirectory,
    counterparty_id: &str,
    max_pages: usize,
) -> Result<Option<String>, PlatformError> {
    let mut cursor: Option<String> = None;
    for _ in 0..max_pages.max(1) {
        let page = directory.list_conversations(cursor.as_deref())?;
        let hit = page
            .conversations
            .into_iter()
            .find(|conversation| conversation.participant_ids.iter().any(|id| id == counterparty_id));
        if let Some(conversation) = hit {
            return Ok(Some(conversation.external_id));
        }
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct PagedDirectory {
        pages: Vec<DirectoryPage>,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl ConversationDirectory for PagedDirectory {
        fn list_conversations(&self, cursor: Option<&str>) -> Result<DirectoryPage, PlatformError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(cursor.map(str::to_string));
            Ok(self.pages[calls.len() - 1].clone())
        }
    }

    fn conv(id: &str, participants: &[&str]) -> DirectoryConversation {
        DirectoryConversation {
            external_id: id.to_string(),
            participant_ids: participants.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn follows_cursors_until_participant_matches() {
        let directory = PagedDirectory {
            pages: vec![
                DirectoryPage {
                    conversations: vec![conv("t1", &["acct", "u1"])],
                    next_cursor: Some("c2".into()),
                },
                DirectoryPage {
                    conversations: vec![conv("t2", &["acct", "u2"])],
                    next_cursor: None,
                },
            ],
            calls: Mutex::new(Vec::new()),
        };
        let found = find_by_participant(&directory, "u2", 5).unwrap();
        assert_eq!(found.as_deref(), Some("t2"));
        assert_eq!(
            *directory.calls.lock().unwrap(),
            vec![None, Some("c2".to_string())]
        );
    }

    #[test]
    fn stops_at_page_budget() {
        let directory = PagedDirectory {
            pages: vec![
                DirectoryPage {
                    conversations: vec![conv("t1", &["acct", "u1"])],
                    next_cursor: Some("c2".into()),
                },
                DirectoryPage {
                    conversations: vec![conv("t2", &["acct", "u2"])],
                    next_cursor: None,
                },
            ],
            calls: Mutex::new(Vec::new()),
        };
        assert_eq!(find_by_participant(&directory, "u2", 1).unwrap(), None);
        assert_eq!(directory.calls.lock().unwrap().len(), 1);
    }
}
