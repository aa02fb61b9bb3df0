//! Directory configuration

use crate::protocol::FeedbackKey;

use super::node::Partition;

/// Parameters of one phonebook search command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRequest<'a> {
    pub partition: Partition,
    /// Folder to list; `None` is the partition root
    pub folder_id: Option<&'a str>,
    /// Free-text query; `None` when browsing
    pub query: Option<&'a str>,
    pub limit: usize,
}

/// Builds the endpoint command for a search request
pub type SearchCommandFn = fn(&SearchRequest<'_>) -> String;

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('"', ""))
}

fn xapi_search_command(request: &SearchRequest<'_>) -> String {
    let mut command = format!(
        "xCommand Phonebook Search PhonebookType: {} Offset: 0 Limit: {}",
        request.partition, request.limit
    );
    if let Some(folder) = request.folder_id {
        command.push_str(" FolderId: ");
        command.push_str(&quoted(folder));
    }
    match request.query {
        Some(query) => {
            command.push_str(" SearchString: ");
            command.push_str(&quoted(query));
            command.push_str(" Recursive: True");
        }
        None => command.push_str(" Recursive: False"),
    }
    command
}

fn json_search_command(request: &SearchRequest<'_>) -> String {
    let mut command = format!(
        "zCommand Phonebook List PhonebookType: {} Offset: 0 Limit: {}",
        request.partition, request.limit
    );
    if let Some(folder) = request.folder_id {
        command.push_str(" FolderId: ");
        command.push_str(&quoted(folder));
    }
    if let Some(query) = request.query {
        command.push_str(" SearchString: ");
        command.push_str(&quoted(query));
    }
    command
}

/// Directory configuration options
#[derive(Clone)]
pub struct DirectoryConfig {
    /// Maximum results kept for an ad hoc search
    pub search_limit: usize,

    /// Maximum entries requested when listing a folder
    pub browse_limit: usize,

    /// Key under which search replies are routed
    pub result_key: FeedbackKey,

    /// Feedback key signalling that the directory changed
    pub invalidation_key: FeedbackKey,

    /// Command vocabulary
    pub search_command: SearchCommandFn,

    /// Capacity of the directory event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            search_limit: 50,
            browse_limit: 100,
            result_key: FeedbackKey::parse("commandresponse/phonebooksearchresult"),
            invalidation_key: FeedbackKey::parse("event/phonebook"),
            search_command: xapi_search_command,
            event_channel_capacity: 64,
        }
    }
}

impl std::fmt::Debug for DirectoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryConfig")
            .field("search_limit", &self.search_limit)
            .field("browse_limit", &self.browse_limit)
            .field("result_key", &self.result_key)
            .field("invalidation_key", &self.invalidation_key)
            .finish_non_exhaustive()
    }
}

impl DirectoryConfig {
    /// Settings for the tagged JSON family
    pub fn json() -> Self {
        Self::default()
            .result_key(FeedbackKey::parse("zCommand/PhonebookListResult"))
            .invalidation_key(FeedbackKey::parse("zEvent/PhonebookBasicInfoChange"))
            .search_command(json_search_command)
    }

    /// Set the search result bound
    pub fn search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit.max(1);
        self
    }

    /// Set the folder listing bound
    pub fn browse_limit(mut self, limit: usize) -> Self {
        self.browse_limit = limit.max(1);
        self
    }

    /// Set the reply routing key
    pub fn result_key(mut self, key: FeedbackKey) -> Self {
        self.result_key = key;
        self
    }

    /// Set the invalidation feedback key
    pub fn invalidation_key(mut self, key: FeedbackKey) -> Self {
        self.invalidation_key = key;
        self
    }

    /// Override the command vocabulary
    pub fn search_command(mut self, f: SearchCommandFn) -> Self {
        self.search_command = f;
        self
    }
}
