//! Lazily populated phonebook tree
//!
//! ```text
//!   Local/ ──┬── Sales/ ──── (populated on demand)
//!            ├── Engineering/
//!            └── contact
//!   Corporate/ ── (not yet populated)
//! ```
//!
//! Each folder is listed at most once per session: `populate_folder` marks
//! the folder before the search command goes out, so repeated calls are
//! no-ops until the directory is invalidated. Replies are matched to the
//! folder, or to the current ad hoc search, by correlation id. Replies for
//! ids nobody is waiting on are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;

use crate::engine::{ConnectionObserver, Engine};
use crate::error::Result;
use crate::protocol::{FeedbackKey, PendingCommand};
use crate::registry::{CallbackId, Feedback};

use super::config::{DirectoryConfig, SearchRequest};
use super::node::{DirectoryNode, Folder, FolderRef, Partition, SearchResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Directory change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    FolderPopulated { folder: FolderRef, entries: usize },
    SearchCompleted { query: String, entries: usize },
    /// Every cached folder was cleared
    Invalidated,
}

/// Results of the current ad hoc search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    pub partition: Partition,
    pub query: String,
    pub result: SearchResult,
}

#[derive(Debug)]
struct FolderEntry {
    folder: Folder,
    children: Vec<DirectoryNode>,
}

#[derive(Debug)]
struct SearchSession {
    correlation_id: String,
    partition: Partition,
    query: String,
    results: Option<SearchResult>,
}

#[derive(Debug, Default)]
struct TreeState {
    folders: HashMap<FolderRef, FolderEntry>,
    populated: HashSet<FolderRef>,
    /// Correlation id → folder being listed
    browsing: HashMap<String, FolderRef>,
    search: Option<SearchSession>,
}

impl TreeState {
    fn with_roots() -> Self {
        let mut state = Self::default();
        for partition in Partition::ALL {
            let root = FolderRef::root(partition);
            state.folders.insert(
                root.clone(),
                FolderEntry {
                    folder: Folder {
                        name: partition.to_string(),
                        folder: root,
                        parent: None,
                    },
                    children: Vec::new(),
                },
            );
        }
        state
    }
}

/// Searchable, incrementally populated phonebook
pub struct DirectoryTree {
    me: Weak<DirectoryTree>,
    engine: Arc<Engine>,
    config: DirectoryConfig,
    state: Mutex<TreeState>,
    events: broadcast::Sender<DirectoryEvent>,
    callbacks: Mutex<Vec<(FeedbackKey, CallbackId)>>,
}

impl DirectoryTree {
    /// Attach a directory to `engine`
    pub fn new(engine: &Arc<Engine>, config: DirectoryConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let tree = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            engine: Arc::clone(engine),
            config,
            state: Mutex::new(TreeState::with_roots()),
            events,
            callbacks: Mutex::new(Vec::new()),
        });

        let weak = tree.me.clone();
        let results = engine.listen(&tree.config.result_key, move |feedback| {
            if let Some(tree) = weak.upgrade() {
                tree.on_result(feedback);
            }
        });

        let weak = tree.me.clone();
        let invalidation = engine.register(&tree.config.invalidation_key, move |_| {
            if let Some(tree) = weak.upgrade() {
                tree.invalidate();
            }
        });

        lock(&tree.callbacks).extend([
            (tree.config.result_key.clone(), results),
            (tree.config.invalidation_key.clone(), invalidation),
        ]);
        engine.observe(&tree);
        tree
    }

    /// Receiver for directory events
    pub fn events(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    fn emit(&self, event: DirectoryEvent) {
        let _ = self.events.send(event);
    }

    /// Cached folder metadata
    pub fn folder(&self, folder: &FolderRef) -> Option<Folder> {
        lock(&self.state).folders.get(folder).map(|e| e.folder.clone())
    }

    /// Children of a populated folder
    ///
    /// `None` if the folder is unknown or has not been populated yet.
    pub fn children(&self, folder: &FolderRef) -> Option<Vec<DirectoryNode>> {
        let state = lock(&self.state);
        if !state.populated.contains(folder) || state.browsing.values().any(|f| f == folder) {
            return None;
        }
        state.folders.get(folder).map(|e| e.children.clone())
    }

    /// Whether a listing was requested for `folder` this session
    pub fn is_populated(&self, folder: &FolderRef) -> bool {
        lock(&self.state).populated.contains(folder)
    }

    /// Number of listings awaiting a reply
    pub fn in_flight(&self) -> usize {
        lock(&self.state).browsing.len()
    }

    /// Request the children of `folder`
    ///
    /// Returns `None` without sending anything if the folder was already
    /// requested this session or is not known.
    pub fn populate_folder(&self, folder: &FolderRef) -> Result<Option<PendingCommand>> {
        let mut state = lock(&self.state);
        if !state.folders.contains_key(folder) {
            tracing::debug!(folder = %folder, "Populate requested for unknown folder");
            return Ok(None);
        }
        if !state.populated.insert(folder.clone()) {
            return Ok(None);
        }

        let command = (self.config.search_command)(&SearchRequest {
            partition: folder.partition,
            folder_id: folder.id.as_deref(),
            query: None,
            limit: self.config.browse_limit,
        });

        // Sent under the lock so the reply cannot be handled before the
        // correlation id is recorded
        match self.engine.send_command(&command) {
            Ok(pending) => {
                tracing::debug!(folder = %folder, id = %pending.id, "Populating folder");
                state.browsing.insert(pending.id.clone(), folder.clone());
                Ok(Some(pending))
            }
            Err(e) => {
                state.populated.remove(folder);
                Err(e)
            }
        }
    }

    /// Start an ad hoc search, superseding any previous one
    pub fn search(&self, partition: Partition, query: &str) -> Result<PendingCommand> {
        let mut state = lock(&self.state);
        if let Some(previous) = state.search.take() {
            tracing::debug!(id = %previous.correlation_id, query = %previous.query, "Search superseded");
        }

        let command = (self.config.search_command)(&SearchRequest {
            partition,
            folder_id: None,
            query: Some(query),
            limit: self.config.search_limit,
        });

        let pending = self.engine.send_command(&command)?;
        tracing::debug!(id = %pending.id, query = %query, "Searching directory");
        state.search = Some(SearchSession {
            correlation_id: pending.id.clone(),
            partition,
            query: query.to_string(),
            results: None,
        });
        Ok(pending)
    }

    /// Results of the current search, once they arrived
    pub fn search_results(&self) -> Option<SearchResults> {
        let state = lock(&self.state);
        let session = state.search.as_ref()?;
        session.results.as_ref().map(|result| SearchResults {
            partition: session.partition,
            query: session.query.clone(),
            result: result.clone(),
        })
    }

    /// Drop the current search
    pub fn clear_search(&self) {
        lock(&self.state).search = None;
    }

    fn on_result(&self, feedback: &Feedback<'_>) {
        let Some(id) = feedback.correlation_id else {
            tracing::debug!("Directory reply without correlation id");
            return;
        };
        let failed = feedback.status.is_error()
            || feedback
                .payload
                .attr("status")
                .map(|s| s.eq_ignore_ascii_case("error"))
                .unwrap_or(false);

        let event = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;

            if let Some(folder) = state.browsing.remove(id) {
                if failed {
                    tracing::warn!(folder = %folder, "Folder listing failed");
                    state.populated.remove(&folder);
                    return;
                }
                let Some(mut result) = SearchResult::parse(feedback.payload, folder.partition) else {
                    tracing::warn!(folder = %folder, "Unsupported directory payload");
                    state.populated.remove(&folder);
                    return;
                };
                result.truncate(self.config.browse_limit);

                for sub in &result.folders {
                    state
                        .folders
                        .entry(sub.folder.clone())
                        .or_insert_with(|| FolderEntry {
                            folder: Folder {
                                parent: Some(folder.clone()),
                                ..sub.clone()
                            },
                            children: Vec::new(),
                        });
                }

                let entries = result.len();
                if let Some(entry) = state.folders.get_mut(&folder) {
                    entry.children = result.into_nodes();
                }
                DirectoryEvent::FolderPopulated { folder, entries }
            } else {
                let Some(session) = state
                    .search
                    .as_mut()
                    .filter(|s| s.correlation_id == id && s.results.is_none())
                else {
                    tracing::debug!(id = id, "Dropping stale directory reply");
                    return;
                };

                let mut result = if failed {
                    tracing::warn!(query = %session.query, "Directory search failed");
                    SearchResult::default()
                } else {
                    SearchResult::parse(feedback.payload, session.partition).unwrap_or_default()
                };
                result.sort();
                result.truncate(self.config.search_limit);

                let event = DirectoryEvent::SearchCompleted {
                    query: session.query.clone(),
                    entries: result.len(),
                };
                session.results = Some(result);
                event
            }
        };

        tracing::debug!(event = ?event, "Directory updated");
        self.emit(event);
    }

    /// Clear every cached folder and the current search
    ///
    /// Root folders survive with no children; the next browse re-fetches.
    pub fn invalidate(&self) {
        {
            let mut state = lock(&self.state);
            state.folders.retain(|folder, _| folder.is_root());
            for entry in state.folders.values_mut() {
                entry.children.clear();
            }
            state.populated.clear();
            state.browsing.clear();
            state.search = None;
        }
        tracing::info!("Directory invalidated");
        self.emit(DirectoryEvent::Invalidated);
    }

    /// Deregister the reply and invalidation callbacks
    pub fn detach(&self) {
        let callbacks: Vec<(FeedbackKey, CallbackId)> = lock(&self.callbacks).drain(..).collect();
        for (key, id) in callbacks {
            self.engine.deregister(&key, id);
        }
    }
}

impl ConnectionObserver for DirectoryTree {
    fn on_connection_changed(&self, online: bool) {
        if online {
            return;
        }
        let mut state = lock(&self.state);
        let in_flight: Vec<FolderRef> = state.browsing.drain().map(|(_, f)| f).collect();
        for folder in &in_flight {
            state.populated.remove(folder);
        }
        if state.search.as_ref().map(|s| s.results.is_none()).unwrap_or(false) {
            state.search = None;
        }
        if !in_flight.is_empty() {
            tracing::debug!(count = in_flight.len(), "Dropped in-flight directory requests");
        }
    }
}

impl Drop for DirectoryTree {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::protocol::{JsonProtocol, XapiProtocol};
    use crate::testing::RecordingTransport;

    fn setup() -> (Arc<Engine>, RecordingTransport, Arc<DirectoryTree>) {
        let engine = Engine::new(EngineConfig::default(), XapiProtocol::new());
        let transport = RecordingTransport::new();
        engine.attach_transport(Arc::new(transport.clone()));
        engine.set_online(true);

        let tree = DirectoryTree::new(&engine, DirectoryConfig::default());
        assert_eq!(
            transport.take_commands(),
            vec!["xFeedback register /event/phonebook"]
        );
        (engine, transport, tree)
    }

    fn reply(id: &str, body: &str) -> Vec<u8> {
        format!(
            "<XmlDoc resultId=\"{}\"><CommandResponse><PhonebookSearchResult status=\"OK\">{}</PhonebookSearchResult></CommandResponse></XmlDoc>",
            id, body
        )
        .into_bytes()
    }

    const ROOT_LISTING: &str = "<Folder item=\"1\"><FolderId>f_1</FolderId><Name>Sales</Name></Folder>\
        <Contact item=\"1\"><Name>Ann Lee</Name><FirstName>Ann</FirstName><LastName>Lee</LastName><ContactId>c_1</ContactId></Contact>";

    #[test]
    fn test_populate_is_idempotent() {
        let (engine, transport, tree) = setup();
        let root = FolderRef::root(Partition::Local);

        let pending = tree.populate_folder(&root).unwrap().unwrap();
        assert!(tree.populate_folder(&root).unwrap().is_none());
        assert_eq!(
            transport.take_commands(),
            vec!["xCommand Phonebook Search PhonebookType: Local Offset: 0 Limit: 100 Recursive: False"]
        );
        assert!(tree.children(&root).is_none());

        let mut events = tree.events();
        engine.on_data(&reply(&pending.id, ROOT_LISTING));

        let children = tree.children(&root).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name(), "Sales");
        assert_eq!(
            events.try_recv().unwrap(),
            DirectoryEvent::FolderPopulated {
                folder: root.clone(),
                entries: 2
            }
        );

        // Duplicate reply is not merged twice
        engine.on_data(&reply(&pending.id, ROOT_LISTING));
        assert_eq!(tree.children(&root).unwrap().len(), 2);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_subfolder_cached_and_browsable() {
        let (engine, transport, tree) = setup();
        let root = FolderRef::root(Partition::Local);
        let pending = tree.populate_folder(&root).unwrap().unwrap();
        engine.on_data(&reply(&pending.id, ROOT_LISTING));
        transport.take();

        let sales = FolderRef::new(Partition::Local, "f_1");
        let folder = tree.folder(&sales).unwrap();
        assert_eq!(folder.name, "Sales");
        assert_eq!(folder.parent, Some(root));

        tree.populate_folder(&sales).unwrap().unwrap();
        assert_eq!(
            transport.take_commands(),
            vec!["xCommand Phonebook Search PhonebookType: Local Offset: 0 Limit: 100 FolderId: \"f_1\" Recursive: False"]
        );

        // Unknown folders are never requested
        let unknown = FolderRef::new(Partition::Local, "f_99");
        assert!(tree.populate_folder(&unknown).unwrap().is_none());
        assert!(transport.take().is_empty());
    }

    #[test]
    fn test_search_supersedes_previous_query() {
        let (engine, transport, tree) = setup();

        let q1 = tree.search(Partition::Corporate, "ann").unwrap();
        let q2 = tree.search(Partition::Corporate, "bob").unwrap();
        assert_eq!(transport.take().len(), 2);

        // Late results for the first query are dropped
        engine.on_data(&reply(&q1.id, ROOT_LISTING));
        assert!(tree.search_results().is_none());

        engine.on_data(&reply(
            &q2.id,
            "<Contact item=\"1\"><FirstName>Bob</FirstName><LastName>Young</LastName><ContactId>c_2</ContactId></Contact>\
             <Contact item=\"2\"><FirstName>Bob</FirstName><LastName>Adams</LastName><ContactId>c_3</ContactId></Contact>\
             <Folder item=\"1\"><FolderId>f_8</FolderId><Name>bobs</Name></Folder>\
             <Folder item=\"2\"><FolderId>f_7</FolderId><Name>Board</Name></Folder>",
        ));

        let results = tree.search_results().unwrap();
        assert_eq!(results.query, "bob");
        assert_eq!(results.partition, Partition::Corporate);
        let folders: Vec<&str> = results.result.folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(folders, vec!["Board", "bobs"]);
        let contacts: Vec<&str> = results.result.contacts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(contacts, vec!["c_3", "c_2"]);
        assert!(results.result.contacts.iter().all(|c| c.id != "c_1"));
    }

    #[test]
    fn test_search_limit_bounds_results() {
        let engine = Engine::new(EngineConfig::default(), XapiProtocol::new());
        let transport = RecordingTransport::new();
        engine.attach_transport(Arc::new(transport.clone()));
        engine.set_online(true);
        let tree = DirectoryTree::new(&engine, DirectoryConfig::default().search_limit(1));

        let q = tree.search(Partition::Local, "a").unwrap();
        engine.on_data(&reply(&q.id, ROOT_LISTING));
        assert_eq!(tree.search_results().unwrap().result.len(), 1);
    }

    #[test]
    fn test_invalidation_clears_everything() {
        let (engine, transport, tree) = setup();
        let root = FolderRef::root(Partition::Local);
        let pending = tree.populate_folder(&root).unwrap().unwrap();
        engine.on_data(&reply(&pending.id, ROOT_LISTING));
        let q = tree.search(Partition::Local, "ann").unwrap();
        engine.on_data(&reply(&q.id, ROOT_LISTING));
        transport.take();

        let mut events = tree.events();
        engine.on_data(b"<XmlDoc><Event><Phonebook><Updated/></Phonebook></Event></XmlDoc>");
        assert_eq!(events.try_recv().unwrap(), DirectoryEvent::Invalidated);

        assert!(!tree.is_populated(&root));
        assert!(tree.folder(&FolderRef::new(Partition::Local, "f_1")).is_none());
        assert!(tree.folder(&root).is_some());
        assert!(tree.search_results().is_none());

        assert!(tree.populate_folder(&root).unwrap().is_some());
        assert_eq!(transport.take().len(), 1);
    }

    #[test]
    fn test_failed_listing_can_retry() {
        let (engine, _transport, tree) = setup();
        let root = FolderRef::root(Partition::Corporate);
        let pending = tree.populate_folder(&root).unwrap().unwrap();

        let doc = format!(
            "<XmlDoc resultId=\"{}\"><CommandResponse><PhonebookSearchResult status=\"Error\"><Reason>No directory</Reason></PhonebookSearchResult></CommandResponse></XmlDoc>",
            pending.id
        );
        engine.on_data(doc.as_bytes());

        assert!(!tree.is_populated(&root));
        assert!(tree.populate_folder(&root).unwrap().is_some());
    }

    #[test]
    fn test_connection_loss_drops_in_flight() {
        let (engine, transport, tree) = setup();
        let root = FolderRef::root(Partition::Local);
        let pending = tree.populate_folder(&root).unwrap().unwrap();

        engine.set_online(false);
        assert_eq!(tree.in_flight(), 0);
        assert!(tree.populate_folder(&root).is_err());

        engine.set_online(true);
        transport.take();
        engine.on_data(&reply(&pending.id, ROOT_LISTING));
        assert!(tree.children(&root).is_none());

        assert!(tree.populate_folder(&root).unwrap().is_some());
    }

    #[test]
    fn test_drop_detaches() {
        let (engine, transport, tree) = setup();
        drop(tree);
        assert_eq!(
            transport.take_commands(),
            vec!["xFeedback deregister /event/phonebook"]
        );
        assert!(engine.registry().is_empty());
    }

    fn json_setup() -> (Arc<Engine>, RecordingTransport, Arc<DirectoryTree>) {
        let engine = Engine::new(EngineConfig::default(), JsonProtocol::new());
        let transport = RecordingTransport::new();
        engine.attach_transport(Arc::new(transport.clone()));
        engine.set_online(true);

        let tree = DirectoryTree::new(&engine, DirectoryConfig::json());
        let written = transport.take();
        assert_eq!(written.len(), 1);
        assert!(written[0].contains("zFeedback Register Path: /zevent/phonebookbasicinfochange"));
        (engine, transport, tree)
    }

    fn json_reply(id: &str, state: &str, listing: serde_json::Value) -> Vec<u8> {
        let frame = serde_json::json!({
            "PhonebookListResult": listing,
            "Status": {"message": "", "state": state},
            "Sync": true,
            "requestId": id,
            "topKey": "PhonebookListResult",
            "type": "zCommand"
        });
        format!("{}\n", frame).into_bytes()
    }

    #[test]
    fn test_json_family_listing() {
        let (engine, transport, tree) = json_setup();
        let root = FolderRef::root(Partition::Local);

        let pending = tree.populate_folder(&root).unwrap().unwrap();
        let written = transport.take();
        assert_eq!(written.len(), 1);
        assert!(written[0].contains("zCommand Phonebook List PhonebookType: Local Offset: 0 Limit: 100"));

        engine.on_data(&json_reply(
            &pending.id,
            "OK",
            serde_json::json!({
                "Folders": [{"FolderId": "f_1", "Name": "Sales"}],
                "Contacts": [{"jid": "c_1", "screenName": "Ann Lee", "phoneNumber": "1234"}]
            }),
        ));

        let children = tree.children(&root).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name(), "Sales");
        match &children[1] {
            DirectoryNode::Contact(contact) => {
                assert_eq!(contact.id, "c_1");
                assert_eq!(contact.methods[0].number, "1234");
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert!(tree.folder(&FolderRef::new(Partition::Local, "f_1")).is_some());

        let sales = FolderRef::new(Partition::Local, "f_1");
        tree.populate_folder(&sales).unwrap().unwrap();
        assert!(transport.take()[0].contains("FolderId: \\\"f_1\\\""));
    }

    #[test]
    fn test_json_error_reply_allows_retry() {
        let (engine, _transport, tree) = json_setup();
        let root = FolderRef::root(Partition::Corporate);
        let pending = tree.populate_folder(&root).unwrap().unwrap();

        engine.on_data(&json_reply(&pending.id, "Error", serde_json::json!({})));

        assert!(!tree.is_populated(&root));
        assert!(tree.populate_folder(&root).unwrap().is_some());
    }
}
