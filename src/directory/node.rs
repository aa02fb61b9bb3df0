//! Directory entries and search result parsing

use std::cmp::Ordering;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::protocol::{Payload, XmlNode};

/// Phonebook partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    Local,
    Corporate,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::Local, Partition::Corporate];
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Local => f.write_str("Local"),
            Partition::Corporate => f.write_str("Corporate"),
        }
    }
}

/// Identity of a folder: partition plus endpoint folder id (`None` = root)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FolderRef {
    pub partition: Partition,
    pub id: Option<String>,
}

impl FolderRef {
    /// Root folder of a partition
    pub fn root(partition: Partition) -> Self {
        Self { partition, id: None }
    }

    pub fn new(partition: Partition, id: impl Into<String>) -> Self {
        Self {
            partition,
            id: Some(id.into()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Display for FolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.partition, id),
            None => write!(f, "{}/", self.partition),
        }
    }
}

/// A folder entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub folder: FolderRef,
    pub name: String,
    pub parent: Option<FolderRef>,
}

/// One way of reaching a contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactMethod {
    pub number: String,
    pub protocol: Option<String>,
}

/// A leaf contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub folder: Option<FolderRef>,
    pub methods: Vec<ContactMethod>,
}

impl Contact {
    fn sort_key(&self) -> (String, String) {
        let last = self.last_name.as_deref().unwrap_or(&self.name).to_lowercase();
        let first = self.first_name.as_deref().unwrap_or_default().to_lowercase();
        (last, first)
    }

    /// Surname, then first name, case-insensitive
    pub fn cmp_by_name(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Child of a folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryNode {
    Folder(Folder),
    Contact(Contact),
}

impl DirectoryNode {
    pub fn name(&self) -> &str {
        match self {
            DirectoryNode::Folder(f) => &f.name,
            DirectoryNode::Contact(c) => &c.name,
        }
    }
}

/// Parsed phonebook search reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    pub folders: Vec<Folder>,
    pub contacts: Vec<Contact>,
    /// Total matches reported by the endpoint, if any
    pub total_rows: Option<usize>,
}

impl SearchResult {
    /// Parse a search reply for `partition`
    ///
    /// Entries without an id are skipped. `None` if a JSON reply does not
    /// have the listing shape.
    pub fn parse(payload: &Payload, partition: Partition) -> Option<Self> {
        match payload {
            Payload::Xml(node) => Some(Self::from_xml(node, partition)),
            Payload::Json(value) => Self::from_json(value, partition),
        }
    }

    fn from_xml(node: &XmlNode, partition: Partition) -> Self {
        let folders = node
            .children_named("Folder")
            .filter_map(|f| parse_folder(f, partition))
            .collect();
        let contacts = node
            .children_named("Contact")
            .filter_map(|c| parse_contact(c, partition))
            .collect();
        let total_rows = node
            .child("ResultInfo")
            .and_then(|info| info.child_text("TotalRows"))
            .and_then(|t| t.trim().parse().ok());

        Self {
            folders,
            contacts,
            total_rows,
        }
    }

    fn from_json(value: &Value, partition: Partition) -> Option<Self> {
        let listing = match JsonListing::deserialize(value) {
            Ok(listing) => listing,
            Err(e) => {
                tracing::debug!(error = %e, "Phonebook listing has an unexpected shape");
                return None;
            }
        };

        let folders = listing
            .folders
            .into_iter()
            .filter_map(|f| {
                let id = clean(f.folder_id)?;
                Some(folder_entry(partition, id, clean(f.name), clean(f.parent_folder_id)))
            })
            .collect();
        let contacts = listing
            .contacts
            .into_iter()
            .filter_map(|c| {
                let id = clean(c.contact_id)?;
                let mut methods: Vec<ContactMethod> = c
                    .methods
                    .into_iter()
                    .filter_map(|m| {
                        Some(ContactMethod {
                            number: clean(m.number)?,
                            protocol: clean(m.protocol),
                        })
                    })
                    .collect();
                if let Some(number) = clean(c.number) {
                    methods.push(ContactMethod {
                        number,
                        protocol: None,
                    });
                }
                Some(contact_entry(
                    partition,
                    id,
                    clean(c.name),
                    clean(c.first_name),
                    clean(c.last_name),
                    clean(c.folder_id),
                    methods,
                ))
            })
            .collect();

        Some(Self {
            folders,
            contacts,
            total_rows: listing.total_rows,
        })
    }

    /// Folders by name, contacts by surname then first name
    pub fn sort(&mut self) {
        self.folders
            .sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        self.contacts.sort_by(Contact::cmp_by_name);
    }

    /// Keep at most `limit` entries, folders first
    pub fn truncate(&mut self, limit: usize) {
        self.folders.truncate(limit);
        let remaining = limit.saturating_sub(self.folders.len());
        self.contacts.truncate(remaining);
    }

    pub fn len(&self) -> usize {
        self.folders.len() + self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries as folder children
    pub fn into_nodes(self) -> Vec<DirectoryNode> {
        self.folders
            .into_iter()
            .map(DirectoryNode::Folder)
            .chain(self.contacts.into_iter().map(DirectoryNode::Contact))
            .collect()
    }
}

/// Tagged-JSON listing reply
///
/// ```text
/// { "Folders":  [{ "FolderId": "f_1", "Name": "Sales", "ParentFolderId": "f_0" }],
///   "Contacts": [{ "ContactId": "c_1", "Name": "Ann Lee", "FirstName": "Ann",
///                  "LastName": "Lee", "FolderId": "f_1",
///                  "Methods": [{ "Number": "1234", "Protocol": "SIP" }] }],
///   "TotalRows": 2 }
/// ```
///
/// Contacts may instead use the endpoint's own `jid` / `screenName` /
/// `firstName` / `lastName` / `phoneNumber` fields.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct JsonListing {
    folders: Vec<JsonFolder>,
    contacts: Vec<JsonContact>,
    total_rows: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonFolder {
    folder_id: Option<String>,
    name: Option<String>,
    parent_folder_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonContact {
    #[serde(alias = "jid")]
    contact_id: Option<String>,
    #[serde(alias = "screenName")]
    name: Option<String>,
    #[serde(alias = "firstName")]
    first_name: Option<String>,
    #[serde(alias = "lastName")]
    last_name: Option<String>,
    folder_id: Option<String>,
    #[serde(default)]
    methods: Vec<JsonMethod>,
    #[serde(alias = "phoneNumber")]
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonMethod {
    number: Option<String>,
    protocol: Option<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn text(node: &XmlNode, name: &str) -> Option<String> {
    clean(node.child_text(name).map(str::to_string))
}

fn folder_entry(partition: Partition, id: String, name: Option<String>, parent: Option<String>) -> Folder {
    Folder {
        name: name.unwrap_or_else(|| id.clone()),
        parent: Some(
            parent
                .map(|p| FolderRef::new(partition, p))
                .unwrap_or_else(|| FolderRef::root(partition)),
        ),
        folder: FolderRef::new(partition, id),
    }
}

fn contact_entry(
    partition: Partition,
    id: String,
    name: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    folder: Option<String>,
    methods: Vec<ContactMethod>,
) -> Contact {
    let name = name.unwrap_or_else(|| {
        [first_name.as_deref(), last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    });
    Contact {
        id,
        name,
        first_name,
        last_name,
        folder: folder.map(|f| FolderRef::new(partition, f)),
        methods,
    }
}

fn parse_folder(node: &XmlNode, partition: Partition) -> Option<Folder> {
    let id = text(node, "FolderId").or_else(|| text(node, "LocalId"))?;
    Some(folder_entry(
        partition,
        id,
        text(node, "Name"),
        text(node, "ParentFolderId"),
    ))
}

fn parse_contact(node: &XmlNode, partition: Partition) -> Option<Contact> {
    let id = text(node, "ContactId").or_else(|| text(node, "LocalId"))?;
    let methods = node
        .children_named("ContactMethod")
        .filter_map(|m| {
            Some(ContactMethod {
                number: text(m, "Number")?,
                protocol: text(m, "Protocol"),
            })
        })
        .collect();

    Some(contact_entry(
        partition,
        id,
        text(node, "Name"),
        text(node, "FirstName"),
        text(node, "LastName"),
        text(node, "FolderId"),
        methods,
    ))
}
