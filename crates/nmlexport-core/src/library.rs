//! Traktor catalogue (NML) model.
//!
//! The catalogue is kept as a generic, ordered element tree so that every
//! attribute of an entry survives an export untouched. Typed views
//! ([`TrackEntry`], [`Location`], [`PlaylistNode`]) sit on top of the tree and
//! expose only what the export pipeline needs:
//!
//! - the flat `COLLECTION` of track entries
//! - the `PLAYLISTS` folder/playlist hierarchy
//! - factories for fresh documents and playlist structures
//!
//! # Example
//!
//! ```rust,ignore
//! use nmlexport_core::library::Library;
//!
//! let library = Library::open("collection.nml".as_ref())?;
//! for track in library.tracks() {
//!     println!("{:?}", track.source_path());
//! }
//! ```

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, FileSystemError, LibraryError, Result};

/// Separator Traktor uses between path components in `DIR` and `KEY` values.
pub const NML_PATH_SEPARATOR: &str = "/:";

/// NML format version written into fresh documents.
pub const NML_VERSION: &str = "19";

const COLLECTION: &str = "COLLECTION";
const PLAYLISTS: &str = "PLAYLISTS";
const NODE: &str = "NODE";
const SUBNODES: &str = "SUBNODES";
const PLAYLIST: &str = "PLAYLIST";
const ENTRY: &str = "ENTRY";
const PRIMARYKEY: &str = "PRIMARYKEY";
const LOCATION: &str = "LOCATION";
const MODIFICATION_INFO: &str = "MODIFICATION_INFO";
const ROOT_NODE_NAME: &str = "$ROOT";

// =============================================================================
// Element tree
// =============================================================================

/// A single XML element with ordered attributes and children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: Option<String>,
}

impl Element {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    /// Builder-style child append.
    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// Element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, keeping its position if it already exists.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.attributes.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.attributes.push((key, value));
        }
    }

    /// Child elements in document order.
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child with the given name, mutably.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut Self> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Append a child and return it.
    pub fn push_child(&mut self, child: Self) -> &mut Self {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// First child with the given name, created with `make` if absent.
    pub fn child_or_insert_with(&mut self, name: &str, make: impl FnOnce() -> Self) -> &mut Self {
        let index = if let Some(index) = self.children.iter().position(|c| c.name == name) {
            index
        } else {
            self.children.push(make());
            self.children.len() - 1
        };
        &mut self.children[index]
    }
}

// =============================================================================
// Track entries
// =============================================================================

/// The `LOCATION` record of a track entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Directory in NML notation (`/:Users/:me/:Music/:`).
    pub dir: String,
    /// File name as stored in the catalogue.
    pub file: String,
    /// Volume name.
    pub volume: String,
    /// Volume identifier.
    pub volume_id: String,
}

impl Location {
    /// Read the location of a track entry element.
    pub fn of(entry: &Element) -> Option<Self> {
        let location = entry.child(LOCATION)?;
        Some(Self {
            dir: location.attribute("DIR").unwrap_or_default().to_string(),
            file: location.attribute("FILE")?.to_string(),
            volume: location.attribute("VOLUME").unwrap_or_default().to_string(),
            volume_id: location.attribute("VOLUMEID").unwrap_or_default().to_string(),
        })
    }

    /// Absolute path of the audio file on the machine holding the catalogue.
    pub fn source_path(&self) -> PathBuf {
        nml_dir_to_path(&self.dir).join(&self.file)
    }

    /// Fully-qualified key used by playlist member records.
    pub fn primary_key(&self) -> String {
        format!("{}{}{}", self.volume, self.dir, self.file)
    }
}

/// Read-only view of one `COLLECTION/ENTRY` element.
#[derive(Debug, Clone, Copy)]
pub struct TrackEntry<'a> {
    element: &'a Element,
}

impl<'a> TrackEntry<'a> {
    /// Wrap a collection entry element.
    pub const fn new(element: &'a Element) -> Self {
        Self { element }
    }

    /// The underlying catalogue record.
    pub const fn element(&self) -> &'a Element {
        self.element
    }

    /// Location record, if the entry has one with a file name.
    pub fn location(&self) -> Option<Location> {
        Location::of(self.element)
    }

    /// Raw file name as stored in the catalogue.
    pub fn file_name(&self) -> Option<&'a str> {
        self.element.child(LOCATION)?.attribute("FILE")
    }

    /// Canonical (NFD) file name used as the entry's identity within a run.
    pub fn normalized_file_name(&self) -> Option<String> {
        self.file_name().map(normalize_file_name)
    }

    /// Absolute source path of the audio file.
    pub fn source_path(&self) -> Option<PathBuf> {
        self.location().map(|l| l.source_path())
    }

    /// Fully-qualified key of the entry.
    pub fn primary_key(&self) -> Option<String> {
        self.location().map(|l| l.primary_key())
    }

    /// Whether this entry is a recording imported by the software itself.
    ///
    /// Recordings are `.wav` files whose modification info names the importer
    /// as author.
    pub fn is_recording_import(&self) -> bool {
        let imported = self
            .element
            .child(MODIFICATION_INFO)
            .and_then(|m| m.attribute("AUTHOR_TYPE"))
            == Some("importer");
        imported && self.file_name().is_some_and(|f| f.ends_with(".wav"))
    }
}

/// Point an entry at `<volume>/:<music_dir>/:<file>`.
///
/// Returns `false` when the entry has no `LOCATION` element.
pub fn relocate_entry(entry: &mut Element, music_dir: &str, volume: &str) -> bool {
    let Some(location) = entry.child_mut(LOCATION) else {
        return false;
    };
    location.set_attribute(
        "DIR",
        format!("{NML_PATH_SEPARATOR}{music_dir}{NML_PATH_SEPARATOR}"),
    );
    location.set_attribute("VOLUME", volume);
    location.set_attribute("VOLUMEID", volume);
    true
}

/// Unicode-canonical (NFD) form of a file name.
pub fn normalize_file_name(name: &str) -> String {
    name.nfd().collect()
}

/// Trailing path component of a fully-qualified key.
pub fn file_name_from_key(key: &str) -> &str {
    key.rsplit(NML_PATH_SEPARATOR).next().unwrap_or(key)
}

/// Convert an NML directory (`/:Users/:me/:`) to a filesystem path.
pub fn nml_dir_to_path(dir: &str) -> PathBuf {
    PathBuf::from(dir.replace(NML_PATH_SEPARATOR, "/"))
}

/// Convert a filesystem directory to NML notation.
pub fn path_to_nml_dir(path: &Path) -> String {
    let path = path.to_string_lossy();
    let trimmed = path.trim_end_matches('/');
    format!(
        "{}{NML_PATH_SEPARATOR}",
        trimmed.replace('/', NML_PATH_SEPARATOR)
    )
}

// =============================================================================
// Playlist hierarchy
// =============================================================================

/// Borrowed view of a node in the `PLAYLISTS` tree.
#[derive(Debug, Clone, Copy)]
pub enum PlaylistNode<'a> {
    /// Folder holding nested nodes.
    Folder {
        /// Display name.
        name: &'a str,
        /// The `NODE` element.
        element: &'a Element,
    },
    /// Playlist holding ordered member references.
    Playlist {
        /// Display name.
        name: &'a str,
        /// The `NODE` element.
        element: &'a Element,
    },
    /// Any other node type (smartlists and the like).
    Other {
        /// Value of the `TYPE` attribute.
        kind: &'a str,
        /// Display name.
        name: &'a str,
    },
}

impl<'a> PlaylistNode<'a> {
    /// Classify a `NODE` element.
    pub fn from_element(element: &'a Element) -> Self {
        let name = element.attribute("NAME").unwrap_or_default();
        match element.attribute("TYPE").unwrap_or_default() {
            "FOLDER" => Self::Folder { name, element },
            "PLAYLIST" => Self::Playlist { name, element },
            kind => Self::Other { kind, name },
        }
    }

    /// Display name of the node.
    pub const fn name(&self) -> &'a str {
        match self {
            Self::Folder { name, .. } | Self::Playlist { name, .. } | Self::Other { name, .. } => {
                *name
            }
        }
    }

    /// Child nodes of a folder, in order. Empty for any other node.
    pub fn children(&self) -> Vec<Self> {
        match self {
            Self::Folder { element, .. } => element
                .child(SUBNODES)
                .map(|s| s.children_named(NODE).map(Self::from_element).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Member keys of a playlist, in order. Empty for any other node.
    pub fn member_keys(&self) -> Vec<&'a str> {
        match self {
            Self::Playlist { element, .. } => element
                .child(PLAYLIST)
                .map(|p| {
                    p.children_named(ENTRY)
                        .filter_map(|e| e.child(PRIMARYKEY)?.attribute("KEY"))
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// Library document
// =============================================================================

/// A whole catalogue document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    root: Element,
}

impl Library {
    /// Read and parse a catalogue file.
    pub fn open(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        })?;
        let root = parse_element_tree(&content).map_err(|reason| LibraryError::Parse {
            path: Some(path.to_path_buf()),
            reason,
        })?;
        let library = Self::from_root(root)?;
        debug!(
            "Loaded catalogue {} with {} entries",
            path.display(),
            library.entries().len()
        );
        Ok(library)
    }

    /// Parse a catalogue from a string.
    pub fn parse(xml: &str) -> Result<Self> {
        let root =
            parse_element_tree(xml).map_err(|reason| LibraryError::Parse { path: None, reason })?;
        Self::from_root(root)
    }

    fn from_root(root: Element) -> Result<Self> {
        if root.child(COLLECTION).is_none() {
            return Err(LibraryError::MissingElement {
                element: COLLECTION,
            }
            .into());
        }
        Ok(Self { root })
    }

    /// A fresh, empty document of the same schema.
    pub fn new_document() -> Self {
        let root = Element::new("NML")
            .with_attribute("VERSION", NML_VERSION)
            .with_child(
                Element::new("HEAD")
                    .with_attribute("COMPANY", "www.native-instruments.com")
                    .with_attribute("PROGRAM", "Traktor"),
            )
            .with_child(Element::new("MUSICFOLDERS"))
            .with_child(Element::new(COLLECTION).with_attribute("ENTRIES", "0"))
            .with_child(Element::new("SETS").with_attribute("ENTRIES", "0"))
            .with_child(Element::new(PLAYLISTS).with_child(root_folder_node()));
        Self { root }
    }

    /// Document root element.
    pub const fn root(&self) -> &Element {
        &self.root
    }

    /// Collection entries in catalogue order.
    pub fn entries(&self) -> &[Element] {
        match self.root.child(COLLECTION) {
            Some(collection) => collection.children(),
            None => &[],
        }
    }

    /// Collection entries, mutably.
    pub fn entries_mut(&mut self) -> &mut [Element] {
        match self.root.child_mut(COLLECTION) {
            Some(collection) => &mut collection.children,
            None => &mut [],
        }
    }

    /// Typed views over the collection entries.
    pub fn tracks(&self) -> impl Iterator<Item = TrackEntry<'_>> {
        self.entries().iter().map(TrackEntry::new)
    }

    /// Root folder of the playlist hierarchy.
    pub fn playlist_root(&self) -> Option<PlaylistNode<'_>> {
        self.root
            .child(PLAYLISTS)?
            .child(NODE)
            .map(PlaylistNode::from_element)
    }

    /// Append a full entry record to the collection and bump its `ENTRIES` count.
    pub fn append_collection_entry(&mut self, entry: Element) {
        let collection = self
            .root
            .child_or_insert_with(COLLECTION, || Element::new(COLLECTION));
        collection.children.push(entry);
        let count = collection.children.len();
        collection.set_attribute("ENTRIES", count.to_string());
    }

    /// Create an empty playlist node under the root folder, ready to receive
    /// `entry_count` members. Returns the `PLAYLIST` element.
    pub fn create_playlist_structure(&mut self, name: &str, entry_count: usize) -> &mut Element {
        let subnodes = self
            .root
            .child_or_insert_with(PLAYLISTS, || Element::new(PLAYLISTS))
            .child_or_insert_with(NODE, root_folder_node)
            .child_or_insert_with(SUBNODES, || Element::new(SUBNODES));
        let count = subnodes.children.len() + 1;
        subnodes.set_attribute("COUNT", count.to_string());

        let node = subnodes.push_child(
            Element::new(NODE)
                .with_attribute("TYPE", "PLAYLIST")
                .with_attribute("NAME", name),
        );
        node.push_child(
            Element::new(PLAYLIST)
                .with_attribute("ENTRIES", entry_count.to_string())
                .with_attribute("TYPE", "LIST"),
        )
    }

    /// Serialise the document as UTF-8 with an XML declaration.
    pub fn write(&self, path: &Path) -> Result<()> {
        let write_error = |reason: String| LibraryError::Write {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::create(path).map_err(|e| write_error(e.to_string()))?;
        let mut writer = Writer::new(BufWriter::new(file));
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("no"))))
            .map_err(|e| write_error(e.to_string()))?;
        writer
            .get_mut()
            .write_all(b"\n")
            .map_err(|e| write_error(e.to_string()))?;
        write_element(&mut writer, &self.root).map_err(write_error)?;
        writer
            .into_inner()
            .flush()
            .map_err(|e| write_error(e.to_string()))?;
        Ok(())
    }
}

/// Append a `PRIMARYKEY` member record to a `PLAYLIST` element.
pub fn push_playlist_member(playlist: &mut Element, key: &str) {
    playlist.push_child(
        Element::new(ENTRY).with_child(
            Element::new(PRIMARYKEY)
                .with_attribute("TYPE", "TRACK")
                .with_attribute("KEY", key),
        ),
    );
}

fn root_folder_node() -> Element {
    Element::new(NODE)
        .with_attribute("TYPE", "FOLDER")
        .with_attribute("NAME", ROOT_NODE_NAME)
        .with_child(Element::new(SUBNODES).with_attribute("COUNT", "0"))
}

// =============================================================================
// XML plumbing
// =============================================================================

fn parse_element_tree(xml: &str) -> std::result::Result<Element, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(start) => stack.push(element_from_start(&start)?),
            Event::Empty(start) => {
                let element = element_from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| "unbalanced closing tag".to_string())?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let value = text.unescape().map_err(|e| e.to_string())?;
                    append_text(current, &value);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    let value = data.into_inner();
                    append_text(current, &String::from_utf8_lossy(&value));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err("unexpected end of document".to_string());
    }
    root.ok_or_else(|| "document has no root element".to_string())
}

fn append_text(element: &mut Element, value: &str) {
    element
        .text
        .get_or_insert_with(String::new)
        .push_str(value);
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> std::result::Result<(), String> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        Ok(())
    } else if root.is_none() {
        *root = Some(element);
        Ok(())
    } else {
        Err("multiple root elements".to_string())
    }
}

fn element_from_start(start: &BytesStart<'_>) -> std::result::Result<Element, String> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| e.to_string())?;
        let key: Cow<'_, str> = String::from_utf8_lossy(attribute.key.as_ref());
        let value = attribute.unescape_value().map_err(|e| e.to_string())?;
        element
            .attributes
            .push((key.into_owned(), value.into_owned()));
    }
    Ok(element)
}

fn write_element<W: Write>(
    writer: &mut Writer<W>,
    element: &Element,
) -> std::result::Result<(), String> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_none() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(|e| e.to_string());
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|e| e.to_string())?;
    if let Some(text) = &element.text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(|e| e.to_string())?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|e| e.to_string())
}
