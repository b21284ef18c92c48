use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Update sequence number stamped on every committed local write.
pub type Usn = u64;

/// Length of a textual invocation id, including the terminator the comparison
/// has always accounted for ("%08x-%04x-%04x-%04x-%04x%08x").
pub const GUID_STR_LEN: usize = 32 + 4 + 1;

/// Attribute whose metadata must advance local USN ordering even when it loses a conflict.
pub const ATTR_USN_CHANGED: &str = "uSNChanged";
/// Attribute carrying the local USN at entry creation.
pub const ATTR_USN_CREATED: &str = "uSNCreated";
/// Object identity attribute; never evaluated during conflict resolution.
pub const ATTR_OBJECT_GUID: &str = "objectGUID";
/// Common name attribute.
pub const ATTR_CN: &str = "cn";
/// Object class attribute.
pub const ATTR_OBJECT_CLASS: &str = "objectClass";
/// Replica invocation id attribute on server objects.
pub const ATTR_INVOCATION_ID: &str = "invocationId";
/// Numeric server id attribute on server objects.
pub const ATTR_SERVER_ID: &str = "serverId";
/// Persisted Raft term attribute.
pub const ATTR_RAFT_TERM: &str = "vmwRaftTerm";
/// Object class of server objects enumerated when building cluster state.
pub const OC_DIR_SERVER: &str = "vmwDirServer";
/// Container for Raft bookkeeping entries.
pub const RAFT_CONTEXT_DN: &str = "cn=raftcontext";
/// Well-known entry holding the persisted Raft term.
pub const RAFT_PERSIST_STATE_DN: &str = "cn=persiststate,cn=raftcontext";

/// Internal backend identifier of a directory entry
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Creates a new EntryId from a raw u64 value
    pub fn new(id: u64) -> Self {
        EntryId(id)
    }

    /// Returns the raw u64 value of this entry ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a Raft term number for leader election
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    /// Creates a new Term from a raw u64 value
    pub fn new(t: u64) -> Self {
        Term(t)
    }

    /// Returns the raw u64 value of this term
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the following term
    pub fn next(self) -> Self {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identity of a replica instance.
///
/// Ordering is the fixed-length lexicographic comparison used as the
/// conflict tie-breaker: only the first [`GUID_STR_LEN`] bytes take part.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvocationId(String);

impl InvocationId {
    /// Wraps an existing textual invocation id
    pub fn new(id: impl Into<String>) -> Self {
        InvocationId(id.into())
    }

    /// Generates a fresh random invocation id
    pub fn generate() -> Self {
        InvocationId(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the textual form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn fixed_bytes(&self) -> &[u8] {
        let bytes = self.0.as_bytes();
        &bytes[..bytes.len().min(GUID_STR_LEN)]
    }
}

impl PartialEq for InvocationId {
    fn eq(&self, other: &Self) -> bool {
        self.fixed_bytes() == other.fixed_bytes()
    }
}

impl Eq for InvocationId {}

impl std::hash::Hash for InvocationId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fixed_bytes().hash(state);
    }
}

impl Ord for InvocationId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fixed_bytes().cmp(other.fixed_bytes())
    }
}

impl PartialOrd for InvocationId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-attribute replication metadata.
///
/// Text form: `<local USN>:<version>:<originating invocation id>:<originating time>:<originating USN>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrMetadata {
    /// USN of the local write that stored this attribute
    pub local_usn: Usn,
    /// Version number, bumped on every originating write
    pub version: u64,
    /// Replica that originated the write
    pub invocation_id: InvocationId,
    /// Originating time as a generalized-time string
    pub orig_time: String,
    /// USN on the originating replica
    pub orig_usn: Usn,
}

impl AttrMetadata {
    /// Parses the colon separated text form
    pub fn parse(text: &str) -> Result<Self, MetaError> {
        let parts: Vec<&str> = text.split(':').collect();
        if parts.len() != 5 {
            return Err(MetaError::InvalidMetadata(text.to_string()));
        }
        let num = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| MetaError::InvalidMetadata(text.to_string()))
        };
        Ok(Self {
            local_usn: num(parts[0])?,
            version: num(parts[1])?,
            invocation_id: InvocationId::new(parts[2]),
            orig_time: parts[3].to_string(),
            orig_usn: num(parts[4])?,
        })
    }

    /// Compares the (version, invocation id) generation of two metadata records.
    pub fn same_generation(&self, other: &AttrMetadata) -> bool {
        self.version == other.version && self.invocation_id == other.invocation_id
    }
}

impl fmt::Display for AttrMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.local_usn, self.version, self.invocation_id, self.orig_time, self.orig_usn
        )
    }
}

/// Whether a value-metadata record adds or removes its value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueOpcode {
    /// The value was added
    Add,
    /// The value was removed
    Delete,
}

impl ValueOpcode {
    fn code(self) -> u8 {
        match self {
            ValueOpcode::Add => 1,
            ValueOpcode::Delete => 2,
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "1" => Some(ValueOpcode::Add),
            "2" => Some(ValueOpcode::Delete),
            _ => None,
        }
    }
}

/// Per-value metadata for multi-valued attributes.
///
/// Text form: `<attr>:<local USN>:<version>:<orig invocation id>:<value change invocation id>:
/// <value change time>:<value change USN>:<opcode>:<value size>:<value>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMetadata {
    /// Attribute type the value belongs to
    pub attr_type: String,
    /// Local USN of the write that stored this record
    pub local_usn: Usn,
    /// Attribute version at the time of the value change
    pub version: u64,
    /// Originating replica of the attribute generation
    pub invocation_id: InvocationId,
    /// Replica that originated the value change
    pub val_change_invocation_id: InvocationId,
    /// Generalized-time string of the value change
    pub val_change_time: String,
    /// Originating USN of the value change
    pub val_change_usn: Usn,
    /// Add or delete
    pub opcode: ValueOpcode,
    /// Raw value bytes
    pub value: Vec<u8>,
}

impl ValueMetadata {
    /// Parses the colon separated text form; the trailing value may itself contain colons.
    pub fn parse(text: &str) -> Result<Self, MetaError> {
        Self::decode(text.as_bytes())
    }

    /// Decodes the text form from raw bytes.
    ///
    /// The value is taken verbatim as the `<value size>` bytes after the
    /// ninth colon, so it may hold colons or bytes that are not UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        let bad = || MetaError::InvalidMetadata(String::from_utf8_lossy(bytes).into_owned());
        let mut fields: Vec<&str> = Vec::with_capacity(9);
        let mut rest = bytes;
        for _ in 0..9 {
            let pos = rest.iter().position(|b| *b == b':').ok_or_else(bad)?;
            fields.push(std::str::from_utf8(&rest[..pos]).map_err(|_| bad())?);
            rest = &rest[pos + 1..];
        }
        let num = |s: &str| s.parse::<u64>().map_err(|_| bad());
        let size = num(fields[8])? as usize;
        if rest.len() != size {
            return Err(bad());
        }
        Ok(Self {
            attr_type: fields[0].to_string(),
            local_usn: num(fields[1])?,
            version: num(fields[2])?,
            invocation_id: InvocationId::new(fields[3]),
            val_change_invocation_id: InvocationId::new(fields[4]),
            val_change_time: fields[5].to_string(),
            val_change_usn: num(fields[6])?,
            opcode: ValueOpcode::from_code(fields[7]).ok_or_else(bad)?,
            value: rest.to_vec(),
        })
    }

    /// Encodes the text form with the value bytes appended unchanged.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header().into_bytes();
        out.extend_from_slice(&self.value);
        out
    }

    fn header(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:",
            self.attr_type,
            self.local_usn,
            self.version,
            self.invocation_id,
            self.val_change_invocation_id,
            self.val_change_time,
            self.val_change_usn,
            self.opcode.code(),
            self.value.len(),
        )
    }
}

/// Renders the text form when the value is UTF-8. Other values are shown as
/// `0x`-prefixed hex, which `parse` rejects; use [`ValueMetadata::encode`] to
/// store them.
impl fmt::Display for ValueMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header())?;
        match std::str::from_utf8(&self.value) {
            Ok(text) => f.write_str(text),
            Err(_) => {
                f.write_str("0x")?;
                for b in &self.value {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// A directory entry as returned by the backend or a directory search.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Backend identifier
    pub id: Option<EntryId>,
    /// Distinguished name
    pub dn: String,
    /// Attribute values keyed by lowercase attribute name
    pub attrs: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    /// Creates an entry with no attributes
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            id: None,
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder helper adding a single string value
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.add_value(name, value.as_bytes().to_vec());
        self
    }

    /// Appends a value to an attribute
    pub fn add_value(&mut self, name: &str, value: Vec<u8>) {
        self.attrs.entry(attr_key(name)).or_default().push(value);
    }

    /// Replaces all values of an attribute
    pub fn replace(&mut self, name: &str, values: Vec<Vec<u8>>) {
        self.attrs.insert(attr_key(name), values);
    }

    /// Returns all values of an attribute
    pub fn values(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.attrs.get(&attr_key(name)).map(|v| v.as_slice())
    }

    /// Returns the first value of an attribute as UTF-8 text
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.values(name)
            .and_then(|v| v.first())
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Normalized attribute map key (attribute names are case-insensitive).
pub fn attr_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Splits the leading RDN value off a DN, e.g. `cn=host1,cn=Servers,...` gives `host1`.
pub fn rdn_value(dn: &str) -> Option<&str> {
    let first = dn.split(',').next()?;
    let (_, value) = first.split_once('=')?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Error types for the directory replication core
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// No metadata is stored yet for the attribute (a new attribute).
    #[error("attribute metadata not found for {attr} on entry {entry_id}")]
    AttrMetadataNotFound {
        /// Entry the lookup was made against
        entry_id: EntryId,
        /// Attribute name
        attr: String,
    },

    /// The entry does not exist.
    #[error("entry {0} not found")]
    EntryNotFound(String),

    /// The backend reported a transaction deadlock.
    #[error("backend deadlock")]
    Deadlock,

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// A directory search or modify failed.
    #[error("directory error: {0}")]
    Directory(String),

    /// A structural invariant is broken (self node missing, cache not loaded).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The node has not been promoted yet (no system domain).
    #[error("server not promoted")]
    NotPromoted,

    /// The server is shutting down.
    #[error("server shutting down")]
    ShuttingDown,

    /// Metadata text could not be parsed.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
