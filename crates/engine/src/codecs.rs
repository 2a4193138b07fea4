//! Values stored in the cache-fronted databases and their codecs.
//!
//! | database   | value          | encoding                                 |
//! |------------|----------------|------------------------------------------|
//! | dicts      | [`Dictionary`] | bincode list of names, id = position     |
//! | dimensions | [`Dimension`]  | bincode sorted key set                   |
//! | segments   | [`Segment`]    | opaque bytes                             |
//! | trees      | [`Tree`]       | bincode `(frame ids, value)` pairs       |
//!
//! Tree frames are interned in the dictionary of the tree's application, so
//! encoding and decoding a tree goes through the dictionaries cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use profstore_core::{Result, StoreError};
use profstore_storage::{Cache, Codec};

// ============================================================================
// Dictionary
// ============================================================================

/// Symbol table mapping frame names to dense ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    fn from_names(names: Vec<String>) -> Self {
        let ids = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        Self { names, ids }
    }

    /// Id for `name`, assigning the next one if unseen
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// Id for `name` if it was interned
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    /// Name for `id`
    pub fn resolve(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Number of symbols
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no symbol was interned
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Codec for the dictionaries database
#[derive(Debug, Clone, Copy, Default)]
pub struct DictionaryCodec;

impl Codec for DictionaryCodec {
    type Value = Dictionary;

    fn encode(&self, _key: &str, value: &Dictionary) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&value.names)?)
    }

    fn decode(&self, _key: &str, bytes: &[u8]) -> Result<Dictionary> {
        let names: Vec<String> = bincode::deserialize(bytes)?;
        Ok(Dictionary::from_names(names))
    }
}

// ============================================================================
// Dimension
// ============================================================================

/// Sorted set of segment keys sharing one label value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dimension {
    keys: BTreeSet<String>,
}

impl Dimension {
    /// Create an empty dimension
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a segment key; returns false if already present
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    /// Remove a segment key; returns whether it was present
    pub fn remove(&mut self, key: &str) -> bool {
        self.keys.remove(key)
    }

    /// Segment keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the dimension has no keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Codec for the dimensions database
#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionCodec;

impl Codec for DimensionCodec {
    type Value = Dimension;

    fn encode(&self, _key: &str, value: &Dimension) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&value.keys)?)
    }

    fn decode(&self, _key: &str, bytes: &[u8]) -> Result<Dimension> {
        Ok(Dimension {
            keys: bincode::deserialize(bytes)?,
        })
    }
}

// ============================================================================
// Segment
// ============================================================================

/// Serialized segment; its layout belongs to the segment layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment(pub Vec<u8>);

/// Codec for the segments database
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentCodec;

impl Codec for SegmentCodec {
    type Value = Segment;

    fn encode(&self, _key: &str, value: &Segment) -> Result<Vec<u8>> {
        Ok(value.0.clone())
    }

    fn decode(&self, _key: &str, bytes: &[u8]) -> Result<Segment> {
        Ok(Segment(bytes.to_vec()))
    }
}

// ============================================================================
// Tree
// ============================================================================

/// Call stacks with their sampled values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    stacks: BTreeMap<Vec<String>, u64>,
}

impl Tree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` samples for a stack, root frame first
    pub fn insert<S: AsRef<str>>(&mut self, stack: &[S], value: u64) {
        let stack = stack.iter().map(|s| s.as_ref().to_string()).collect();
        *self.stacks.entry(stack).or_insert(0) += value;
    }

    /// Sum of all samples
    pub fn total(&self) -> u64 {
        self.stacks.values().sum()
    }

    /// Samples recorded for a stack
    pub fn value<S: AsRef<str>>(&self, stack: &[S]) -> u64 {
        let stack: Vec<String> = stack.iter().map(|s| s.as_ref().to_string()).collect();
        self.stacks.get(&stack).copied().unwrap_or(0)
    }

    /// Stacks and their values in order
    pub fn iter(&self) -> impl Iterator<Item = (&[String], u64)> {
        self.stacks.iter().map(|(s, v)| (s.as_slice(), *v))
    }

    /// Number of distinct stacks
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Whether the tree has no stacks
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

/// Dictionary key for a tree key: the application part before the first `:`
pub fn dictionary_key(tree_key: &str) -> &str {
    tree_key.split(':').next().unwrap_or(tree_key)
}

/// Codec for the trees database.
///
/// Holds the dictionaries cache; frame names are replaced by ids from the
/// application's dictionary on encode and resolved back on decode.
pub struct TreeCodec {
    dictionaries: Arc<Cache<DictionaryCodec>>,
    intern: Mutex<()>,
}

impl TreeCodec {
    /// Codec resolving symbols through `dictionaries`
    pub fn new(dictionaries: Arc<Cache<DictionaryCodec>>) -> Self {
        Self {
            dictionaries,
            intern: Mutex::new(()),
        }
    }
}

impl Codec for TreeCodec {
    type Value = Tree;

    fn encode(&self, key: &str, value: &Tree) -> Result<Vec<u8>> {
        let dict_key = dictionary_key(key);
        // Read-modify-write of the dictionary must not interleave with another encode.
        let _guard = self.intern.lock();
        let mut dict = self.dictionaries.get(dict_key)?.unwrap_or_default();
        let before = dict.len();

        let encoded: Vec<(Vec<u32>, u64)> = value
            .stacks
            .iter()
            .map(|(stack, v)| (stack.iter().map(|f| dict.intern(f)).collect(), *v))
            .collect();

        if dict.len() != before {
            self.dictionaries.put(dict_key, dict);
        }
        Ok(bincode::serialize(&encoded)?)
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<Tree> {
        let dict_key = dictionary_key(key);
        let encoded: Vec<(Vec<u32>, u64)> = bincode::deserialize(bytes)?;
        let dict = self.dictionaries.get(dict_key)?.unwrap_or_default();

        let mut tree = Tree::new();
        for (ids, value) in encoded {
            let stack = ids
                .iter()
                .map(|&id| {
                    dict.resolve(id).map(str::to_string).ok_or_else(|| {
                        StoreError::codec(format!(
                            "tree {} references unknown symbol {} in dictionary {}",
                            key, id, dict_key
                        ))
                    })
                })
                .collect::<Result<Vec<String>>>()?;
            *tree.stacks.entry(stack).or_insert(0) += value;
        }
        Ok(tree)
    }
}
