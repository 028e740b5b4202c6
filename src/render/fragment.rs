// ============================================================================
// spark-compose - Output Fragments
// The tree a computation node produces on each execution
// ============================================================================

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::constants::{SLOT_KIND, SLOT_NODE_ATTR, TEXT_KIND, TEXT_VALUE_ATTR};
use crate::core::types::NodeId;

// =============================================================================
// KEY
// =============================================================================

/// Stable identity of a child among its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Named(Cow<'static, str>),
    Index(u64),
    /// The n-th repeat of a key that was declared more than once
    Occurrence(Box<Key>, u32),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Named(name) => write!(f, "{name:?}"),
            Key::Index(index) => write!(f, "#{index}"),
            Key::Occurrence(key, n) => write!(f, "{key}~{n}"),
        }
    }
}

impl From<&'static str> for Key {
    fn from(value: &'static str) -> Self {
        Key::Named(Cow::Borrowed(value))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Named(Cow::Owned(value))
    }
}

impl From<u64> for Key {
    fn from(value: u64) -> Self {
        Key::Index(value)
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Key::Index(value as u64)
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Key::Index(u64::from(value))
    }
}

// =============================================================================
// ATTRIBUTE VALUES
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Node(NodeId),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            AttrValue::Node(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        AttrValue::Int(i64::from(value))
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<NodeId> for AttrValue {
    fn from(value: NodeId) -> Self {
        AttrValue::Node(value)
    }
}

pub type AttrName = Cow<'static, str>;

/// Attributes are kept sorted so diffs and debug output are deterministic.
pub type Attributes = BTreeMap<AttrName, AttrValue>;

// =============================================================================
// FRAGMENT
// =============================================================================

/// A typed tree node: kind, optional key, attributes, ordered children.
///
/// Fragments are plain values. The node that produced one owns it until the
/// next execution replaces it.
///
/// ```
/// use spark_compose::Fragment;
///
/// let row = Fragment::new("row")
///     .with_key("header")
///     .attr("selected", true)
///     .child(Fragment::text("Count: 0"));
///
/// assert_eq!(row.kind(), "row");
/// assert_eq!(row.children().len(), 1);
/// assert_eq!(row.children()[0].text_value(), Some("Count: 0"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    kind: Cow<'static, str>,
    key: Option<Key>,
    attrs: Attributes,
    children: Vec<Fragment>,
}

impl Fragment {
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: kind.into(),
            key: None,
            attrs: Attributes::new(),
            children: Vec::new(),
        }
    }

    /// A text leaf.
    pub fn text(value: impl Into<String>) -> Self {
        Self::new(TEXT_KIND).attr(TEXT_VALUE_ATTR, AttrValue::Str(value.into()))
    }

    /// Placeholder for the output of child computation `node`.
    pub fn slot(key: Key, node: NodeId) -> Self {
        Self::new(SLOT_KIND)
            .with_key(key)
            .attr(SLOT_NODE_ATTR, AttrValue::Node(node))
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<Key>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn attr(mut self, name: impl Into<AttrName>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn child(mut self, child: Fragment) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn children_from(mut self, children: impl IntoIterator<Item = Fragment>) -> Self {
        self.children.extend(children);
        self
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn get_attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn children(&self) -> &[Fragment] {
        &self.children
    }

    pub fn text_value(&self) -> Option<&str> {
        if self.kind != TEXT_KIND {
            return None;
        }
        self.get_attr(TEXT_VALUE_ATTR).and_then(AttrValue::as_str)
    }

    /// The child node a slot fragment stands for.
    pub fn slot_target(&self) -> Option<NodeId> {
        if self.kind != SLOT_KIND {
            return None;
        }
        self.get_attr(SLOT_NODE_ATTR).and_then(AttrValue::as_node)
    }

    pub fn is_slot(&self) -> bool {
        self.kind == SLOT_KIND
    }

    /// Total number of fragment nodes in this tree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Fragment::node_count).sum::<usize>()
    }

    /// Descend by child indices. The empty path is `self`.
    pub fn at(&self, path: &[usize]) -> Option<&Fragment> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get(index))
    }

    pub fn at_mut(&mut self, path: &[usize]) -> Option<&mut Fragment> {
        path.iter()
            .try_fold(self, |node, &index| node.children.get_mut(index))
    }

    // =========================================================================
    // MUTATION (used by hosts applying patches)
    // =========================================================================

    pub fn children_mut(&mut self) -> &mut Vec<Fragment> {
        &mut self.children
    }

    pub fn set_attr(&mut self, name: AttrName, value: AttrValue) {
        self.attrs.insert(name, value);
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<AttrValue> {
        self.attrs.remove(name)
    }
}

// =============================================================================
// TESTS
// =============================================================================
