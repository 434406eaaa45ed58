use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use super::{FabricError, Result};

// ============================================================================
// Keyspace / Key / KeyRange data model
// ============================================================================

/// How the manager resolves concurrent writes to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Every accepted event overwrites: last applied wins.
    ValueWins,
    /// The event with the highest id wins, so replay order is irrelevant.
    HighestIdWins,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::ValueWins => write!(f, "value-wins"),
            ConflictPolicy::HighestIdWins => write!(f, "highest-id-wins"),
        }
    }
}

/// A named logical table with a fixed key arity and a conflict policy.
///
/// Two keyspaces are the same iff policy, name and dimension all match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Keyspace {
    pub policy: ConflictPolicy,
    pub name: String,
    pub dimension: u32,
}

impl Keyspace {
    pub fn new(policy: ConflictPolicy, name: impl Into<String>, dimension: u32) -> Self {
        assert!(dimension > 0, "keyspace dimension must be positive");
        Self {
            policy,
            name: name.into(),
            dimension,
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.policy, self.dimension, self.name)
    }
}

/// Total order over JSON scalars used for key components and range bounds:
/// null < bool < number < string < array < object.
pub fn json_value_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let xf = x.as_f64().unwrap_or(f64::NAN);
            let yf = y.as_f64().unwrap_or(f64::NAN);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                let ord = json_value_cmp(xe, ye);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut xs: Vec<_> = x.iter().collect();
            let mut ys: Vec<_> = y.iter().collect();
            xs.sort_by(|l, r| l.0.cmp(r.0));
            ys.sort_by(|l, r| l.0.cmp(r.0));
            for ((xk, xv), (yk, yv)) in xs.iter().zip(ys.iter()) {
                let ord = xk.cmp(yk).then_with(|| json_value_cmp(xv, yv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// An address within a keyspace: an ordered tuple of `dimension` components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    keyspace: Keyspace,
    id: Vec<Value>,
}

impl Key {
    pub fn new(keyspace: Keyspace, id: Vec<Value>) -> Self {
        assert_eq!(
            keyspace.dimension as usize,
            id.len(),
            "can't address a keyspace of dimension {} with a tuple of dimension {}",
            keyspace.dimension,
            id.len()
        );
        Self { keyspace, id }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn id(&self) -> &[Value] {
        &self.id
    }

    pub fn component(&self, index: u32) -> &Value {
        &self.id[index as usize]
    }

    pub fn dimension(&self) -> u32 {
        self.keyspace.dimension
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.keyspace.cmp(&other.keyspace).then_with(|| {
            for (a, b) in self.id.iter().zip(other.id.iter()) {
                let ord = json_value_cmp(a, b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            self.id.len().cmp(&other.id.len())
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}, (", self.keyspace.name)?;
        for (ix, component) in self.id.iter().enumerate() {
            if ix > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", component)?;
        }
        write!(f, "))")
    }
}

/// One endpoint of a key range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyBound {
    pub value: Value,
    pub inclusive: bool,
}

impl KeyBound {
    pub fn inclusive(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            inclusive: true,
        }
    }

    pub fn exclusive(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            inclusive: false,
        }
    }
}

/// A contiguous sub-region of a keyspace, partitioned along one dimension.
/// `None` bounds are unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    keyspace: Keyspace,
    index: u32,
    left: Option<KeyBound>,
    right: Option<KeyBound>,
}

impl KeyRange {
    pub fn new(
        keyspace: Keyspace,
        index: u32,
        left: Option<KeyBound>,
        right: Option<KeyBound>,
    ) -> Result<Self> {
        if index >= keyspace.dimension {
            return Err(FabricError::InvalidRange(format!(
                "dimension index {} out of bounds for keyspace of dimension {}",
                index, keyspace.dimension
            )));
        }
        if let (Some(lo), Some(hi)) = (&left, &right) {
            if json_value_cmp(&lo.value, &hi.value) == Ordering::Greater {
                return Err(FabricError::InvalidRange(format!(
                    "low bound {} is above high bound {}",
                    lo.value, hi.value
                )));
            }
        }
        Ok(Self {
            keyspace,
            index,
            left,
            right,
        })
    }

    /// The unbounded range covering an entire keyspace along `index`.
    pub fn all(keyspace: Keyspace, index: u32) -> Self {
        assert!(index < keyspace.dimension);
        Self {
            keyspace,
            index,
            left: None,
            right: None,
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn left(&self) -> Option<&KeyBound> {
        self.left.as_ref()
    }

    pub fn right(&self) -> Option<&KeyBound> {
        self.right.as_ref()
    }

    pub fn contains(&self, key: &Key) -> bool {
        if *key.keyspace() != self.keyspace {
            return false;
        }
        let component = key.component(self.index);
        if let Some(lo) = &self.left {
            match json_value_cmp(component, &lo.value) {
                Ordering::Less => return false,
                Ordering::Equal if !lo.inclusive => return false,
                _ => {}
            }
        }
        if let Some(hi) = &self.right {
            match json_value_cmp(component, &hi.value) {
                Ordering::Greater => return false,
                Ordering::Equal if !hi.inclusive => return false,
                _ => {}
            }
        }
        true
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |bound: &Option<KeyBound>| match bound {
            None => "<null>".to_string(),
            Some(b) => b.value.to_string(),
        };
        write!(
            f,
            "{}-{}::dim({})",
            side(&self.left),
            side(&self.right),
            self.index
        )
    }
}

// ============================================================================
// Events
// ============================================================================

/// Identity of one write event: per-client monotonic id plus the client id.
/// Ordering is (event id, client id), which makes conflict resolution in
/// highest-id keyspaces deterministic across replays.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct UniqueId {
    pub event_id: u64,
    pub client_id: u32,
}

impl UniqueId {
    pub fn new(event_id: u64, client_id: u32) -> Self {
        Self {
            event_id,
            client_id,
        }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.event_id)
    }
}

/// One proposed mutation: a key, its new value (`None` = tombstone) and the
/// identity of the write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialEvent {
    pub key: Key,
    pub content: Option<Value>,
    pub id: UniqueId,
}

impl PartialEvent {
    pub fn new(key: Key, content: Option<Value>, id: UniqueId) -> Self {
        Self { key, content, id }
    }

    pub fn keyspace(&self) -> &Keyspace {
        self.key.keyspace()
    }

    pub fn is_tombstone(&self) -> bool {
        self.content.is_none()
    }
}

/// Apply one event to a key→entry map under the keyspace's conflict policy.
/// Both the view cache and log replay use this, so a replayed event stream
/// converges to the same map regardless of arrival order for highest-id
/// keyspaces.
pub fn apply_event(cache: &mut std::collections::BTreeMap<Key, ValueEntry>, event: PartialEvent) {
    match event.keyspace().policy {
        ConflictPolicy::ValueWins => {
            cache.insert(event.key, ValueEntry::new(event.content, event.id));
        }
        ConflictPolicy::HighestIdWins => {
            let apply = cache
                .get(&event.key)
                .map(|existing| event.id > existing.id())
                .unwrap_or(true);
            if apply {
                cache.insert(event.key, ValueEntry::new(event.content, event.id));
            }
        }
    }
}

/// A value as cached by a view: the payload plus the id of the write that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEntry {
    value: Option<Value>,
    id: UniqueId,
}

impl ValueEntry {
    pub fn new(value: Option<Value>, id: UniqueId) -> Self {
        Self { value, id }
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn id(&self) -> UniqueId {
        self.id
    }
}
