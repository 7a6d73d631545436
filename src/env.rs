//! Environment Bindings
//!
//! Immutable, ordered name→value mappings used to pass data between
//! workflow nodes and scopes.
//!
//! [`Bindings`] is a persistent structure: `bind` returns a new mapping that
//! shares its tail with the original, so snapshots handed to concurrently
//! running nodes are never mutated underneath them.
//!
//! Names are dotted strings; a call's outputs are bound under the call's
//! namespace (`align.bam`), and [`Bindings::enter_namespace`] /
//! [`Bindings::wrap_namespace`] move whole groups of names between scopes.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A single name→value entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding<V> {
    name: String,
    value: V,
}

impl<V> Binding<V> {
    pub fn new(name: impl Into<String>, value: V) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &V {
        &self.value
    }
}

struct Link<V> {
    binding: Binding<V>,
    next: Option<Arc<Link<V>>>,
}

/// Immutable ordered mapping from dotted names to values.
///
/// The most recent bind of a name wins for lookup. Iteration yields each
/// distinct name once, with its latest value, ordered by the position of
/// that latest bind.
pub struct Bindings<V> {
    head: Option<Arc<Link<V>>>,
}

impl<V> Bindings<V> {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self { head: None }
    }

    /// Returns a new mapping with one more entry.
    pub fn bind(&self, name: impl Into<String>, value: V) -> Self {
        Self {
            head: Some(Arc::new(Link {
                binding: Binding::new(name, value),
                next: self.head.clone(),
            })),
        }
    }

    /// Every entry, newest first, including shadowed ones.
    fn chain(&self) -> impl Iterator<Item = &Binding<V>> {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let link = cursor?;
            cursor = link.next.as_deref();
            Some(&link.binding)
        })
    }

    /// Looks up the binding for a name.
    pub fn resolve_binding(&self, name: &str) -> Option<&Binding<V>> {
        self.chain().find(|b| b.name == name)
    }

    /// Looks up the value bound to a name.
    pub fn get(&self, name: &str) -> Option<&V> {
        self.resolve_binding(name).map(|b| &b.value)
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.resolve_binding(name).is_some()
    }

    /// True if any name lies under `namespace.`
    pub fn has_namespace(&self, namespace: &str) -> bool {
        let prefix = namespace_prefix(namespace);
        self.chain().any(|b| b.name.starts_with(&prefix))
    }

    /// Iterates distinct names with their latest values.
    pub fn iter(&self) -> std::vec::IntoIter<&Binding<V>> {
        let mut seen = HashSet::new();
        let mut latest: Vec<&Binding<V>> = self
            .chain()
            .filter(|b| seen.insert(b.name.as_str()))
            .collect();
        latest.reverse();
        latest.into_iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|b| b.name()).collect()
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.iter().len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl<V: Clone> Bindings<V> {
    /// Entries of `self` whose names are absent from `other`.
    pub fn subtract<U>(&self, other: &Bindings<U>) -> Self {
        self.filter(|b| !other.has_binding(b.name()))
    }

    /// Union of both mappings; entries of `other` win on collisions.
    pub fn merge(&self, other: &Bindings<V>) -> Self {
        other
            .iter()
            .fold(self.clone(), |acc, b| acc.bind(b.name.clone(), b.value.clone()))
    }

    /// Prefixes every name with `namespace.`
    pub fn wrap_namespace(&self, namespace: &str) -> Self {
        let prefix = namespace_prefix(namespace);
        self.iter().fold(Self::new(), |acc, b| {
            acc.bind(format!("{}{}", prefix, b.name), b.value.clone())
        })
    }

    /// Selects names under `namespace.` and strips the prefix.
    pub fn enter_namespace(&self, namespace: &str) -> Self {
        let prefix = namespace_prefix(namespace);
        self.iter().fold(Self::new(), |acc, b| match b.name.strip_prefix(&prefix) {
            Some(rest) if !rest.is_empty() => acc.bind(rest, b.value.clone()),
            _ => acc,
        })
    }

    /// Keeps only the entries matching `keep`.
    pub fn filter(&self, mut keep: impl FnMut(&Binding<V>) -> bool) -> Self {
        self.iter().fold(Self::new(), |acc, b| {
            if keep(b) {
                acc.bind(b.name.clone(), b.value.clone())
            } else {
                acc
            }
        })
    }

    /// Owned `(name, value)` pairs in iteration order.
    pub fn to_pairs(&self) -> Vec<(String, V)> {
        self.iter()
            .map(|b| (b.name.clone(), b.value.clone()))
            .collect()
    }
}

impl<V> Bindings<V> {
    /// Transforms every value, keeping names and order.
    pub fn map<U>(&self, mut f: impl FnMut(&Binding<V>) -> U) -> Bindings<U> {
        self.iter()
            .fold(Bindings::new(), |acc, b| acc.bind(b.name.clone(), f(b)))
    }
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace.is_empty() || namespace.ends_with('.') {
        namespace.to_string()
    } else {
        format!("{}.", namespace)
    }
}

impl<V> Clone for Bindings<V> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
        }
    }
}

impl<V> Default for Bindings<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Drop for Bindings<V> {
    // Unlink iteratively; a long chain would otherwise recurse once per entry.
    fn drop(&mut self) {
        let mut cursor = self.head.take();
        while let Some(link) = cursor {
            match Arc::try_unwrap(link) {
                Ok(mut link) => cursor = link.next.take(),
                Err(_) => break,
            }
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for Bindings<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|b| (b.name(), b.value())))
            .finish()
    }
}

impl<V: PartialEq> PartialEq for Bindings<V> {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl<N: Into<String>, V> FromIterator<(N, V)> for Bindings<V> {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |acc, (name, value)| acc.bind(name, value))
    }
}
