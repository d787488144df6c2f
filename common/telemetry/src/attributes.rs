//! Append-only attribute list shared between context nodes.

use std::fmt;
use std::sync::Arc;

use opentelemetry::KeyValue;

/// Ordered, immutable sequence of diagnostic attributes.
///
/// Appending never touches the existing nodes: each call returns a new list that
/// points at the previous one, so contexts derived from the same parent share the
/// common prefix. Duplicate keys are kept; consumers decide how to reconcile them.
#[derive(Clone, Default)]
pub struct Attributes {
    head: Option<Arc<Node>>,
    len: usize,
}

struct Node {
    values: Vec<KeyValue>,
    parent: Option<Arc<Node>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new list holding `self` followed by `attrs`.
    pub fn append<I>(&self, attrs: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        let values: Vec<KeyValue> = attrs.into_iter().collect();
        if values.is_empty() {
            return self.clone();
        }

        let len = self.len + values.len();
        Self {
            head: Some(Arc::new(Node {
                values,
                parent: self.head.clone(),
            })),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flatten into a vector, oldest attribute first.
    pub fn to_vec(&self) -> Vec<KeyValue> {
        let mut chunks = Vec::new();
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            chunks.push(&node.values);
            cursor = node.parent.as_deref();
        }

        let mut out = Vec::with_capacity(self.len);
        for chunk in chunks.into_iter().rev() {
            out.extend(chunk.iter().cloned());
        }
        out
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_vec()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_order_and_duplicates() {
        let base = Attributes::new().append([KeyValue::new("a", 1_i64), KeyValue::new("b", 2_i64)]);
        let next = base.append([KeyValue::new("a", 3_i64)]);

        assert_eq!(
            next.to_vec(),
            vec![
                KeyValue::new("a", 1_i64),
                KeyValue::new("b", 2_i64),
                KeyValue::new("a", 3_i64)
            ]
        );
        assert_eq!(next.len(), 3);
    }

    #[test]
    fn siblings_do_not_see_each_other() {
        let base = Attributes::new().append([KeyValue::new("request", "r1")]);
        let left = base.append([KeyValue::new("side", "left")]);
        let right = base.append([KeyValue::new("side", "right")]);

        assert_eq!(base.len(), 1);
        assert_eq!(left.to_vec()[1], KeyValue::new("side", "left"));
        assert_eq!(right.to_vec()[1], KeyValue::new("side", "right"));
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let base = Attributes::new();
        let same = base.append(Vec::new());

        assert!(same.is_empty());
        assert!(same.head.is_none());
    }
}
