use serde::{Deserialize, Serialize};

use crate::RawValue;

/// A projection into a decoded value, used by [`Descriptor::Field`].
///
/// Values are decoded as MessagePack before projection; `Root` refers to
/// the whole decoded value, `Index`/`Key` project into a sequence or map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldPath {
    Root,
    Index(usize),
    Key(String),
}

/// A declarative, replicated descriptor of how to derive index terms or
/// evaluate CAS predicates.
///
/// Per the design note on replicating arbitrary code: closures never
/// cross the Raft log. Every replica interprets the same `Descriptor`
/// value identically, so index extractors and `put_if`/`delete_if`
/// predicates can travel as ordinary log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Descriptor {
    Const(RawValue),
    Field(FieldPath),
    Eq(Box<Descriptor>, Box<Descriptor>),
    Ne(Box<Descriptor>, Box<Descriptor>),
    Lt(Box<Descriptor>, Box<Descriptor>),
    Gt(Box<Descriptor>, Box<Descriptor>),
    And(Vec<Descriptor>),
    Or(Vec<Descriptor>),
    Not(Box<Descriptor>),
}

/// A `put_if`/`delete_if` predicate argument: exactly one of value
/// equality or a bounded descriptor expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    Expected(RawValue),
    Predicate(Descriptor),
}

/// A single term an index extractor produced for a given key's value.
pub type IndexTerm = RawValue;

impl Descriptor {
    /// Evaluate this descriptor as an index extractor against a decoded
    /// value, producing zero, one, or many index terms.
    ///
    /// `Eq`/`Ne`/`Lt`/`Gt`/`And`/`Or`/`Not` compose boolean results: a
    /// `true` contributes the `value` argument's bytes (via `Const`) as a
    /// term, `false` contributes nothing. `Field`/`Const` contribute their
    /// projected/literal bytes directly. This lets the same DSL serve as
    /// both extractor and predicate language.
    pub fn extract(&self, value: &RawValue) -> Vec<IndexTerm> {
        match self.evaluate(value) {
            Eval::Terms(terms) => terms,
            Eval::Bool(true) => vec![value.clone()],
            Eval::Bool(false) => vec![],
        }
    }

    /// Evaluate this descriptor as a boolean CAS predicate against a
    /// decoded value. Extractor-only nodes (`Field`, `Const`) are treated
    /// as "present and non-empty".
    pub fn test(&self, value: &RawValue) -> bool {
        match self.evaluate(value) {
            Eval::Bool(b) => b,
            Eval::Terms(terms) => !terms.is_empty(),
        }
    }

    fn evaluate(&self, value: &RawValue) -> Eval {
        match self {
            Descriptor::Const(v) => Eval::Terms(vec![v.clone()]),
            Descriptor::Field(path) => Eval::Terms(project(path, value).into_iter().collect()),
            Descriptor::Eq(a, b) => Eval::Bool(a.project_bytes(value) == b.project_bytes(value)),
            Descriptor::Ne(a, b) => Eval::Bool(a.project_bytes(value) != b.project_bytes(value)),
            // Lt/Gt compare re-encoded MessagePack bytes lexicographically, not
            // the decoded values numerically; callers comparing integers should
            // keep them fixed-width (e.g. big-endian-encoded) if cross-magnitude
            // ordering matters, since msgpack's variable-width int encoding isn't
            // order-preserving.
            Descriptor::Lt(a, b) => Eval::Bool(a.project_bytes(value) < b.project_bytes(value)),
            Descriptor::Gt(a, b) => Eval::Bool(a.project_bytes(value) > b.project_bytes(value)),
            Descriptor::And(terms) => Eval::Bool(terms.iter().all(|d| d.test(value))),
            Descriptor::Or(terms) => Eval::Bool(terms.iter().any(|d| d.test(value))),
            Descriptor::Not(inner) => Eval::Bool(!inner.test(value)),
        }
    }

    /// Byte projection used by comparison nodes: `Const` yields its literal,
    /// `Field` yields the projected bytes, everything else yields an empty
    /// slice (comparisons are only meaningful on leaves).
    fn project_bytes(&self, value: &RawValue) -> Vec<u8> {
        match self {
            Descriptor::Const(v) => v.clone(),
            Descriptor::Field(path) => project(path, value).unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

enum Eval {
    Bool(bool),
    Terms(Vec<IndexTerm>),
}

/// Project `path` out of a MessagePack-decoded value, returning the raw
/// re-encoded bytes of the selected sub-term, if any.
fn project(path: &FieldPath, value: &RawValue) -> Option<Vec<u8>> {
    let decoded: rmpv::Value = rmp_serde::from_slice(value).ok()?;
    let selected = match path {
        FieldPath::Root => Some(decoded),
        FieldPath::Index(i) => decoded.as_array().and_then(|a| a.get(*i).cloned()),
        FieldPath::Key(k) => decoded
            .as_map()
            .and_then(|m| m.iter().find(|(key, _)| key.as_str() == Some(k.as_str())))
            .map(|(_, v)| v.clone()),
    }?;
    rmp_serde::to_vec(&selected).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgpack(v: impl serde::Serialize) -> RawValue {
        rmp_serde::to_vec(&v).unwrap()
    }

    #[test]
    fn const_eq_predicate() {
        let v = msgpack(42i64);
        let d = Descriptor::Eq(
            Box::new(Descriptor::Field(FieldPath::Root)),
            Box::new(Descriptor::Const(msgpack(42i64))),
        );
        assert!(d.test(&v));
        assert!(!d.test(&msgpack(7i64)));
    }

    #[test]
    fn and_or_not_compose() {
        let v = msgpack(10i64);
        let gt5 = Descriptor::Gt(
            Box::new(Descriptor::Field(FieldPath::Root)),
            Box::new(Descriptor::Const(msgpack(5i64))),
        );
        let lt20 = Descriptor::Lt(
            Box::new(Descriptor::Field(FieldPath::Root)),
            Box::new(Descriptor::Const(msgpack(20i64))),
        );
        let both = Descriptor::And(vec![gt5.clone(), lt20.clone()]);
        assert!(both.test(&v));
        assert!(!Descriptor::Not(Box::new(both)).test(&v));
    }

    #[test]
    fn field_extractor_pulls_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("tag".to_string(), "blue".to_string());
        let v = msgpack(map);
        let d = Descriptor::Field(FieldPath::Key("tag".to_string()));
        let terms = d.extract(&v);
        assert_eq!(terms.len(), 1);
        let decoded: String = rmp_serde::from_slice(&terms[0]).unwrap();
        assert_eq!(decoded, "blue");
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// `Field(Root)` always extracts exactly the whole encoded value
        /// back out, for any string payload.
        #[test]
        fn root_extractor_round_trips(s in ".*") {
            let v: RawValue = rmp_serde::to_vec(&s).unwrap();
            let terms = Descriptor::Field(FieldPath::Root).extract(&v);
            prop_assert_eq!(terms.len(), 1);
            let decoded: String = rmp_serde::from_slice(&terms[0]).unwrap();
            prop_assert_eq!(decoded, s);
        }

        /// `Eq(Root, Const(x))` holds exactly when the decoded value
        /// equals `x`.
        #[test]
        fn eq_predicate_matches_equality(a in any::<i64>(), b in any::<i64>()) {
            let v: RawValue = rmp_serde::to_vec(&a).unwrap();
            let d = Descriptor::Eq(
                Box::new(Descriptor::Field(FieldPath::Root)),
                Box::new(Descriptor::Const(rmp_serde::to_vec(&b).unwrap())),
            );
            prop_assert_eq!(d.test(&v), a == b);
        }
    }
}
