//! The fact model and content addressing.
//!
//! A fact is an immutable record: a type tag, scalar fields, and named,
//! ordered lists of predecessor references. A fact has no identity beyond
//! its content; its hash is a blake3 digest over a canonical serialization,
//! so two facts with identical canonical form are the same fact.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FactlineError, FactlineResult, ValidationError};
use crate::value::FieldValue;

/// A reference uniquely naming a fact: its type and content hash.
///
/// The hash is the lowercase hex blake3 digest of the fact's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactReference {
    /// The fact's type tag.
    #[serde(rename = "type")]
    pub fact_type: String,

    /// Content hash in lowercase hex.
    pub hash: String,
}

impl FactReference {
    /// Creates a reference from parts.
    #[must_use]
    pub fn new(fact_type: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            fact_type: fact_type.into(),
            hash: hash.into(),
        }
    }

    /// The storage key for this reference: `type:hash`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.fact_type, self.hash)
    }
}

impl fmt::Display for FactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fact_type, self.hash)
    }
}

/// An immutable typed record referencing zero or more predecessor facts.
///
/// Field and role maps are `BTreeMap`s, which gives canonical key ordering
/// for free. Predecessor lists keep insertion order.
///
/// # Examples
///
/// ```
/// use factline::Fact;
///
/// let list = Fact::new("List").with_field("name", "Chores");
/// let task = Fact::new("Task")
///     .with_field("description", "take out the trash")
///     .with_predecessor("list", list.reference().unwrap());
///
/// assert_eq!(task.fact_type, "Task");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Stable textual type tag.
    #[serde(rename = "type")]
    pub fact_type: String,

    /// Scalar fields by name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,

    /// Ordered predecessor references by role name.
    #[serde(default)]
    pub predecessors: BTreeMap<String, Vec<FactReference>>,
}

impl Fact {
    /// Creates an empty fact of the given type.
    #[must_use]
    pub fn new(fact_type: impl Into<String>) -> Self {
        Self {
            fact_type: fact_type.into(),
            fields: BTreeMap::new(),
            predecessors: BTreeMap::new(),
        }
    }

    /// Adds a scalar field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Appends one predecessor reference under a role.
    #[must_use]
    pub fn with_predecessor(mut self, role: impl Into<String>, reference: FactReference) -> Self {
        self.predecessors
            .entry(role.into())
            .or_default()
            .push(reference);
        self
    }

    /// Sets a role to an ordered, possibly empty list of predecessors.
    #[must_use]
    pub fn with_predecessors(
        mut self,
        role: impl Into<String>,
        references: Vec<FactReference>,
    ) -> Self {
        self.predecessors.insert(role.into(), references);
        self
    }

    /// Checks the structural constraints a fact must satisfy before it can
    /// be canonicalized.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fact_type.is_empty() {
            return Err(ValidationError::EmptyFactType);
        }
        for (name, value) in &self.fields {
            if name.is_empty() {
                return Err(ValidationError::EmptyName {
                    kind: "field",
                    fact_type: self.fact_type.clone(),
                });
            }
            if let FieldValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(ValidationError::NonFiniteNumber { field: name.clone() });
                }
            }
        }
        for (role, references) in &self.predecessors {
            if role.is_empty() {
                return Err(ValidationError::EmptyName {
                    kind: "role",
                    fact_type: self.fact_type.clone(),
                });
            }
            for reference in references {
                if reference.fact_type.is_empty() || reference.hash.is_empty() {
                    return Err(ValidationError::InvalidFact {
                        fact_type: self.fact_type.clone(),
                        reason: format!("role '{role}' contains an incomplete reference"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Produces the canonical serialization this fact is hashed over.
    ///
    /// The form is bit-exact across implementations: top-level keys in the
    /// fixed order `fields`, `predecessors`, `type`; map keys lexicographic;
    /// predecessor entries as `{"type":…,"hash":…}` in list insertion order;
    /// dates as ISO-8601 UTC with millisecond precision.
    pub fn canonical_form(&self) -> Result<String, ValidationError> {
        self.validate()?;

        let mut out = String::with_capacity(128);
        out.push_str("{\"fields\":{");
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&json_string(name));
            out.push(':');
            write_canonical_value(&mut out, value);
        }
        out.push_str("},\"predecessors\":{");
        for (i, (role, references)) in self.predecessors.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&json_string(role));
            out.push_str(":[");
            for (j, reference) in references.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                out.push_str("{\"type\":");
                out.push_str(&json_string(&reference.fact_type));
                out.push_str(",\"hash\":");
                out.push_str(&json_string(&reference.hash));
                out.push('}');
            }
            out.push(']');
        }
        out.push_str("},\"type\":");
        out.push_str(&json_string(&self.fact_type));
        out.push('}');
        Ok(out)
    }

    /// The blake3 content hash of this fact, in lowercase hex.
    pub fn hash(&self) -> Result<String, ValidationError> {
        let canonical = self.canonical_form()?;
        Ok(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    /// The `(type, hash)` reference naming this fact.
    pub fn reference(&self) -> Result<FactReference, ValidationError> {
        Ok(FactReference {
            fact_type: self.fact_type.clone(),
            hash: self.hash()?,
        })
    }

    /// All predecessor references of this fact, in role order.
    #[must_use]
    pub fn predecessor_references(&self) -> Vec<&FactReference> {
        self.predecessors.values().flatten().collect()
    }
}

fn json_string(s: &str) -> String {
    // serde_json's escaping is the canonical escaping.
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn write_canonical_value(out: &mut String, value: &FieldValue) {
    match value {
        FieldValue::String(s) => out.push_str(&json_string(s)),
        FieldValue::Number(n) => {
            // Finite by validation; ryu shortest round-trip via serde_json.
            out.push_str(&serde_json::to_string(n).unwrap_or_else(|_| "0".to_string()));
        }
        FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        FieldValue::Date(d) => {
            out.push('"');
            out.push_str(&d.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
            out.push('"');
        }
    }
}

/// An opaque signature over a fact's canonical form.
///
/// The core never verifies signatures; it only records them and checks
/// presence where authorization rules demand authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSignature {
    /// The signing public key, in the key store's own encoding.
    pub public_key: String,

    /// The signature bytes, encoded by the key store.
    pub signature: String,
}

/// A fact plus zero or more signatures. The unit of storage and transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEnvelope {
    /// The fact itself.
    pub fact: Fact,

    /// Attached signatures, possibly empty.
    #[serde(default)]
    pub signatures: Vec<FactSignature>,
}

impl FactEnvelope {
    /// Wraps a fact with no signatures.
    #[must_use]
    pub fn unsigned(fact: Fact) -> Self {
        Self {
            fact,
            signatures: Vec::new(),
        }
    }

    /// The reference of the enclosed fact.
    pub fn reference(&self) -> Result<FactReference, ValidationError> {
        self.fact.reference()
    }
}

/// Orders a batch so every fact appears after its in-batch predecessors.
///
/// References outside the batch are assumed already stored; storage will
/// reject them if not. Facts reference only facts hashed before them, so a
/// cycle inside a batch is a malformed submission.
pub fn topological_order(envelopes: Vec<FactEnvelope>) -> FactlineResult<Vec<FactEnvelope>> {
    let mut keyed: Vec<(String, FactEnvelope)> = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let key = envelope.reference().map_err(FactlineError::from)?.key();
        keyed.push((key, envelope));
    }

    let in_batch: std::collections::HashSet<String> =
        keyed.iter().map(|(k, _)| k.clone()).collect();

    let mut placed: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut ordered: Vec<FactEnvelope> = Vec::with_capacity(keyed.len());
    let mut pending = keyed;

    while !pending.is_empty() {
        let before = pending.len();
        let mut still_pending = Vec::new();
        for (key, envelope) in pending {
            let ready = envelope.fact.predecessor_references().iter().all(|p| {
                let pk = p.key();
                !in_batch.contains(&pk) || placed.contains(&pk)
            });
            if ready {
                placed.insert(key);
                ordered.push(envelope);
            } else {
                still_pending.push((key, envelope));
            }
        }
        if still_pending.len() == before {
            return Err(FactlineError::Validation(ValidationError::InvalidFact {
                fact_type: still_pending[0].1.fact.fact_type.clone(),
                reason: "batch contains a predecessor cycle".to_string(),
            }));
        }
        pending = still_pending;
    }

    Ok(ordered)
}
