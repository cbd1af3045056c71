//! Core data model.
//!
//! An object key addresses one logical unit of reconcilable state. Watched
//! objects implement [`Resource`] so the event adapter can derive keys from
//! typed payloads instead of casting opaque values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Object Key
// ---------------------------------------------------------------------------

/// Identifier of a watched object, rendered as `namespace/name`.
///
/// Cluster-scoped objects have no namespace and render as just `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    /// Key for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment(&namespace, "namespace")?;
        validate_segment(&name, "name")?;
        Ok(Self {
            namespace: Some(namespace),
            name,
        })
    }

    /// Key for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment(&name, "name")?;
        Ok(Self {
            namespace: None,
            name,
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn validate_segment(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidKey(format!("{what} must not be empty")));
    }
    if value.contains('/') {
        return Err(Error::InvalidKey(format!(
            "{what} must not contain '/': {value}"
        )));
    }
    Ok(())
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) => Self::namespaced(ns, name),
            None => Self::cluster(s),
        }
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.to_string()
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A watched object type.
///
/// Key derivation is fallible: payloads that carry no usable identity are
/// rejected at the adapter boundary and dropped.
pub trait Resource: Send + Sync + 'static {
    fn object_key(&self) -> Result<ObjectKey>;
}
