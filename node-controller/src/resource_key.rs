use crate::errors::ControllerError;
use kube::Resource;
use kube_runtime::reflector::{Lookup, ObjectRef};
use std::str::FromStr;

/// Identity of a single object, `namespace/name` or just `name` for cluster
/// scoped objects like nodes.
///
/// Kind independent form of an [`ObjectRef`], so that the work queue and the
/// retry bookkeeping do not depend on the resource type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(|v| v.to_string()),
            name: name.to_string(),
        }
    }

    /// Derive the key from an object's metadata, fails if the object has no name.
    pub fn from_object<K: Resource>(obj: &K) -> Result<Self, ControllerError> {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ControllerError::MalformedKey(format!(
                    "object without name (namespace: {:?}, generateName: {:?})",
                    meta.namespace, meta.generate_name
                ))
            })?;
        let namespace = meta.namespace.as_deref().filter(|v| !v.is_empty());
        Ok(Self::new(namespace, name))
    }

    /// The reflector store reference of this key.
    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource<DynamicType = ()>,
    {
        let obj_ref = ObjectRef::new(&self.name);
        match &self.namespace {
            Some(namespace) => obj_ref.within(namespace),
            None => obj_ref,
        }
    }
}

impl<K: Lookup> From<&ObjectRef<K>> for ResourceKey {
    fn from(obj_ref: &ObjectRef<K>) -> Self {
        let namespace = obj_ref.namespace.as_deref().filter(|v| !v.is_empty());
        Self::new(namespace, &obj_ref.name)
    }
}

impl FromStr for ResourceKey {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split("/").collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, name)),
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(Some(namespace), name))
            }
            _ => Err(ControllerError::MalformedKey(format!(
                "unexpected key format: {:?}",
                s
            ))),
        }
    }
}
