//! Read-only insight into host types, consumed by the AOT translator (and
//! usable by any other tool that needs layout without a live registry).
//!
//! Two implementations: [RuntimeInsight] reflects the current registry,
//! [SnapshotInsight] reads a serialized dump so code can be translated for
//! a platform other than the one it was captured on.

use crate::{
    name::Name,
    registry::TypeRegistry,
    types::{MetaKind, PropFlags, TypeTraits},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

/// One member of a class or struct, as layout: name, type name, byte
/// offset, and whether it lives in the out-of-object scripted buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: Name,
    pub type_name: Name,
    pub offset: u32,
    pub external: bool,
}

/// One enum option.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptionInfo {
    pub name: Name,
    pub value: i64,
}

/// Everything the translator needs to know about one host type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypeInfo {
    pub meta: MetaKind,
    pub size: u32,
    pub align: u32,
    pub traits: TypeTraits,
    /// Element type for arrays, pointed-to class for handles
    pub inner_type: Name,
    pub static_array_len: u32,
    pub base_class: Name,
    pub is_struct: bool,
    pub scripted: bool,
    /// Locally declared members only; inherited ones are on the base
    pub members: Vec<MemberInfo>,
    pub options: Vec<OptionInfo>,
}

/// Read-only view of host-side types by name.
pub trait TypeInsight {
    fn type_info(&self, name: Name) -> Option<TypeInfo>;
}

/// Insight over the live registry.
pub struct RuntimeInsight<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> RuntimeInsight<'a> {
    pub fn new(registry: &'a TypeRegistry) -> RuntimeInsight<'a> {
        RuntimeInsight { registry }
    }
}

impl TypeInsight for RuntimeInsight<'_> {
    fn type_info(&self, name: Name) -> Option<TypeInfo> {
        let id = self.registry.find_type(name)?;
        let def = self.registry.type_def(id);
        let inner_type = def
            .inner
            .map(|inner| self.registry.type_def(inner).name)
            .unwrap_or_default();
        let (base_class, is_struct, members) = match def.class_info() {
            Some(info) => (
                info.base
                    .map(|base| self.registry.type_def(base).name)
                    .unwrap_or_default(),
                info.is_struct,
                info.props
                    .iter()
                    .map(|prop| MemberInfo {
                        name: prop.name,
                        type_name: self.registry.type_def(prop.ty).name,
                        offset: prop.offset,
                        external: prop.flags.contains(PropFlags::EXTERNAL_BUFFER),
                    })
                    .collect(),
            ),
            None => (Name::none(), false, Vec::new()),
        };
        let options = def
            .enum_info
            .as_ref()
            .map(|info| {
                info.options
                    .iter()
                    .map(|&(name, value)| OptionInfo { name, value })
                    .collect()
            })
            .unwrap_or_default();
        Some(TypeInfo {
            meta: def.kind,
            size: def.size,
            align: def.align,
            traits: def.traits,
            inner_type,
            static_array_len: def.array_len,
            base_class,
            is_struct,
            scripted: def.scripted,
            members,
            options,
        })
    }
}

/// Insight read from a serialized type dump, for cross-platform
/// translation runs.
#[derive(Default, Serialize, Deserialize)]
pub struct SnapshotInsight {
    types: HashMap<Name, TypeInfo>,
}

impl SnapshotInsight {
    /// Capture every type the registry currently knows.
    pub fn capture(registry: &TypeRegistry) -> SnapshotInsight {
        let runtime = RuntimeInsight::new(registry);
        let types = registry
            .all_types()
            .filter_map(|(_, def)| runtime.type_info(def.name).map(|info| (def.name, info)))
            .collect();
        SnapshotInsight { types }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).expect("snapshot serialization");
        let mut file = std::fs::File::create(path)?;
        file.write_all(json.as_bytes())
    }

    pub fn load(path: &Path) -> std::io::Result<SnapshotInsight> {
        let mut text = String::new();
        std::fs::File::open(path)?.read_to_string(&mut text)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl TypeInsight for SnapshotInsight {
    fn type_info(&self, name: Name) -> Option<TypeInfo> {
        self.types.get(&name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_insight_primitives() {
        let registry = TypeRegistry::new();
        let insight = RuntimeInsight::new(&registry);
        let info = insight.type_info(Name::new("int32")).unwrap();
        assert_eq!(info.meta, MetaKind::Simple);
        assert_eq!(info.size, 4);
        assert!(info.traits.simple_copy);
        assert!(insight.type_info(Name::new("no_such_type")).is_none());
    }

    #[test]
    fn test_snapshot_roundtrip_through_registry() {
        let mut registry = TypeRegistry::new();
        let class = registry.register_native_class(Name::new("Actor"), None, false);
        let float = registry.primitives.float;
        registry.register_native_property(class, Name::new("health"), float, 16);

        let snapshot = SnapshotInsight::capture(&registry);
        let info = snapshot.type_info(Name::new("Actor")).unwrap();
        assert_eq!(info.meta, MetaKind::Class);
        assert_eq!(info.members.len(), 1);
        assert_eq!(info.members[0].name.as_str(), "health");
        assert_eq!(info.members[0].offset, 16);
    }
}
