//! Type table helpers.

use rustc_hash::FxHashMap;

use crate::ir::{AnalysisInput, PathElem, TypeId, TypeKind, TypeRef};

/// Synchronization primitives from package `sync` that the interpreter models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncKind {
    Mutex,
    RwMutex,
    WaitGroup,
    Cond,
}

impl SyncKind {
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "sync.Mutex" => Some(SyncKind::Mutex),
            "sync.RWMutex" => Some(SyncKind::RwMutex),
            "sync.WaitGroup" => Some(SyncKind::WaitGroup),
            "sync.Cond" => Some(SyncKind::Cond),
            _ => None,
        }
    }
}

/// Program-wide type lookup table
#[derive(Debug, Default, Clone)]
pub struct TypeMap {
    types: FxHashMap<TypeId, TypeRef>,
}

/// Named types are followed at most this many hops.
const MAX_NAMED_CHAIN: usize = 16;

impl TypeMap {
    pub fn from_input(input: &AnalysisInput) -> Self {
        let types = input
            .packages
            .iter()
            .flat_map(|p| p.types.iter())
            .map(|t| (t.id, t.clone()))
            .collect();
        Self { types }
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeRef> {
        self.types.get(&id)
    }

    pub fn name(&self, id: TypeId) -> &str {
        self.types.get(&id).map(|t| t.name.as_str()).unwrap_or("?")
    }

    /// Follow `Named` types to their underlying structure.
    pub fn underlying(&self, id: TypeId) -> Option<&TypeRef> {
        let mut current = self.types.get(&id)?;
        for _ in 0..MAX_NAMED_CHAIN {
            if current.kind != TypeKind::Named || SyncKind::from_type_name(&current.name).is_some()
            {
                return Some(current);
            }
            current = self.types.get(&current.underlying)?;
        }
        Some(current)
    }

    pub fn kind(&self, id: TypeId) -> TypeKind {
        self.underlying(id)
            .map(|t| t.kind.clone())
            .unwrap_or(TypeKind::Unknown)
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        self.kind(id) == TypeKind::Pointer
    }

    pub fn is_chan(&self, id: TypeId) -> bool {
        self.kind(id) == TypeKind::Chan
    }

    pub fn is_interface(&self, id: TypeId) -> bool {
        self.kind(id) == TypeKind::Interface
    }

    pub fn is_struct(&self, id: TypeId) -> bool {
        self.kind(id) == TypeKind::Struct
    }

    /// Element type of pointers, slices, arrays, maps and channels.
    pub fn elem(&self, id: TypeId) -> Option<TypeId> {
        let t = self.underlying(id)?;
        match t.kind {
            TypeKind::Pointer | TypeKind::Slice | TypeKind::Array | TypeKind::Map | TypeKind::Chan => {
                Some(t.elem)
            }
            _ => None,
        }
    }

    /// The sync primitive a (possibly named) type denotes.
    pub fn sync_kind(&self, id: TypeId) -> Option<SyncKind> {
        let mut current = self.types.get(&id)?;
        for _ in 0..MAX_NAMED_CHAIN {
            if let Some(kind) = SyncKind::from_type_name(&current.name) {
                return Some(kind);
            }
            if current.kind != TypeKind::Named {
                return None;
            }
            current = self.types.get(&current.underlying)?;
        }
        None
    }

    /// Struct fields, following named types.
    pub fn fields(&self, id: TypeId) -> &[crate::ir::FieldInfo] {
        match self.underlying(id) {
            Some(t) if matches!(t.kind, TypeKind::Struct | TypeKind::Tuple) => &t.fields,
            _ => &[],
        }
    }

    pub fn field_type(&self, id: TypeId, field: &str) -> Option<TypeId> {
        self.fields(id)
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.type_id)
    }

    /// Type reached by following `path` from a value of type `root`.
    pub fn type_at_path(&self, root: TypeId, path: &[PathElem]) -> Option<TypeId> {
        let mut current = root;
        for elem in path {
            current = match elem {
                PathElem::Field(name) => self.field_type(current, name)?,
                PathElem::ArrayElem => self.elem(current)?,
            };
        }
        Some(current)
    }

    /// Whether values of this type embed a sync primitive or channel by value.
    pub fn contains_primitive(&self, id: TypeId) -> bool {
        self.contains_primitive_depth(id, 0)
    }

    fn contains_primitive_depth(&self, id: TypeId, depth: usize) -> bool {
        if depth > MAX_NAMED_CHAIN {
            return false;
        }
        if self.sync_kind(id).is_some() {
            return true;
        }
        match self.underlying(id).map(|t| t.kind.clone()) {
            Some(TypeKind::Struct) => self
                .fields(id)
                .iter()
                .any(|f| self.contains_primitive_depth(f.type_id, depth + 1)),
            Some(TypeKind::Array) => self
                .elem(id)
                .is_some_and(|e| self.contains_primitive_depth(e, depth + 1)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FieldInfo, Package};

    fn ty(id: TypeId, kind: TypeKind, name: &str) -> TypeRef {
        TypeRef {
            id,
            kind,
            name: name.into(),
            underlying: 0,
            elem: 0,
            key: 0,
            fields: vec![],
        }
    }

    fn make_type_map() -> TypeMap {
        let mut named_gossip = ty(4, TypeKind::Named, "main.Gossip");
        named_gossip.underlying = 3;
        let mut gossip = ty(3, TypeKind::Struct, "struct{mu sync.Mutex; closed bool}");
        gossip.fields = vec![
            FieldInfo {
                name: "mu".into(),
                type_id: 2,
            },
            FieldInfo {
                name: "closed".into(),
                type_id: 1,
            },
        ];
        let mut ptr = ty(5, TypeKind::Pointer, "*main.Gossip");
        ptr.elem = 4;
        let mut chan = ty(6, TypeKind::Chan, "chan int");
        chan.elem = 1;
        let mut mutex = ty(2, TypeKind::Named, "sync.Mutex");
        mutex.underlying = 7;
        let input = AnalysisInput {
            packages: vec![Package {
                import_path: "main".into(),
                name: "main".into(),
                files: vec![],
                types: vec![
                    ty(1, TypeKind::Basic, "bool"),
                    mutex,
                    gossip,
                    named_gossip,
                    ptr,
                    chan,
                    ty(7, TypeKind::Struct, "struct{state int32; sema uint32}"),
                ],
                functions: vec![],
                call_edges: vec![],
                global_vars: vec![],
                is_stdlib: false,
            }],
            go_version: String::new(),
            bridge_version: String::new(),
            constants: vec![],
            points_to: vec![],
        };
        TypeMap::from_input(&input)
    }

    #[test]
    fn test_named_types_resolve() {
        let tm = make_type_map();
        assert!(tm.is_struct(4));
        assert!(tm.is_pointer(5));
        assert!(tm.is_chan(6));
        assert_eq!(tm.elem(5), Some(4));
        assert_eq!(tm.field_type(4, "closed"), Some(1));
    }

    #[test]
    fn test_sync_kinds() {
        let tm = make_type_map();
        assert_eq!(tm.sync_kind(2), Some(SyncKind::Mutex));
        // The mutex is opaque: its internals are not followed.
        assert_eq!(tm.kind(2), TypeKind::Named);
        assert!(tm.contains_primitive(4));
        assert!(!tm.contains_primitive(1));
    }

    #[test]
    fn test_type_at_path() {
        let tm = make_type_map();
        let path = [PathElem::Field("mu".into())];
        assert_eq!(tm.type_at_path(4, &path), Some(2));
        assert_eq!(tm.type_at_path(4, &[PathElem::Field("nope".into())]), None);
    }
}
