//! Deterministic transform from LSP result sets to graph entities.
//!
//! The mapper is a pure function of its inputs: node ids are content
//! hashes, so concurrent workers produce identical entities for the same
//! symbol without coordination.

use crate::graph::model::{
    CodeNode, Edge, EdgeKey, EdgeType, NodeId, NodeKind, Position, Project, SourceRange,
};
use crate::language_detector::Language;
use crate::lsp::client::path_to_uri;
use crate::lsp::types::{symbol_kind, DocumentSymbol, LspLocation, LspRange};
use crate::symbol_registry::{RegisteredSymbol, SymbolRegistry};
use crate::walker::FileDescriptor;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// Result of mapping one file's document symbols.
#[derive(Debug, Default)]
pub struct MappedFile {
    pub nodes: Vec<CodeNode>,
    pub edges: Vec<Edge>,
    /// Everything that goes into the symbol registry for pass 2.
    pub symbols: Vec<RegisteredSymbol>,
    /// `(importing module, imported name)` pairs resolved once all files
    /// are known.
    pub imports: Vec<(NodeId, String)>,
}

pub struct SymbolMapper {
    project_id: Uuid,
    project_node_id: NodeId,
    root: PathBuf,
    root_uri: String,
}

impl SymbolMapper {
    pub fn new(project: &Project) -> Self {
        let project_node = Self::project_node_for(project);
        Self {
            project_id: project.project_id,
            project_node_id: project_node.id,
            root: project.root_path.clone(),
            root_uri: path_to_uri(&project.root_path),
        }
    }

    /// The root node every CONTAINS chain terminates at.
    pub fn project_node(&self, project: &Project) -> CodeNode {
        Self::project_node_for(project)
    }

    fn project_node_for(project: &Project) -> CodeNode {
        CodeNode::new(
            project.project_id,
            NodeKind::Project,
            project.name.clone(),
            project.name.clone(),
            path_to_uri(&project.root_path),
            SourceRange::default(),
        )
    }

    pub fn project_node_id(&self) -> &NodeId {
        &self.project_node_id
    }

    /// Map a `documentSymbol` tree into nodes and CONTAINS edges.
    ///
    /// Malformed symbols are skipped individually; the file always yields
    /// at least its File node.
    pub fn map_document(
        &self,
        descriptor: &FileDescriptor,
        symbols: &[DocumentSymbol],
    ) -> MappedFile {
        let uri = path_to_uri(&descriptor.path);
        let mut mapped = MappedFile::default();
        let mut edge_keys: HashSet<EdgeKey> = HashSet::new();

        let file_name = descriptor
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        let file_kind = if descriptor.config_type.is_some() {
            NodeKind::Config
        } else {
            NodeKind::File
        };
        let file_node = CodeNode::new(
            self.project_id,
            file_kind,
            file_name,
            self.relative_path(&descriptor.path),
            uri.clone(),
            SourceRange::default(),
        );
        push_edge(
            &mut mapped.edges,
            &mut edge_keys,
            Edge::new(self.project_node_id.clone(), file_node.id.clone(), EdgeType::Contains),
        );

        // Config files carry no module structure.
        if file_kind == NodeKind::Config {
            mapped.nodes.push(file_node);
            return mapped;
        }

        let module_fqn = self.module_name(&descriptor.path, descriptor.language);
        let module_node = CodeNode::new(
            self.project_id,
            NodeKind::Module,
            module_fqn.rsplit('.').next().unwrap_or(&module_fqn).to_string(),
            module_fqn.clone(),
            uri.clone(),
            SourceRange::default(),
        );
        push_edge(
            &mut mapped.edges,
            &mut edge_keys,
            Edge::new(file_node.id.clone(), module_node.id.clone(), EdgeType::Contains),
        );
        mapped.symbols.push(RegisteredSymbol::from_node(&module_node));

        for symbol in symbols {
            // Top-level Module symbols are import statements in the
            // languages whose servers expose them; they become IMPORTS
            // edges once the target is resolvable.
            if symbol.kind == symbol_kind::MODULE {
                mapped
                    .imports
                    .push((module_node.id.clone(), symbol.name.clone()));
                continue;
            }
            self.map_symbol(
                symbol,
                &module_fqn,
                &module_node.id,
                &uri,
                &mut mapped,
                &mut edge_keys,
            );
        }

        mapped.nodes.push(file_node);
        mapped.nodes.push(module_node);
        mapped
    }

    fn map_symbol(
        &self,
        symbol: &DocumentSymbol,
        parent_fqn: &str,
        parent_id: &NodeId,
        uri: &str,
        mapped: &mut MappedFile,
        edge_keys: &mut HashSet<EdgeKey>,
    ) {
        if symbol.name.trim().is_empty() {
            debug!("Skipping unnamed symbol in {}", uri);
            return;
        }
        let Some(kind) = map_symbol_kind(symbol.kind) else {
            debug!(
                "Skipping symbol '{}' with unmapped kind {} in {}",
                symbol.name, symbol.kind, uri
            );
            return;
        };

        let fqn = if parent_fqn.is_empty() {
            symbol.name.clone()
        } else {
            format!("{}.{}", parent_fqn, symbol.name)
        };
        let node = CodeNode::new(
            self.project_id,
            kind,
            symbol.name.clone(),
            fqn.clone(),
            uri.to_string(),
            to_source_range(&symbol.range),
        );
        push_edge(
            &mut mapped.edges,
            edge_keys,
            Edge::new(parent_id.clone(), node.id.clone(), EdgeType::Contains),
        );

        let mut registered = RegisteredSymbol::from_node(&node);
        registered.selection = symbol.selection_range.start;
        mapped.symbols.push(registered);

        let node_id = node.id.clone();
        mapped.nodes.push(node);

        if let Some(children) = &symbol.children {
            for child in children {
                self.map_symbol(child, &fqn, &node_id, uri, mapped, edge_keys);
            }
        }
    }

    /// Reference locations become edges from the enclosing symbol at each
    /// location to the queried symbol: CALLS when the target is callable,
    /// REFERENCES otherwise. Locations outside the project are suppressed.
    pub fn reference_edges(
        &self,
        target: &RegisteredSymbol,
        locations: &[LspLocation],
        registry: &SymbolRegistry,
    ) -> Vec<Edge> {
        let edge_type = if target.kind.is_callable() {
            EdgeType::Calls
        } else {
            EdgeType::References
        };
        self.location_edges(target, locations, registry, |_| edge_type)
    }

    /// Implementation locations become INHERITS_FROM edges when the queried
    /// symbol is a class base, IMPLEMENTS otherwise.
    pub fn implementation_edges(
        &self,
        target: &RegisteredSymbol,
        locations: &[LspLocation],
        registry: &SymbolRegistry,
    ) -> Vec<Edge> {
        let edge_type = match target.kind {
            NodeKind::Class => EdgeType::InheritsFrom,
            _ => EdgeType::Implements,
        };
        self.location_edges(target, locations, registry, |_| edge_type)
    }

    fn location_edges(
        &self,
        target: &RegisteredSymbol,
        locations: &[LspLocation],
        registry: &SymbolRegistry,
        edge_type: impl Fn(&RegisteredSymbol) -> EdgeType,
    ) -> Vec<Edge> {
        let mut edges = Vec::new();
        let mut seen: HashSet<EdgeKey> = HashSet::new();
        for location in locations {
            if !self.uri_in_project(&location.uri) {
                continue;
            }
            let Some(source) = registry.enclosing(&location.uri, location.range.start) else {
                continue;
            };
            if source.node_id == target.node_id {
                continue;
            }
            let edge = Edge::new(
                source.node_id.clone(),
                target.node_id.clone(),
                edge_type(&source),
            );
            if seen.insert(edge.key()) {
                edges.push(edge);
            }
        }
        edges
    }

    /// Resolve recorded import names against the registry; unresolvable
    /// names are dropped (cross-language import parsing is out of scope).
    pub fn resolve_imports(
        &self,
        imports: &[(NodeId, String)],
        registry: &SymbolRegistry,
    ) -> Vec<Edge> {
        let mut edges = Vec::new();
        let mut seen: HashSet<EdgeKey> = HashSet::new();
        for (importer, name) in imports {
            let Some(target) = registry.resolve_import(name) else {
                continue;
            };
            if &target == importer {
                continue;
            }
            let edge = Edge::new(importer.clone(), target, EdgeType::Imports);
            if seen.insert(edge.key()) {
                edges.push(edge);
            }
        }
        edges
    }

    /// Module path for a file: Python uses the dotted package path, other
    /// languages the file stem.
    pub fn module_name(&self, path: &Path, language: Language) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        match language {
            Language::Python => {
                let mut parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                if let Some(last) = parts.last_mut() {
                    *last = last
                        .strip_suffix(".py")
                        .or_else(|| last.strip_suffix(".pyi"))
                        .or_else(|| last.strip_suffix(".pyw"))
                        .unwrap_or(last)
                        .to_string();
                }
                if parts.last().map(|l| l == "__init__").unwrap_or(false) {
                    parts.pop();
                }
                if parts.is_empty() {
                    "__init__".to_string()
                } else {
                    parts.join(".")
                }
            }
            _ => relative
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unnamed")
                .to_string(),
        }
    }

    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn uri_in_project(&self, uri: &str) -> bool {
        uri.starts_with(self.root_uri.trim_end_matches('/'))
    }
}

fn push_edge(edges: &mut Vec<Edge>, seen: &mut HashSet<EdgeKey>, edge: Edge) {
    if seen.insert(edge.key()) {
        edges.push(edge);
    }
}

fn to_source_range(range: &LspRange) -> SourceRange {
    SourceRange {
        start_line: range.start.line,
        start_char: range.start.character,
        end_line: range.end.line,
        end_char: range.end.character,
    }
}

/// LSP `SymbolKind` to graph node kind. Unmapped kinds skip the symbol.
pub fn map_symbol_kind(kind: u32) -> Option<NodeKind> {
    match kind {
        symbol_kind::FILE | symbol_kind::MODULE => Some(NodeKind::Module),
        symbol_kind::NAMESPACE => Some(NodeKind::Namespace),
        symbol_kind::PACKAGE => Some(NodeKind::Package),
        symbol_kind::CLASS | symbol_kind::STRUCT => Some(NodeKind::Class),
        symbol_kind::METHOD | symbol_kind::CONSTRUCTOR => Some(NodeKind::Method),
        symbol_kind::PROPERTY
        | symbol_kind::FIELD
        | symbol_kind::VARIABLE
        | symbol_kind::STRING
        | symbol_kind::NUMBER
        | symbol_kind::BOOLEAN
        | symbol_kind::ARRAY
        | symbol_kind::OBJECT
        | symbol_kind::KEY
        | symbol_kind::NULL => Some(NodeKind::Variable),
        symbol_kind::CONSTANT | symbol_kind::ENUM_MEMBER => Some(NodeKind::Constant),
        symbol_kind::ENUM => Some(NodeKind::Enum),
        symbol_kind::INTERFACE => Some(NodeKind::Interface),
        symbol_kind::FUNCTION => Some(NodeKind::Function),
        symbol_kind::EVENT => Some(NodeKind::Event),
        symbol_kind::OPERATOR => Some(NodeKind::Operator),
        symbol_kind::TYPE_PARAMETER => Some(NodeKind::Parameter),
        _ => None,
    }
}

/// Figure out which Position a failure happened at, for checkpointing.
pub fn failure_position(symbol: Option<&DocumentSymbol>) -> Position {
    symbol
        .map(|s| Position {
            line: s.range.start.line,
            character: s.range.start.character,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::SourceType;
    use crate::lsp::types::LspPosition;
    use crate::walker::FilePriority;

    fn project() -> Project {
        Project {
            project_id: Uuid::new_v4(),
            name: "demo".into(),
            root_path: PathBuf::from("/repo"),
            source_type: SourceType::Git,
            created_at: 0,
        }
    }

    fn descriptor(path: &str, language: Language) -> FileDescriptor {
        FileDescriptor {
            path: PathBuf::from(path),
            size: 100,
            language,
            priority: FilePriority::Regular,
            config_type: None,
        }
    }

    fn class_with_method() -> Vec<DocumentSymbol> {
        vec![DocumentSymbol {
            name: "A".into(),
            detail: None,
            kind: symbol_kind::CLASS,
            range: LspRange {
                start: LspPosition { line: 0, character: 0 },
                end: LspPosition { line: 3, character: 0 },
            },
            selection_range: LspRange {
                start: LspPosition { line: 0, character: 6 },
                end: LspPosition { line: 0, character: 7 },
            },
            children: Some(vec![DocumentSymbol {
                name: "m".into(),
                detail: None,
                kind: symbol_kind::METHOD,
                range: LspRange {
                    start: LspPosition { line: 1, character: 4 },
                    end: LspPosition { line: 2, character: 0 },
                },
                selection_range: LspRange {
                    start: LspPosition { line: 1, character: 8 },
                    end: LspPosition { line: 1, character: 9 },
                },
                children: None,
            }]),
        }]
    }

    #[test]
    fn python_module_names() {
        let mapper = SymbolMapper::new(&project());
        assert_eq!(
            mapper.module_name(Path::new("/repo/pkg/a.py"), Language::Python),
            "pkg.a"
        );
        assert_eq!(
            mapper.module_name(Path::new("/repo/pkg/__init__.py"), Language::Python),
            "pkg"
        );
        assert_eq!(
            mapper.module_name(Path::new("/repo/src/util.rs"), Language::Rust),
            "util"
        );
    }

    #[test]
    fn maps_class_hierarchy_with_contains_chain() {
        let mapper = SymbolMapper::new(&project());
        let descriptor = descriptor("/repo/pkg/a.py", Language::Python);
        let mapped = mapper.map_document(&descriptor, &class_with_method());

        let fqns: Vec<&str> = mapped
            .nodes
            .iter()
            .map(|n| n.fully_qualified_name.as_str())
            .collect();
        assert!(fqns.contains(&"pkg.a.A"));
        assert!(fqns.contains(&"pkg.a.A.m"));
        assert!(fqns.contains(&"pkg.a"));

        // Every non-file node hangs off the CONTAINS chain.
        let class = mapped
            .nodes
            .iter()
            .find(|n| n.fully_qualified_name == "pkg.a.A")
            .unwrap();
        let method = mapped
            .nodes
            .iter()
            .find(|n| n.fully_qualified_name == "pkg.a.A.m")
            .unwrap();
        assert!(mapped.edges.iter().any(|e| {
            e.edge_type == EdgeType::Contains && e.source == class.id && e.target == method.id
        }));
        assert_eq!(class.kind, NodeKind::Class);
        assert_eq!(method.kind, NodeKind::Method);
    }

    #[test]
    fn mapping_is_deterministic() {
        let project = project();
        let mapper_a = SymbolMapper::new(&project);
        let mapper_b = SymbolMapper::new(&project);
        let descriptor = descriptor("/repo/pkg/a.py", Language::Python);

        let first = mapper_a.map_document(&descriptor, &class_with_method());
        let second = mapper_b.map_document(&descriptor, &class_with_method());

        let ids_a: Vec<&str> = first.nodes.iter().map(|n| n.id.as_str()).collect();
        let ids_b: Vec<&str> = second.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn top_level_module_symbols_become_imports() {
        let mapper = SymbolMapper::new(&project());
        let descriptor = descriptor("/repo/pkg/b.py", Language::Python);
        let symbols = vec![DocumentSymbol {
            name: "pkg.a".into(),
            detail: None,
            kind: symbol_kind::MODULE,
            range: LspRange::default(),
            selection_range: LspRange::default(),
            children: None,
        }];
        let mapped = mapper.map_document(&descriptor, &symbols);
        assert_eq!(mapped.imports.len(), 1);
        assert_eq!(mapped.imports[0].1, "pkg.a");
        // The import is an edge candidate, not a node.
        assert!(!mapped.nodes.iter().any(|n| n.fully_qualified_name == "pkg.b.pkg.a"));
    }

    #[test]
    fn reference_edges_use_calls_for_callables() {
        let project = project();
        let mapper = SymbolMapper::new(&project);
        let registry = SymbolRegistry::new();

        let a_descriptor = descriptor("/repo/pkg/a.py", Language::Python);
        let mapped_a = mapper.map_document(&a_descriptor, &class_with_method());
        registry.insert_file(&path_to_uri(Path::new("/repo/pkg/a.py")), mapped_a.symbols.clone());

        let b_uri = path_to_uri(Path::new("/repo/pkg/b.py"));
        let b_descriptor = descriptor("/repo/pkg/b.py", Language::Python);
        let mapped_b = mapper.map_document(&b_descriptor, &[]);
        registry.insert_file(&b_uri, mapped_b.symbols.clone());

        let method = mapped_a
            .symbols
            .iter()
            .find(|s| s.fully_qualified_name == "pkg.a.A.m")
            .unwrap();
        let class = mapped_a
            .symbols
            .iter()
            .find(|s| s.fully_qualified_name == "pkg.a.A")
            .unwrap();

        let locations = vec![LspLocation {
            uri: b_uri.clone(),
            range: LspRange::default(),
        }];

        let call_edges = mapper.reference_edges(method, &locations, &registry);
        assert_eq!(call_edges.len(), 1);
        assert_eq!(call_edges[0].edge_type, EdgeType::Calls);

        let ref_edges = mapper.reference_edges(class, &locations, &registry);
        assert_eq!(ref_edges.len(), 1);
        assert_eq!(ref_edges[0].edge_type, EdgeType::References);
    }

    #[test]
    fn references_outside_project_are_suppressed() {
        let mapper = SymbolMapper::new(&project());
        let registry = SymbolRegistry::new();
        let a_descriptor = descriptor("/repo/pkg/a.py", Language::Python);
        let mapped = mapper.map_document(&a_descriptor, &class_with_method());
        let class = mapped
            .symbols
            .iter()
            .find(|s| s.fully_qualified_name == "pkg.a.A")
            .unwrap();

        let outside = vec![LspLocation {
            uri: "file:///usr/lib/python3/site-packages/x.py".into(),
            range: LspRange::default(),
        }];
        assert!(mapper.reference_edges(class, &outside, &registry).is_empty());
    }

    #[test]
    fn implementation_edge_kind_follows_target() {
        let project = project();
        let mapper = SymbolMapper::new(&project);
        let registry = SymbolRegistry::new();

        let uri = path_to_uri(Path::new("/repo/pkg/impl.py"));
        let impl_descriptor = descriptor("/repo/pkg/impl.py", Language::Python);
        let mapped = mapper.map_document(&impl_descriptor, &class_with_method());
        registry.insert_file(&uri, mapped.symbols.clone());

        let base_class = RegisteredSymbol {
            node_id: "base".into(),
            kind: NodeKind::Class,
            name: "Base".into(),
            fully_qualified_name: "pkg.base.Base".into(),
            uri: path_to_uri(Path::new("/repo/pkg/base.py")),
            range: SourceRange::default(),
            selection: LspPosition::default(),
        };
        let interface = RegisteredSymbol {
            node_id: "iface".into(),
            kind: NodeKind::Interface,
            ..base_class.clone()
        };

        let locations = vec![LspLocation {
            uri,
            range: LspRange {
                start: LspPosition { line: 0, character: 2 },
                end: LspPosition { line: 0, character: 3 },
            },
        }];

        let inherit = mapper.implementation_edges(&base_class, &locations, &registry);
        assert_eq!(inherit[0].edge_type, EdgeType::InheritsFrom);
        let implement = mapper.implementation_edges(&interface, &locations, &registry);
        assert_eq!(implement[0].edge_type, EdgeType::Implements);
    }

    #[test]
    fn resolve_imports_builds_edges() {
        let project = project();
        let mapper = SymbolMapper::new(&project);
        let registry = SymbolRegistry::new();

        let a_uri = path_to_uri(Path::new("/repo/pkg/a.py"));
        let a_descriptor = descriptor("/repo/pkg/a.py", Language::Python);
        let mapped_a = mapper.map_document(&a_descriptor, &[]);
        registry.insert_file(&a_uri, mapped_a.symbols.clone());

        let module_b: NodeId = "module-b".into();
        let edges = mapper.resolve_imports(
            &[(module_b.clone(), "pkg.a".into()), (module_b.clone(), "os".into())],
            &registry,
        );
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, EdgeType::Imports);
        assert_eq!(edges[0].source, module_b);
    }
}
