//! Job-scoped in-memory index of discovered symbols.
//!
//! Stores ids plus metadata only, never cross-pointers, so the cyclic
//! reference graph lives exclusively in the store. Writers are exclusive
//! per uri; reads across uris are unsynchronized.

use crate::graph::model::{CodeNode, NodeId, NodeKind, SourceRange};
use crate::lsp::types::LspPosition;
use dashmap::DashMap;

/// Metadata the registry keeps per discovered symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSymbol {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub fully_qualified_name: String,
    pub uri: String,
    pub range: SourceRange,
    /// Position used for `references`/`implementation` queries.
    pub selection: LspPosition,
}

impl RegisteredSymbol {
    /// Lift a stored node back into registry form (used on resume, when the
    /// registry is rebuilt from the graph store).
    pub fn from_node(node: &CodeNode) -> Self {
        Self {
            node_id: node.id.clone(),
            kind: node.kind,
            name: node.name.clone(),
            fully_qualified_name: node.fully_qualified_name.clone(),
            uri: node.uri.clone(),
            range: node.range,
            selection: LspPosition {
                line: node.range.start_line,
                character: node.range.start_char,
            },
        }
    }
}

/// Concurrent symbol index keyed by node id, uri, and qualified name.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    by_id: DashMap<NodeId, RegisteredSymbol>,
    by_uri: DashMap<String, Vec<NodeId>>,
    by_fqn: DashMap<String, NodeId>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the symbol set for one uri. One writer per uri at a time.
    pub fn insert_file(&self, uri: &str, symbols: Vec<RegisteredSymbol>) {
        let ids: Vec<NodeId> = symbols.iter().map(|s| s.node_id.clone()).collect();
        for symbol in symbols {
            self.by_fqn
                .insert(symbol.fully_qualified_name.clone(), symbol.node_id.clone());
            self.by_id.insert(symbol.node_id.clone(), symbol);
        }
        self.by_uri.insert(uri.to_string(), ids);
    }

    pub fn get(&self, node_id: &str) -> Option<RegisteredSymbol> {
        self.by_id.get(node_id).map(|entry| entry.clone())
    }

    pub fn contains_uri(&self, uri: &str) -> bool {
        self.by_uri.contains_key(uri)
    }

    pub fn symbols_for_uri(&self, uri: &str) -> Vec<RegisteredSymbol> {
        let Some(ids) = self.by_uri.get(uri) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id).map(|entry| entry.clone()))
            .collect()
    }

    /// The narrowest symbol in `uri` whose range contains `position`,
    /// falling back to the file's module node for module-scope positions.
    pub fn enclosing(&self, uri: &str, position: LspPosition) -> Option<RegisteredSymbol> {
        let position = crate::graph::model::Position {
            line: position.line,
            character: position.character,
        };
        let symbols = self.symbols_for_uri(uri);
        symbols
            .iter()
            .filter(|symbol| symbol.range.contains(position))
            .min_by_key(|symbol| symbol.range.extent())
            .cloned()
            .or_else(|| symbols.into_iter().find(|s| s.kind == NodeKind::Module))
    }

    /// Resolve a qualified name exactly.
    pub fn resolve_fqn(&self, fqn: &str) -> Option<NodeId> {
        self.by_fqn.get(fqn).map(|entry| entry.clone())
    }

    /// Resolve an import-like name: exact qualified match first, then a
    /// unique module whose qualified name ends with `.name`.
    pub fn resolve_import(&self, name: &str) -> Option<NodeId> {
        if let Some(id) = self.resolve_fqn(name) {
            return Some(id);
        }
        let suffix = format!(".{}", name);
        let mut matches = self.by_fqn.iter().filter_map(|entry| {
            let id = entry.value();
            let symbol = self.by_id.get(id)?;
            (symbol.kind == NodeKind::Module && entry.key().ends_with(&suffix))
                .then(|| id.clone())
        });
        let first = matches.next()?;
        // Ambiguous names resolve to nothing rather than guessing.
        matches.next().is_none().then_some(first)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Discarded at job end.
    pub fn clear(&self) {
        self.by_id.clear();
        self.by_uri.clear();
        self.by_fqn.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol(id: &str, kind: NodeKind, fqn: &str, uri: &str, range: SourceRange) -> RegisteredSymbol {
        RegisteredSymbol {
            node_id: id.to_string(),
            kind,
            name: fqn.rsplit('.').next().unwrap().to_string(),
            fully_qualified_name: fqn.to_string(),
            uri: uri.to_string(),
            range,
            selection: LspPosition {
                line: range.start_line,
                character: range.start_char,
            },
        }
    }

    fn span(start_line: u32, end_line: u32) -> SourceRange {
        SourceRange {
            start_line,
            start_char: 0,
            end_line,
            end_char: 80,
        }
    }

    #[test]
    fn enclosing_picks_narrowest() {
        let registry = SymbolRegistry::new();
        let uri = "file:///repo/pkg/a.py";
        registry.insert_file(
            uri,
            vec![
                symbol("cls", NodeKind::Class, "pkg.a.A", uri, span(0, 10)),
                symbol("method", NodeKind::Method, "pkg.a.A.m", uri, span(2, 4)),
                symbol("module", NodeKind::Module, "pkg.a", uri, span(0, 100)),
            ],
        );

        let hit = registry
            .enclosing(uri, LspPosition { line: 3, character: 4 })
            .unwrap();
        assert_eq!(hit.node_id, "method");

        let outer = registry
            .enclosing(uri, LspPosition { line: 8, character: 0 })
            .unwrap();
        assert_eq!(outer.node_id, "cls");
    }

    #[test]
    fn enclosing_falls_back_to_module_node() {
        let registry = SymbolRegistry::new();
        let uri = "file:///repo/pkg/b.py";
        registry.insert_file(
            uri,
            vec![
                symbol("module", NodeKind::Module, "pkg.b", uri, span(0, 0)),
                symbol("cls", NodeKind::Class, "pkg.b.C", uri, span(5, 9)),
            ],
        );

        // Module-scope position outside any symbol range.
        let hit = registry
            .enclosing(uri, LspPosition { line: 20, character: 0 })
            .unwrap();
        assert_eq!(hit.node_id, "module");
    }

    #[test]
    fn resolve_import_by_suffix() {
        let registry = SymbolRegistry::new();
        let uri = "file:///repo/pkg/a.py";
        registry.insert_file(
            uri,
            vec![symbol("mod-a", NodeKind::Module, "pkg.a", uri, span(0, 100))],
        );

        assert_eq!(registry.resolve_import("pkg.a").as_deref(), Some("mod-a"));
        assert_eq!(registry.resolve_import("a").as_deref(), Some("mod-a"));
        assert_eq!(registry.resolve_import("missing"), None);
    }

    #[test]
    fn reinserting_uri_replaces_symbols() {
        let registry = SymbolRegistry::new();
        let uri = "file:///repo/x.py";
        registry.insert_file(uri, vec![symbol("one", NodeKind::Function, "x.f", uri, span(0, 1))]);
        registry.insert_file(uri, vec![symbol("two", NodeKind::Function, "x.g", uri, span(0, 1))]);

        let symbols = registry.symbols_for_uri(uri);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].node_id, "two");
    }

    #[test]
    fn clear_empties_everything() {
        let registry = SymbolRegistry::new();
        let uri = "file:///repo/x.py";
        registry.insert_file(uri, vec![symbol("one", NodeKind::Function, "x.f", uri, span(0, 1))]);
        assert_eq!(registry.len(), 1);
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.symbols_for_uri(uri).is_empty());
    }
}
