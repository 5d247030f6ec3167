//! Minimal LSP wire structures used by the pipeline.
//!
//! Only the subset of the protocol the analysis passes consume is modeled;
//! everything else stays as raw `serde_json::Value`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspPosition {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspRange {
    pub start: LspPosition,
    pub end: LspPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspLocation {
    pub uri: String,
    pub range: LspRange,
}

/// Hierarchical result of `textDocument/documentSymbol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSymbol {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub kind: u32,
    pub range: LspRange,
    pub selection_range: LspRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<DocumentSymbol>>,
}

/// Flat result shape some servers return instead of `DocumentSymbol[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInformation {
    pub name: String,
    pub kind: u32,
    pub location: LspLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

impl SymbolInformation {
    /// Lift the flat shape into the hierarchical one (no children).
    pub fn into_document_symbol(self) -> DocumentSymbol {
        DocumentSymbol {
            name: self.name,
            detail: self.container_name,
            kind: self.kind,
            range: self.location.range,
            selection_range: self.location.range,
            children: None,
        }
    }
}

/// LSP `SymbolKind` constants.
pub mod symbol_kind {
    pub const FILE: u32 = 1;
    pub const MODULE: u32 = 2;
    pub const NAMESPACE: u32 = 3;
    pub const PACKAGE: u32 = 4;
    pub const CLASS: u32 = 5;
    pub const METHOD: u32 = 6;
    pub const PROPERTY: u32 = 7;
    pub const FIELD: u32 = 8;
    pub const CONSTRUCTOR: u32 = 9;
    pub const ENUM: u32 = 10;
    pub const INTERFACE: u32 = 11;
    pub const FUNCTION: u32 = 12;
    pub const VARIABLE: u32 = 13;
    pub const CONSTANT: u32 = 14;
    pub const STRING: u32 = 15;
    pub const NUMBER: u32 = 16;
    pub const BOOLEAN: u32 = 17;
    pub const ARRAY: u32 = 18;
    pub const OBJECT: u32 = 19;
    pub const KEY: u32 = 20;
    pub const NULL: u32 = 21;
    pub const ENUM_MEMBER: u32 = 22;
    pub const STRUCT: u32 = 23;
    pub const EVENT: u32 = 24;
    pub const OPERATOR: u32 = 25;
    pub const TYPE_PARAMETER: u32 = 26;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_symbol_round_trip() {
        let json = serde_json::json!({
            "name": "A",
            "kind": 5,
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 3, "character": 0}},
            "selectionRange": {"start": {"line": 0, "character": 6}, "end": {"line": 0, "character": 7}},
            "children": [{
                "name": "m",
                "kind": 6,
                "range": {"start": {"line": 1, "character": 4}, "end": {"line": 2, "character": 0}},
                "selectionRange": {"start": {"line": 1, "character": 8}, "end": {"line": 1, "character": 9}}
            }]
        });
        let symbol: DocumentSymbol = serde_json::from_value(json).unwrap();
        assert_eq!(symbol.kind, symbol_kind::CLASS);
        assert_eq!(symbol.children.as_ref().unwrap()[0].name, "m");
    }

    #[test]
    fn symbol_information_lifts() {
        let info = SymbolInformation {
            name: "helper".into(),
            kind: symbol_kind::FUNCTION,
            location: LspLocation {
                uri: "file:///repo/util.py".into(),
                range: LspRange::default(),
            },
            container_name: None,
        };
        let symbol = info.into_document_symbol();
        assert_eq!(symbol.name, "helper");
        assert!(symbol.children.is_none());
    }
}
