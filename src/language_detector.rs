//! Path to language-id mapping.
//!
//! Resolution order: exact filename table, extension table, then a shebang
//! probe for extensionless files. Binary or unsupported files come back as
//! `Unknown` and the walker excludes them unless the name is in the config
//! table.

use crate::graph::model::NodeKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    TypeScript,
    JavaScript,
    Python,
    Go,
    Java,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Unknown,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Go => "go",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Unknown => "unknown",
        }
    }

    /// Identifier sent in `textDocument/didOpen`.
    pub fn lsp_id(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            other => other.as_str(),
        }
    }
}

pub struct LanguageDetector {
    filename_map: HashMap<&'static str, Language>,
    extension_map: HashMap<&'static str, Language>,
    config_map: HashMap<&'static str, &'static str>,
    shebang_patterns: Vec<(Regex, Language)>,
}

impl Default for LanguageDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageDetector {
    pub fn new() -> Self {
        let filename_map: HashMap<&'static str, Language> = [
            ("__init__.py", Language::Python),
            ("mod.rs", Language::Rust),
            ("build.rs", Language::Rust),
            ("conftest.py", Language::Python),
            ("Rakefile", Language::Ruby),
        ]
        .into_iter()
        .collect();

        let extension_map: HashMap<&'static str, Language> = [
            ("rs", Language::Rust),
            ("ts", Language::TypeScript),
            ("tsx", Language::TypeScript),
            ("js", Language::JavaScript),
            ("jsx", Language::JavaScript),
            ("mjs", Language::JavaScript),
            ("cjs", Language::JavaScript),
            ("py", Language::Python),
            ("pyw", Language::Python),
            ("pyi", Language::Python),
            ("go", Language::Go),
            ("java", Language::Java),
            ("c", Language::C),
            ("h", Language::C),
            ("cpp", Language::Cpp),
            ("cc", Language::Cpp),
            ("cxx", Language::Cpp),
            ("hpp", Language::Cpp),
            ("hxx", Language::Cpp),
            ("cs", Language::CSharp),
            ("rb", Language::Ruby),
            ("rake", Language::Ruby),
            ("php", Language::Php),
            ("phtml", Language::Php),
        ]
        .into_iter()
        .collect();

        // Filename -> config_type for files stored as Config nodes.
        let config_map: HashMap<&'static str, &'static str> = [
            ("package.json", "npm"),
            ("package-lock.json", "npm"),
            ("tsconfig.json", "typescript"),
            ("Cargo.toml", "cargo"),
            ("Cargo.lock", "cargo"),
            ("pyproject.toml", "python"),
            ("setup.py", "python"),
            ("requirements.txt", "python"),
            ("Dockerfile", "docker"),
            ("docker-compose.yml", "docker"),
            ("docker-compose.yaml", "docker"),
            ("go.mod", "go"),
            ("go.sum", "go"),
            ("pom.xml", "maven"),
            ("build.gradle", "gradle"),
            ("build.gradle.kts", "gradle"),
            ("Makefile", "make"),
            ("Gemfile", "ruby"),
            ("composer.json", "php"),
        ]
        .into_iter()
        .collect();

        let shebang_patterns = vec![
            (Regex::new(r"^#!/.*\bpython").unwrap(), Language::Python),
            (Regex::new(r"^#!/.*\bnode").unwrap(), Language::JavaScript),
            (Regex::new(r"^#!/.*\bruby").unwrap(), Language::Ruby),
            (Regex::new(r"^#!/.*\bphp").unwrap(), Language::Php),
        ];

        Self {
            filename_map,
            extension_map,
            config_map,
            shebang_patterns,
        }
    }

    /// Map a path to its language id. Never touches the filesystem unless
    /// the file is extensionless (shebang probe).
    pub fn detect(&self, path: &Path) -> Language {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(&lang) = self.filename_map.get(name) {
                return lang;
            }
        }

        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            return self
                .extension_map
                .get(ext)
                .copied()
                .unwrap_or(Language::Unknown);
        }

        self.detect_from_shebang(path).unwrap_or(Language::Unknown)
    }

    /// The `config_type` attribute when the filename is a known
    /// configuration file, e.g. `package.json` -> `npm`.
    pub fn config_type(&self, path: &Path) -> Option<&'static str> {
        let name = path.file_name()?.to_str()?;
        self.config_map.get(name).copied()
    }

    /// Node kind the walker assigns this file: `Config` for entries in the
    /// config table, `File` otherwise.
    pub fn file_kind(&self, path: &Path) -> NodeKind {
        if self.config_type(path).is_some() {
            NodeKind::Config
        } else {
            NodeKind::File
        }
    }

    fn detect_from_shebang(&self, path: &Path) -> Option<Language> {
        let mut head = [0u8; 256];
        let mut file = File::open(path).ok()?;
        let n = file.read(&mut head).ok()?;
        let first_line = std::str::from_utf8(&head[..n]).ok()?.lines().next()?;
        self.shebang_patterns
            .iter()
            .find(|(pattern, _)| pattern.is_match(first_line))
            .map(|(_, lang)| *lang)
    }
}
