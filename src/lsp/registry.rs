//! Launch specifications for supported language servers.
//!
//! Built-in specs cover the common toolchains; callers can register or
//! override entries before the pool starts spawning.

use crate::language_detector::Language;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How to launch and initialize one language server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub language: Language,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_params: Option<Value>,
    #[serde(default)]
    pub root_markers: Vec<String>,
}

/// Registry of launch specs keyed by language.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    specs: HashMap<Language, ServerSpec>,
}

impl LanguageRegistry {
    /// Registry pre-populated with the built-in server set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();

        registry.register(ServerSpec {
            language: Language::Python,
            command: "pylsp".into(),
            args: vec![],
            env: vec![],
            init_params: None,
            root_markers: vec![
                "pyproject.toml".into(),
                "setup.py".into(),
                "requirements.txt".into(),
            ],
        });

        registry.register(ServerSpec {
            language: Language::Rust,
            command: "rust-analyzer".into(),
            args: vec![],
            env: vec![],
            init_params: Some(serde_json::json!({
                "cargo": { "buildScripts": { "enable": true } },
                "checkOnSave": { "enable": false },
            })),
            root_markers: vec!["Cargo.toml".into()],
        });

        registry.register(ServerSpec {
            language: Language::TypeScript,
            command: "typescript-language-server".into(),
            args: vec!["--stdio".into()],
            env: vec![],
            init_params: None,
            root_markers: vec!["package.json".into(), "tsconfig.json".into()],
        });

        registry.register(ServerSpec {
            language: Language::JavaScript,
            command: "typescript-language-server".into(),
            args: vec!["--stdio".into()],
            env: vec![],
            init_params: None,
            root_markers: vec!["package.json".into(), "jsconfig.json".into()],
        });

        registry.register(ServerSpec {
            language: Language::Go,
            command: "gopls".into(),
            args: vec!["serve".into(), "-mode=stdio".into()],
            env: vec![],
            init_params: Some(serde_json::json!({
                "expandWorkspaceToModule": true,
                "symbolScope": "workspace",
                "staticcheck": false,
            })),
            root_markers: vec!["go.mod".into(), "go.work".into()],
        });

        registry.register(ServerSpec {
            language: Language::Java,
            command: "jdtls".into(),
            args: vec![],
            env: vec![],
            init_params: None,
            root_markers: vec!["pom.xml".into(), "build.gradle".into()],
        });

        registry.register(ServerSpec {
            language: Language::C,
            command: "clangd".into(),
            args: vec![],
            env: vec![],
            init_params: None,
            root_markers: vec!["compile_commands.json".into(), "Makefile".into()],
        });

        registry.register(ServerSpec {
            language: Language::Cpp,
            command: "clangd".into(),
            args: vec![],
            env: vec![],
            init_params: None,
            root_markers: vec!["compile_commands.json".into(), "CMakeLists.txt".into()],
        });

        registry
    }

    pub fn register(&mut self, spec: ServerSpec) {
        self.specs.insert(spec.language, spec);
    }

    pub fn get(&self, language: Language) -> Option<&ServerSpec> {
        self.specs.get(&language)
    }

    pub fn supports(&self, language: Language) -> bool {
        self.specs.contains_key(&language)
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.specs.keys().copied().collect();
        languages.sort_by_key(|l| l.as_str());
        languages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_core_languages() {
        let registry = LanguageRegistry::with_builtins();
        assert!(registry.supports(Language::Python));
        assert!(registry.supports(Language::Rust));
        assert!(registry.supports(Language::TypeScript));
        assert!(!registry.supports(Language::Unknown));
        assert_eq!(registry.get(Language::Python).unwrap().command, "pylsp");
    }

    #[test]
    fn register_overrides_builtin() {
        let mut registry = LanguageRegistry::with_builtins();
        registry.register(ServerSpec {
            language: Language::Python,
            command: "jedi-language-server".into(),
            args: vec![],
            env: vec![],
            init_params: None,
            root_markers: vec![],
        });
        assert_eq!(
            registry.get(Language::Python).unwrap().command,
            "jedi-language-server"
        );
    }
}
