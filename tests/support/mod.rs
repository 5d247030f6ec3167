//! Shared scaffolding for integration tests: a scripted symbol source that
//! stands in for the language server pool, plus project fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use codegraphd::lsp::types::{DocumentSymbol, LspLocation, LspPosition, LspRange};
use codegraphd::lsp::SymbolSource;
use codegraphd::{
    AnalysisConfig, JobRegistry, Language, LanguageDetector, LspError, MemoryGraphStore, Project,
    SourceType, SubscriptionBroker,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted behavior for one file.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFile {
    pub symbols: Vec<DocumentSymbol>,
    /// References keyed by the queried symbol's name.
    pub references: HashMap<String, Vec<LspLocation>>,
    /// Implementations keyed by the queried symbol's name.
    pub implementations: HashMap<String, Vec<LspLocation>>,
}

/// A `SymbolSource` that replays scripted results, optionally failing a
/// file a configured number of times (poison simulation) and delaying each
/// call (to make cancellation windows deterministic).
#[derive(Default)]
pub struct ScriptedSource {
    files: Mutex<HashMap<PathBuf, ScriptedFile>>,
    fail_remaining: Mutex<HashMap<PathBuf, u32>>,
    delay: Option<Duration>,
    document_symbol_calls: AtomicU32,
    reference_calls: AtomicU32,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn script_file(&self, path: impl Into<PathBuf>, file: ScriptedFile) {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), file);
    }

    /// Make `documentSymbol` fail `failures` times for this file.
    pub fn poison(&self, path: impl Into<PathBuf>, failures: u32) {
        self.fail_remaining
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), failures);
    }

    pub fn document_symbol_calls(&self) -> u32 {
        self.document_symbol_calls.load(Ordering::Relaxed)
    }

    pub fn reference_calls(&self) -> u32 {
        self.reference_calls.load(Ordering::Relaxed)
    }

    fn file(&self, path: &Path) -> Option<ScriptedFile> {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    fn symbol_name_at(symbols: &[DocumentSymbol], position: LspPosition) -> Option<String> {
        for symbol in symbols {
            if symbol.selection_range.start == position || symbol.range.start == position {
                return Some(symbol.name.clone());
            }
            if let Some(children) = &symbol.children {
                if let Some(name) = Self::symbol_name_at(children, position) {
                    return Some(name);
                }
            }
        }
        None
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SymbolSource for ScriptedSource {
    async fn document_symbols(
        &self,
        _language: Language,
        _workspace: &Path,
        file: &Path,
    ) -> Result<Vec<DocumentSymbol>, LspError> {
        self.pause().await;
        self.document_symbol_calls.fetch_add(1, Ordering::Relaxed);

        {
            let mut failures = self.fail_remaining.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(remaining) = failures.get_mut(file) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(LspError::Server {
                        code: -32603,
                        message: format!("scripted crash for {:?}", file),
                    });
                }
            }
        }

        Ok(self.file(file).map(|f| f.symbols).unwrap_or_default())
    }

    async fn references(
        &self,
        _language: Language,
        _workspace: &Path,
        file: &Path,
        position: LspPosition,
    ) -> Result<Vec<LspLocation>, LspError> {
        self.pause().await;
        self.reference_calls.fetch_add(1, Ordering::Relaxed);
        let Some(scripted) = self.file(file) else {
            return Ok(Vec::new());
        };
        let Some(name) = Self::symbol_name_at(&scripted.symbols, position) else {
            return Ok(Vec::new());
        };
        Ok(scripted.references.get(&name).cloned().unwrap_or_default())
    }

    async fn implementations(
        &self,
        _language: Language,
        _workspace: &Path,
        file: &Path,
        position: LspPosition,
    ) -> Result<Vec<LspLocation>, LspError> {
        self.pause().await;
        let Some(scripted) = self.file(file) else {
            return Ok(Vec::new());
        };
        let Some(name) = Self::symbol_name_at(&scripted.symbols, position) else {
            return Ok(Vec::new());
        };
        Ok(scripted
            .implementations
            .get(&name)
            .cloned()
            .unwrap_or_default())
    }

    fn language_available(&self, _language: Language) -> bool {
        true
    }

    async fn cancel_inflight(&self) {}

    async fn shutdown(&self, _grace: Duration) {}
}

/// Symbol with the convention `range.start == selection_range.start`, so
/// scripted lookups keep working when the registry is rebuilt from the
/// store after a resume.
pub fn symbol(
    name: &str,
    kind: u32,
    start: (u32, u32),
    end: (u32, u32),
    children: Vec<DocumentSymbol>,
) -> DocumentSymbol {
    let range = LspRange {
        start: LspPosition {
            line: start.0,
            character: start.1,
        },
        end: LspPosition {
            line: end.0,
            character: end.1,
        },
    };
    DocumentSymbol {
        name: name.to_string(),
        detail: None,
        kind,
        range,
        selection_range: LspRange {
            start: range.start,
            end: LspPosition {
                line: start.0,
                character: start.1 + name.len() as u32,
            },
        },
        children: if children.is_empty() {
            None
        } else {
            Some(children)
        },
    }
}

pub fn location(uri: &str, line: u32, character: u32) -> LspLocation {
    LspLocation {
        uri: uri.to_string(),
        range: LspRange {
            start: LspPosition { line, character },
            end: LspPosition {
                line,
                character: character + 1,
            },
        },
    }
}

pub fn file_uri(path: &Path) -> String {
    codegraphd::lsp::client::path_to_uri(path)
}

/// Everything a pipeline test needs, wired the way `main` wires it.
pub struct TestEnv {
    pub config: Arc<AnalysisConfig>,
    pub store: Arc<MemoryGraphStore>,
    pub broker: Arc<SubscriptionBroker>,
    pub registry: Arc<JobRegistry>,
    pub project: Project,
}

pub fn test_config() -> AnalysisConfig {
    AnalysisConfig {
        workers: 1,
        batch_interval: Duration::from_millis(25),
        grace: Duration::from_secs(2),
        ..AnalysisConfig::default()
    }
}

pub fn build_env(root: &Path, source: Arc<ScriptedSource>, config: AnalysisConfig) -> TestEnv {
    let config = Arc::new(config);
    let store = Arc::new(MemoryGraphStore::new());
    let broker = Arc::new(SubscriptionBroker::new(
        config.broker_ring,
        config.subscriber_buffer,
    ));
    let detector = Arc::new(LanguageDetector::new());
    let registry = Arc::new(JobRegistry::new(
        config.clone(),
        store.clone(),
        broker.clone(),
        source,
        detector,
    ));
    let project = Project::new("demo", root.to_path_buf(), SourceType::Git);
    registry.register_project(project.clone());
    TestEnv {
        config,
        store,
        broker,
        registry,
        project,
    }
}

/// The S1 fixture: a tiny Python package with a class, a method, and a
/// file that imports and calls them.
pub struct PythonFixture {
    pub init_py: PathBuf,
    pub a_py: PathBuf,
    pub b_py: PathBuf,
}

pub fn write_python_project(root: &Path) -> PythonFixture {
    let pkg = root.join("pkg");
    std::fs::create_dir_all(&pkg).unwrap();
    let init_py = pkg.join("__init__.py");
    let a_py = pkg.join("a.py");
    let b_py = pkg.join("b.py");
    std::fs::write(&init_py, "").unwrap();
    std::fs::write(&a_py, "class A:\n    def m(self):\n        pass\n").unwrap();
    std::fs::write(&b_py, "from pkg.a import A\nA().m()\n").unwrap();
    PythonFixture {
        init_py,
        a_py,
        b_py,
    }
}

/// Script the language-server answers for the S1 fixture.
pub fn script_python_project(source: &ScriptedSource, fixture: &PythonFixture) {
    let b_uri = file_uri(&fixture.b_py);

    source.script_file(&fixture.init_py, ScriptedFile::default());

    let class_a = symbol(
        "A",
        5, // Class
        (0, 6),
        (2, 12),
        vec![symbol("m", 6 /* Method */, (1, 8), (2, 12), vec![])],
    );
    let mut a_file = ScriptedFile {
        symbols: vec![class_a],
        ..Default::default()
    };
    a_file
        .references
        .insert("A".into(), vec![location(&b_uri, 0, 19), location(&b_uri, 1, 0)]);
    a_file
        .references
        .insert("m".into(), vec![location(&b_uri, 1, 6)]);
    source.script_file(&fixture.a_py, a_file);

    // pylsp surfaces the import as a top-level Module symbol.
    let b_file = ScriptedFile {
        symbols: vec![symbol("pkg.a", 2 /* Module */, (0, 16), (0, 21), vec![])],
        ..Default::default()
    };
    source.script_file(&fixture.b_py, b_file);
}
