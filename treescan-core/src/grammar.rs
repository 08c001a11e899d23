//! Grammar registry: file extension → language tag + tree-sitter grammar

use crate::error::ScanError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tree_sitter::Language;

/// Builds the native grammar. Called at most once per registered grammar.
pub type LanguageLoader = fn() -> Language;

/// One registered grammar
pub struct Grammar {
    ext: String,
    lang: String,
    loader: LanguageLoader,
    language: OnceLock<Language>,
}

impl Grammar {
    fn new(ext: &str, lang: &str, loader: LanguageLoader) -> Self {
        Self {
            ext: ext.to_string(),
            lang: lang.to_string(),
            loader,
            language: OnceLock::new(),
        }
    }

    /// Language tag recorded on chunks (e.g. "python")
    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn extension(&self) -> &str {
        &self.ext
    }

    /// The tree-sitter language, built on first use.
    pub fn language(&self) -> &Language {
        self.language.get_or_init(self.loader)
    }
}

impl std::fmt::Debug for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grammar")
            .field("ext", &self.ext)
            .field("lang", &self.lang)
            .field("loaded", &self.language.get().is_some())
            .finish()
    }
}

/// Maps file extensions to grammars. Each extension resolves to exactly one
/// language. Build it once, then share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct GrammarRegistry {
    by_ext: HashMap<String, Grammar>,
}

fn python() -> Language {
    tree_sitter_python::LANGUAGE.into()
}
fn javascript() -> Language {
    tree_sitter_javascript::LANGUAGE.into()
}
fn typescript() -> Language {
    tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
}
fn tsx() -> Language {
    tree_sitter_typescript::LANGUAGE_TSX.into()
}
fn go() -> Language {
    tree_sitter_go::LANGUAGE.into()
}
fn rust() -> Language {
    tree_sitter_rust::LANGUAGE.into()
}

impl GrammarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in languages
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("py", "python", python);
        registry.register("js", "javascript", javascript);
        registry.register("ts", "typescript", typescript);
        registry.register("tsx", "tsx", tsx);
        registry.register("go", "go", go);
        registry.register("rs", "rust", rust);
        registry
    }

    /// Register (or replace) the grammar for an extension, given without the dot.
    pub fn register(&mut self, ext: &str, lang: &str, loader: LanguageLoader) {
        let ext = ext.trim_start_matches('.');
        self.by_ext
            .insert(ext.to_string(), Grammar::new(ext, lang, loader));
    }

    pub fn resolve_ext(&self, ext: &str) -> Option<&Grammar> {
        self.by_ext.get(ext)
    }

    /// Grammar for a path, by its extension
    pub fn resolve(&self, path: &Path) -> Option<&Grammar> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| self.resolve_ext(e))
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }

    /// Registered extensions, sorted
    pub fn extensions(&self) -> Vec<&str> {
        let mut exts: Vec<&str> = self.by_ext.keys().map(String::as_str).collect();
        exts.sort_unstable();
        exts
    }

    pub fn len(&self) -> usize {
        self.by_ext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ext.is_empty()
    }

    /// Load every grammar and check it against the tree-sitter runtime ABI.
    /// Idempotent; safe to call from several threads.
    pub fn warm(&self) -> crate::Result<()> {
        let mut parser = tree_sitter::Parser::new();
        for grammar in self.by_ext.values() {
            parser
                .set_language(grammar.language())
                .map_err(|e| ScanError::Grammar {
                    lang: grammar.lang.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}
