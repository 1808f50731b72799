use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// File stem used for every job's source file inside its working directory.
/// Java submissions must therefore declare `public class script`.
const SOURCE_STEM: &str = "script";

fn default_compile_timeout_secs() -> u64 {
    60
}

/// One row of the language table. Command templates may reference
/// `{source}` (the source file name) and `{binary}` (the file stem).
/// Adding a language is a config edit, not new control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub name: String,
    pub extension: String,
    #[serde(default)]
    pub compile: Option<String>,
    pub run: String,
    #[serde(default = "default_compile_timeout_secs")]
    pub compile_timeout_secs: u64,
}

/// The language table shipped by default, matching the interpreters and
/// compilers the service has always accepted.
pub fn default_languages() -> Vec<LanguageSpec> {
    vec![
        LanguageSpec {
            name: "python".into(),
            extension: "py".into(),
            compile: None,
            run: "python3 {source}".into(),
            compile_timeout_secs: default_compile_timeout_secs(),
        },
        LanguageSpec {
            name: "c".into(),
            extension: "c".into(),
            compile: Some("gcc {source} -o {binary}".into()),
            run: "./{binary}".into(),
            compile_timeout_secs: 30,
        },
        LanguageSpec {
            name: "cpp".into(),
            extension: "cpp".into(),
            compile: Some("g++ {source} -o {binary}".into()),
            run: "./{binary}".into(),
            compile_timeout_secs: 60,
        },
        LanguageSpec {
            name: "java".into(),
            extension: "java".into(),
            compile: Some("javac {source}".into()),
            run: "java {binary}".into(),
            compile_timeout_secs: 60,
        },
        LanguageSpec {
            name: "sh".into(),
            extension: "sh".into(),
            compile: None,
            run: "bash {source}".into(),
            compile_timeout_secs: default_compile_timeout_secs(),
        },
    ]
}

/// Commands resolved for one job, with templates already rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedToolchain {
    pub language: String,
    pub file_name: String,
    pub compile_command: Option<String>,
    pub run_command: String,
    pub compile_timeout: Duration,
}

/// Pure language-name → command mapping. No side effects.
#[derive(Debug, Clone)]
pub struct Toolchain {
    specs: Vec<LanguageSpec>,
}

impl Toolchain {
    pub fn new(specs: Vec<LanguageSpec>) -> Self {
        Self { specs }
    }

    pub fn resolve(&self, language: &str) -> Result<ResolvedToolchain> {
        let name = language.trim().to_ascii_lowercase();
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| EngineError::UnsupportedLanguage(name.clone()))?;

        let file_name = format!("{SOURCE_STEM}.{}", spec.extension);
        let render = |template: &str| {
            template
                .replace("{source}", &file_name)
                .replace("{binary}", SOURCE_STEM)
        };

        Ok(ResolvedToolchain {
            language: spec.name.clone(),
            file_name: file_name.clone(),
            compile_command: spec.compile.as_deref().map(render),
            run_command: render(&spec.run),
            compile_timeout: Duration::from_secs(spec.compile_timeout_secs),
        })
    }

    /// Heuristic language detection for submissions with no declared
    /// language: shebang first, then keyword patterns.
    pub fn detect(&self, source: &str) -> Option<&'static str> {
        let source = source.trim_start();

        if source.starts_with("#!/bin/bash") || source.starts_with("#!/bin/sh") {
            return Some("sh");
        }
        if source.starts_with("#!/usr/bin/python") || source.starts_with("#!/usr/bin/env python") {
            return Some("python");
        }

        if ["import ", "def ", "print(", "if __name__"]
            .iter()
            .any(|kw| source.contains(kw))
        {
            return Some("python");
        }
        if ["#include", "int main", "printf", "cout"]
            .iter()
            .any(|kw| source.contains(kw))
        {
            return if source.contains("cout") || source.contains("std::") {
                Some("cpp")
            } else {
                Some("c")
            };
        }
        if ["public class", "public static void main", "System.out"]
            .iter()
            .any(|kw| source.contains(kw))
        {
            return Some("java");
        }
        if ["echo", "cd ", "ls ", "mkdir"].iter().any(|kw| source.contains(kw)) {
            return Some("sh");
        }

        None
    }
}
