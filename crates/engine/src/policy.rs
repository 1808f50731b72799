use regex::Regex;

use crate::config::SecurityConfig;
use crate::error::{EngineError, Result};

/// How a denylisted token is matched against source text.
#[derive(Debug)]
enum Matcher {
    /// Word-boundary regex, for tokens that are plain identifiers.
    Word(Regex),
    /// Literal substring, for tokens containing shell punctuation.
    Substring(String),
}

#[derive(Debug)]
struct Rule {
    matcher: Matcher,
    reason: String,
}

impl Rule {
    fn word(pattern: &str, reason: impl Into<String>) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| EngineError::Internal(format!("policy pattern {pattern:?}: {e}")))?;
        Ok(Self {
            matcher: Matcher::Word(regex),
            reason: reason.into(),
        })
    }

    fn matches(&self, source: &str) -> bool {
        match &self.matcher {
            Matcher::Word(regex) => regex.is_match(source),
            Matcher::Substring(token) => source.contains(token.as_str()),
        }
    }
}

/// Static pre-execution source scan. Textual and heuristic only: the goal
/// is to make trivial abuse expensive, not to prove a script safe. Runs
/// synchronously before any process exists; input size is already bounded
/// by the Quota Tracker.
#[derive(Debug)]
pub struct PolicyGate {
    blocked_commands: Vec<Rule>,
    python_imports: Vec<Rule>,
    python_calls: Vec<Rule>,
    c_functions: Vec<Rule>,
    java_patterns: Vec<Rule>,
    shell_patterns: Vec<Rule>,
}

impl PolicyGate {
    pub fn new(security: &SecurityConfig) -> Result<Self> {
        let mut blocked_commands = Vec::with_capacity(security.blocked_commands.len());
        for token in &security.blocked_commands {
            blocked_commands.push(command_rule(token)?);
        }

        let mut python_imports = Vec::with_capacity(security.blocked_imports.len());
        for module in &security.blocked_imports {
            let escaped = regex::escape(module);
            python_imports.push(Rule::word(
                &format!(r"(?m)^\s*(?:import|from)\s+{escaped}\b"),
                format!("blocked import '{module}'"),
            )?);
        }

        let mut python_calls = Vec::new();
        for call in ["eval", "exec", "__import__"] {
            python_calls.push(Rule::word(
                &format!(r"\b{call}\s*\("),
                format!("blocked call '{call}'"),
            )?);
        }
        for method in ["system", "popen", "spawn"] {
            python_calls.push(Rule::word(
                &format!(r"\.\s*{method}\s*\("),
                format!("blocked method call '{method}'"),
            )?);
        }

        let mut c_functions = Vec::new();
        for func in [
            "system", "exec", "execl", "execv", "execve", "popen", "fork", "gets", "strcpy",
            "strcat", "sprintf",
        ] {
            c_functions.push(Rule::word(
                &format!(r"\b{func}\s*\("),
                format!("dangerous function '{func}'"),
            )?);
        }

        let java_patterns = vec![
            Rule::word(
                r"Runtime\s*\.\s*getRuntime\s*\(\s*\)\s*\.\s*exec",
                "blocked call 'Runtime.getRuntime().exec'",
            )?,
            Rule::word(r"\bProcessBuilder\b", "blocked class 'ProcessBuilder'")?,
            Rule::word(r"System\s*\.\s*exit", "blocked call 'System.exit'")?,
            Rule::word(r"\bFiles?\s*\.\s*delete", "blocked file deletion call")?,
        ];

        let shell_patterns = vec![
            Rule::word(r">\s*/dev/tcp/", "network redirection via /dev/tcp")?,
            Rule::word(r">\s*/dev/udp/", "network redirection via /dev/udp")?,
        ];

        Ok(Self {
            blocked_commands,
            python_imports,
            python_calls,
            c_functions,
            java_patterns,
            shell_patterns,
        })
    }

    /// Scan `source`, stopping at the first violation. The returned error
    /// names that violation and nothing else: rejection stays cheap and
    /// predictable regardless of how bad the rest of the script is.
    pub fn evaluate(&self, source: &str, language: &str) -> Result<()> {
        for rule in &self.blocked_commands {
            if rule.matches(source) {
                return Err(EngineError::PolicyViolation(rule.reason.clone()));
            }
        }

        let mut rule_sets: Vec<&[Rule]> = Vec::new();
        match language {
            "python" => {
                rule_sets.push(&self.python_imports);
                rule_sets.push(&self.python_calls);
            }
            "c" | "cpp" => rule_sets.push(&self.c_functions),
            "java" => rule_sets.push(&self.java_patterns),
            "sh" => rule_sets.push(&self.shell_patterns),
            _ => {}
        }
        for rules in rule_sets {
            for rule in rules {
                if rule.matches(source) {
                    return Err(EngineError::PolicyViolation(rule.reason.clone()));
                }
            }
        }

        Ok(())
    }
}

/// A configured token becomes a word-boundary rule when it is a plain
/// identifier, otherwise a literal substring rule (fork bombs and friends).
fn command_rule(token: &str) -> Result<Rule> {
    let is_word = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if is_word {
        let escaped = regex::escape(token);
        Rule::word(
            &format!(r"\b{escaped}\b"),
            format!("blocked command '{token}'"),
        )
    } else {
        Ok(Rule {
            matcher: Matcher::Substring(token.to_string()),
            reason: format!("blocked command '{token}'"),
        })
    }
}
