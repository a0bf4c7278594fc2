//! Include/exclude table filtering with SQL-identifier patterns
//!
//! Patterns follow the `namespace.table` form. Each part is either quoted
//! (case preserved, any character allowed, `""` embeds a quote, `\*` `\?`
//! `\+` embed literal wildcards) or unquoted (folded to lowercase, letters,
//! digits, `_` and the wildcards `*` `?` `+`). Wildcards compile to anchored
//! regular expressions. Decisions are cached per canonical table name.

use crate::catalog::TrackedTable;
use crate::error::{Result, StreamerError};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

const MAX_UNQUOTED_LEN: usize = 63;
const MAX_QUOTED_LEN: usize = 65;

/// PostgreSQL reserved keywords; unquoted non-wildcard tokens must not
/// collide with them.
const RESERVED_KEYWORDS: &[&str] = &[
    "ALL", "ANALYSE", "ANALYZE", "AND", "ANY", "ARRAY", "AS", "ASC", "ASYMMETRIC", "BOTH", "CASE",
    "CAST", "CHECK", "COLLATE", "COLUMN", "CONSTRAINT", "CREATE", "CURRENT_CATALOG",
    "CURRENT_DATE", "CURRENT_ROLE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "CURRENT_USER",
    "DEFAULT", "DEFERRABLE", "DESC", "DISTINCT", "DO", "ELSE", "END", "EXCEPT", "FALSE", "FETCH",
    "FOR", "FOREIGN", "FROM", "GRANT", "GROUP", "HAVING", "IN", "INITIALLY", "INTERSECT", "INTO",
    "LATERAL", "LEADING", "LIMIT", "LOCALTIME", "LOCALTIMESTAMP", "NOT", "NULL", "OFFSET", "ON",
    "ONLY", "OR", "ORDER", "PLACING", "PRIMARY", "REFERENCES", "RETURNING", "SELECT",
    "SESSION_USER", "SOME", "SYMMETRIC", "TABLE", "THEN", "TO", "TRAILING", "TRUE", "UNION",
    "UNIQUE", "USER", "USING", "VARIADIC", "WHEN", "WHERE", "WINDOW", "WITH",
];

/// One compiled pattern part
#[derive(Debug)]
enum Token {
    Exact(String),
    Wildcard(Regex),
}

impl Token {
    fn matches(&self, candidate: &str) -> bool {
        match self {
            Token::Exact(literal) => literal == candidate,
            Token::Wildcard(regex) => regex.is_match(candidate),
        }
    }
}

#[derive(Debug)]
struct FilterPattern {
    namespace: Token,
    table: Token,
}

impl FilterPattern {
    fn matches(&self, namespace: &str, table: &str) -> bool {
        self.namespace.matches(namespace) && self.table.matches(table)
    }
}

/// Pattern-matched include/exclude decision over tracked tables
#[derive(Debug)]
pub struct TableFilter {
    includes: Vec<FilterPattern>,
    excludes: Vec<FilterPattern>,
    decision_cache: Mutex<HashMap<String, bool>>,
    accepted_by_default: bool,
}

impl TableFilter {
    pub fn new(excludes: &[String], includes: &[String], accepted_by_default: bool) -> Result<Self> {
        let excludes = excludes
            .iter()
            .map(|term| parse_pattern(term))
            .collect::<Result<Vec<_>>>()?;
        let includes = includes
            .iter()
            .map(|term| parse_pattern(term))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            includes,
            excludes,
            decision_cache: Mutex::new(HashMap::new()),
            accepted_by_default,
        })
    }

    /// Filter that accepts everything
    pub fn accept_all() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            decision_cache: Mutex::new(HashMap::new()),
            accepted_by_default: true,
        }
    }

    /// Whether events for this table should be streamed. Continuous
    /// aggregates match on their `(viewSchema, viewName)`; aggregates with
    /// no resolvable view are disabled.
    pub fn enabled(&self, table: &TrackedTable) -> bool {
        let canonical_name = table.canonical_name();
        if let Some(decision) = self.decision_cache.lock().unwrap().get(&canonical_name) {
            return *decision;
        }

        let decision = match table.filter_identity() {
            None => false,
            Some((namespace, name)) => self.decide(namespace, name),
        };

        self.decision_cache
            .lock()
            .unwrap()
            .insert(canonical_name, decision);
        decision
    }

    fn decide(&self, namespace: &str, name: &str) -> bool {
        // excludes take priority
        if self.excludes.iter().any(|f| f.matches(namespace, name)) {
            return false;
        }
        if self.includes.iter().any(|f| f.matches(namespace, name)) {
            return true;
        }
        self.accepted_by_default
    }
}

/// Split a filter term at the dot separating namespace and table parts,
/// ignoring dots inside quoted sections.
fn split_pattern(term: &str) -> Result<(&str, &str)> {
    let mut in_quotes = false;
    for (index, c) in term.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => {
                let (namespace, rest) = term.split_at(index);
                return Ok((namespace, &rest[1..]));
            }
            _ => {}
        }
    }
    Err(StreamerError::bad_pattern(format!(
        "failed parsing filter term: {}",
        term
    )))
}

fn parse_pattern(term: &str) -> Result<FilterPattern> {
    let (namespace, table) = split_pattern(term)?;
    if table.contains('.') && !table.starts_with('"') {
        return Err(StreamerError::bad_pattern(format!(
            "failed parsing filter term: {}",
            term
        )));
    }
    Ok(FilterPattern {
        namespace: parse_token(namespace)?,
        table: parse_token(table)?,
    })
}

fn parse_token(raw: &str) -> Result<Token> {
    if raw.is_empty() {
        return Err(StreamerError::bad_pattern("empty pattern part"));
    }

    let chars: Vec<char> = raw.chars().collect();
    let is_quoted = chars.len() >= 2 && chars[0] == '"' && chars[chars.len() - 1] == '"';

    // Unquoted identifiers fold to lowercase
    let token: Vec<char> = if is_quoted {
        chars
    } else {
        raw.to_lowercase().chars().collect()
    };

    if token.len() > MAX_UNQUOTED_LEN && (!is_quoted || token.len() > MAX_QUOTED_LEN) {
        return Err(StreamerError::bad_pattern(format!(
            "a pattern part cannot be longer than {} characters: {}",
            MAX_UNQUOTED_LEN, raw
        )));
    }

    if !is_quoted {
        let first = token[0];
        if !first.is_alphabetic() && first != '_' && first != '*' && first != '?' && first != '+' {
            return Err(StreamerError::bad_pattern(format!(
                "'{}' is an illegal first character of pattern '{}'",
                first, raw
            )));
        }
    }

    let inner = if is_quoted {
        &token[1..token.len() - 1]
    } else {
        &token[..]
    };

    let mut literal = String::new();
    let mut pattern = String::new();
    let mut is_regex = false;

    let mut i = 0;
    while i < inner.len() {
        let c = inner[i];
        let next = inner.get(i + 1).copied();

        if is_quoted && c == '\\' && matches!(next, Some('*') | Some('?') | Some('+')) {
            let wildcard = next.unwrap();
            literal.push(wildcard);
            pattern.push('\\');
            pattern.push(wildcard);
            i += 2;
            continue;
        }
        if is_quoted && c == '"' {
            if next == Some('"') {
                literal.push('"');
                pattern.push('"');
                i += 2;
                continue;
            }
            return Err(StreamerError::bad_pattern(format!(
                "stray quote in pattern '{}' at index {}",
                raw, i
            )));
        }
        match c {
            '*' => {
                pattern.push_str(".*?");
                literal.push(c);
                is_regex = true;
            }
            '?' => {
                pattern.push_str(".{1}");
                literal.push(c);
                is_regex = true;
            }
            '+' => {
                pattern.push_str(".+?");
                literal.push(c);
                is_regex = true;
            }
            c if c.is_alphanumeric() || c == '_' || is_quoted => {
                literal.push(c);
                pattern.push_str(&regex::escape(&c.to_string()));
            }
            c => {
                return Err(StreamerError::bad_pattern(format!(
                    "illegal character '{}' in pattern '{}' at index {}",
                    c, raw, i
                )));
            }
        }
        i += 1;
    }

    if !is_regex {
        if !is_quoted {
            let uppercased = literal.to_uppercase();
            if RESERVED_KEYWORDS.contains(&uppercased.as_str()) {
                return Err(StreamerError::bad_pattern(format!(
                    "an unquoted pattern cannot match a reserved keyword: {}",
                    uppercased
                )));
            }
        }
        return Ok(Token::Exact(literal));
    }

    let regex = Regex::new(&format!("^{}$", pattern))
        .map_err(|e| StreamerError::bad_pattern(format!("invalid pattern '{}': {}", raw, e)))?;
    Ok(Token::Wildcard(regex))
}
