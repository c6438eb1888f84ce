//! SQL statement classifier and three-tier safety policy engine.
//!
//! Classification never modifies the statement and consults nothing but the
//! statement text and the policy flags it is handed; string/comment contents
//! are blanked out before keyword scanning so that literals and comments
//! can never masquerade as (or hide) a forbidden verb.

use serde::Serialize;

/// The category a SQL statement is assigned to (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Classification {
    /// Ranked least to most privileged; `PartialOrd`/`Ord` back
    /// "most privileged wins" for multi-statement inputs (rule 6) and
    /// policy-monotonicity reasoning directly.
    Empty,
    ReadOnly,
    Dml,
    Ddl,
    Admin,
    Unknown,
}

/// The three operator-tunable safety flags from the config snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyFlags {
    pub read_only_mode: bool,
    pub allow_destructive: bool,
    pub allow_schema_changes: bool,
}

/// The outcome of evaluating a statement against the current policy.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub classification: Classification,
}

const READ_ONLY_VERBS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];
const DML_VERBS: &[&str] = &["INSERT", "UPDATE", "DELETE", "TRUNCATE", "MERGE"];
const DDL_VERBS: &[&str] = &["CREATE", "DROP", "ALTER", "GRANT", "REVOKE"];
const ADMIN_VERBS: &[&str] = &["EXEC", "EXECUTE", "CALL"];

/// Classify a (possibly multi-statement, semicolon-separated) SQL string.
pub fn classify(sql: &str) -> Classification {
    let sanitized = blank_strings_and_comments(sql);
    let statements = split_statements(&sanitized);

    let mut worst = Classification::Empty;
    let mut saw_any = false;
    for stmt in statements {
        let trimmed = stmt.trim();
        if trimmed.is_empty() {
            continue;
        }
        saw_any = true;
        let c = classify_single(trimmed);
        if c > worst {
            worst = c;
        }
    }

    if !saw_any {
        Classification::Empty
    } else {
        worst
    }
}

fn classify_single(stmt: &str) -> Classification {
    let Some(verb) = first_word(stmt) else {
        return Classification::Unknown;
    };
    if verb == "WITH" {
        return match skip_cte_preamble(stmt) {
            Some(rest) => classify_single(&rest),
            None => Classification::Unknown,
        };
    }
    if READ_ONLY_VERBS.contains(&verb.as_str()) {
        Classification::ReadOnly
    } else if DML_VERBS.contains(&verb.as_str()) {
        Classification::Dml
    } else if DDL_VERBS.contains(&verb.as_str()) {
        Classification::Ddl
    } else if ADMIN_VERBS.contains(&verb.as_str()) {
        Classification::Admin
    } else {
        Classification::Unknown
    }
}

/// Walk past a `WITH cte1 [(cols)] AS (body) [, cte2 AS (body) ...]` preamble
/// and return the statement that actually runs once the CTEs are bound — the
/// terminal `SELECT`/`INSERT`/`UPDATE`/`DELETE`/... a CTE is just sugar for.
/// Classifying `WITH` itself as read-only would let a throwaway CTE smuggle a
/// DML/DDL statement past a read-only policy (spec §4.3 rule 2).
fn skip_cte_preamble(stmt: &str) -> Option<String> {
    let chars: Vec<char> = stmt.chars().collect();
    let mut i = skip_word(&chars, 0)?; // past "WITH"

    loop {
        i = skip_ws(&chars, i);
        i = skip_word(&chars, i)?; // CTE name
        i = skip_ws(&chars, i);
        if chars.get(i) == Some(&'(') {
            i = skip_balanced_parens(&chars, i)?; // optional column list
            i = skip_ws(&chars, i);
        }
        let (word, next_i) = read_word(&chars, i)?;
        if !word.eq_ignore_ascii_case("as") {
            return None;
        }
        i = skip_ws(&chars, next_i);
        if chars.get(i) != Some(&'(') {
            return None;
        }
        i = skip_balanced_parens(&chars, i)?; // CTE body
        i = skip_ws(&chars, i);
        if chars.get(i) == Some(&',') {
            i += 1;
            continue;
        }
        break;
    }

    Some(chars[i..].iter().collect::<String>().trim().to_string())
}

fn skip_ws(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn skip_word(chars: &[char], i: usize) -> Option<usize> {
    read_word(chars, i).map(|(_, next_i)| next_i)
}

fn read_word(chars: &[char], i: usize) -> Option<(String, usize)> {
    let mut j = i;
    while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    if j == i {
        None
    } else {
        Some((chars[i..j].iter().collect(), j))
    }
}

/// Advance past a parenthesized span starting at `(`, tracking nesting depth.
fn skip_balanced_parens(chars: &[char], i: usize) -> Option<usize> {
    if chars.get(i) != Some(&'(') {
        return None;
    }
    let mut depth = 0i32;
    let mut j = i;
    while j < chars.len() {
        match chars[j] {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(j + 1);
                }
            }
            _ => {}
        }
        j += 1;
    }
    None
}

/// Evaluate a statement's classification against the current policy flags
/// (spec §4.3's authorization rules, applied in order).
pub fn authorize(classification: Classification, flags: PolicyFlags) -> PolicyDecision {
    use Classification::*;

    if flags.read_only_mode {
        return if matches!(classification, ReadOnly | Empty) {
            PolicyDecision {
                allowed: true,
                reason: "allowed under read-only mode".to_string(),
                classification,
            }
        } else {
            PolicyDecision {
                allowed: false,
                reason: format!(
                    "denied: readOnlyMode is enabled and this statement classifies as {classification:?}"
                ),
                classification,
            }
        };
    }

    match classification {
        Empty | ReadOnly => PolicyDecision {
            allowed: true,
            reason: "allowed".to_string(),
            classification,
        },
        Dml => {
            if flags.allow_destructive {
                PolicyDecision {
                    allowed: true,
                    reason: "allowed: allowDestructive is enabled".to_string(),
                    classification,
                }
            } else {
                PolicyDecision {
                    allowed: false,
                    reason: "denied: allowDestructive is disabled for a DML statement"
                        .to_string(),
                    classification,
                }
            }
        }
        Ddl => {
            if flags.allow_schema_changes {
                PolicyDecision {
                    allowed: true,
                    reason: "allowed: allowSchemaChanges is enabled".to_string(),
                    classification,
                }
            } else {
                PolicyDecision {
                    allowed: false,
                    reason: "denied: allowSchemaChanges is disabled for a DDL statement"
                        .to_string(),
                    classification,
                }
            }
        }
        Admin => {
            if flags.allow_destructive && flags.allow_schema_changes {
                PolicyDecision {
                    allowed: true,
                    reason: "allowed: allowDestructive and allowSchemaChanges are both enabled"
                        .to_string(),
                    classification,
                }
            } else {
                PolicyDecision {
                    allowed: false,
                    reason: "denied: admin statements require both allowDestructive and allowSchemaChanges"
                        .to_string(),
                    classification,
                }
            }
        }
        Unknown => PolicyDecision {
            allowed: false,
            reason: "denied: unrecognized statement shape".to_string(),
            classification,
        },
    }
}

/// Classify and authorize in one call — the entry point tool handlers use.
pub fn evaluate(sql: &str, flags: PolicyFlags) -> PolicyDecision {
    authorize(classify(sql), flags)
}

fn first_word(stmt: &str) -> Option<String> {
    let mut current = String::new();
    for ch in stmt.chars() {
        if ch.is_ascii_alphabetic() {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        } else if !ch.is_whitespace() {
            // Leading punctuation before any letter: not a recognizable verb.
            return None;
        }
    }
    if current.is_empty() {
        None
    } else {
        Some(current.to_ascii_uppercase())
    }
}

/// Split on top-level semicolons (those blanked-sanitized input still
/// contains; semicolons inside strings/comments were already blanked out
/// by `blank_strings_and_comments`, so a plain `split` is safe here).
fn split_statements(sanitized: &str) -> Vec<&str> {
    sanitized.split(';').collect()
}

/// Blank out string/identifier-quoted and comment spans, preserving length
/// and all other bytes, so verb scanning never sees text a client smuggled
/// inside a literal or a comment. Mirrors the approach of blanking rather
/// than removing: positions stay stable for any caller that wants to map
/// back to the original offsets.
fn blank_strings_and_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_bracket = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while let Some(ch) = chars.next() {
        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
                out.push('\n');
            } else {
                out.push(' ');
            }
            continue;
        }
        if in_block_comment {
            if ch == '*' && matches!(chars.peek(), Some('/')) {
                chars.next();
                in_block_comment = false;
                out.push(' ');
                out.push(' ');
            } else {
                out.push(' ');
            }
            continue;
        }
        if in_single {
            if ch == '\'' {
                if matches!(chars.peek(), Some('\'')) {
                    chars.next();
                    out.push(' ');
                    out.push(' ');
                    continue;
                }
                in_single = false;
            }
            out.push(' ');
            continue;
        }
        if in_double {
            if ch == '"' {
                in_double = false;
            }
            out.push(' ');
            continue;
        }
        if in_bracket {
            if ch == ']' {
                in_bracket = false;
            }
            out.push(' ');
            continue;
        }

        if ch == '-' && matches!(chars.peek(), Some('-')) {
            chars.next();
            in_line_comment = true;
            out.push(' ');
            out.push(' ');
            continue;
        }
        if ch == '/' && matches!(chars.peek(), Some('*')) {
            chars.next();
            in_block_comment = true;
            out.push(' ');
            out.push(' ');
            continue;
        }
        if ch == '\'' {
            in_single = true;
            out.push(' ');
            continue;
        }
        if ch == '"' {
            in_double = true;
            out.push(' ');
            continue;
        }
        if ch == '[' {
            in_bracket = true;
            out.push(' ');
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safe() -> PolicyFlags {
        PolicyFlags {
            read_only_mode: true,
            allow_destructive: false,
            allow_schema_changes: false,
        }
    }

    #[test]
    fn classifies_basic_verbs() {
        assert_eq!(classify("SELECT * FROM t"), Classification::ReadOnly);
        assert_eq!(classify("  "), Classification::Empty);
        assert_eq!(classify(""), Classification::Empty);
        assert_eq!(
            classify("INSERT INTO t (a) VALUES (1)"),
            Classification::Dml
        );
        assert_eq!(classify("UPDATE t SET a = 1"), Classification::Dml);
        assert_eq!(classify("DELETE FROM t"), Classification::Dml);
        assert_eq!(classify("CREATE TABLE t (a INT)"), Classification::Ddl);
        assert_eq!(classify("DROP TABLE t"), Classification::Ddl);
        assert_eq!(classify("EXEC sp_who"), Classification::Admin);
        assert_eq!(classify("frobnicate t"), Classification::Unknown);
    }

    #[test]
    fn classifies_cte_as_read_only() {
        assert_eq!(
            classify("WITH c AS (SELECT 1 AS x) SELECT x FROM c"),
            Classification::ReadOnly
        );
    }

    #[test]
    fn classifies_cte_by_its_terminal_verb() {
        assert_eq!(
            classify("WITH cte AS (SELECT id FROM t) DELETE FROM t WHERE id IN (SELECT id FROM cte)"),
            Classification::Dml
        );
        assert_eq!(
            classify("WITH cte AS (SELECT 1 AS x) INSERT INTO t SELECT x FROM cte"),
            Classification::Dml
        );
        assert_eq!(
            classify("WITH cte AS (SELECT 1 AS x) DROP TABLE t"),
            Classification::Ddl
        );
    }

    #[test]
    fn classifies_multiple_ctes_by_terminal_verb() {
        assert_eq!(
            classify("WITH a AS (SELECT 1 AS x), b (y) AS (SELECT 2) UPDATE t SET v = 1"),
            Classification::Dml
        );
    }

    #[test]
    fn read_only_supremacy_rejects_cte_smuggled_dml() {
        let flags = safe();
        let decision = evaluate(
            "WITH cte AS (SELECT id FROM t) DELETE FROM t WHERE id IN (SELECT id FROM cte)",
            flags,
        );
        assert!(!decision.allowed);
        assert_eq!(decision.classification, Classification::Dml);
    }

    #[test]
    fn classification_is_comment_and_literal_tolerant() {
        assert_eq!(
            classify("SELECT 1 -- INSERT INTO t"),
            Classification::ReadOnly
        );
        assert_eq!(
            classify("SELECT 1 /* DROP TABLE t */"),
            Classification::ReadOnly
        );
        assert_eq!(
            classify("SELECT 'DROP TABLE t' AS x"),
            Classification::ReadOnly
        );
    }

    #[test]
    fn multi_statement_takes_most_privileged() {
        assert_eq!(
            classify("SELECT 1; DROP TABLE t"),
            Classification::Ddl
        );
        assert_eq!(classify("SELECT 1; "), Classification::ReadOnly);
    }

    #[test]
    fn read_only_supremacy_denies_everything_but_read_only_and_empty() {
        let flags = safe();
        for sql in ["INSERT INTO t VALUES (1)", "DROP TABLE t", "EXEC sp_who"] {
            let decision = evaluate(sql, flags);
            assert!(!decision.allowed, "{sql} should be denied");
        }
        assert!(evaluate("SELECT 1", flags).allowed);
        assert!(evaluate("", flags).allowed);
    }

    #[test]
    fn three_tier_gate_for_dml() {
        let mut flags = PolicyFlags {
            read_only_mode: false,
            allow_destructive: false,
            allow_schema_changes: false,
        };
        assert!(!evaluate("UPDATE t SET a = 2", flags).allowed);
        flags.allow_destructive = true;
        assert!(evaluate("UPDATE t SET a = 2", flags).allowed);
    }

    #[test]
    fn admin_requires_both_flags() {
        let flags = PolicyFlags {
            read_only_mode: false,
            allow_destructive: true,
            allow_schema_changes: false,
        };
        assert!(!evaluate("EXEC sp_who", flags).allowed);
        let flags = PolicyFlags {
            allow_schema_changes: true,
            ..flags
        };
        assert!(evaluate("EXEC sp_who", flags).allowed);
    }

    #[test]
    fn unknown_statements_are_always_denied() {
        let flags = PolicyFlags {
            read_only_mode: false,
            allow_destructive: true,
            allow_schema_changes: true,
        };
        let decision = evaluate("FROBNICATE t", flags);
        assert!(!decision.allowed);
        assert_eq!(decision.classification, Classification::Unknown);
    }

    #[test]
    fn policy_monotonicity() {
        // P1 (strict) admits only read-only; P2 relaxes every flag and must
        // still admit everything P1 admitted.
        let p1 = PolicyFlags {
            read_only_mode: false,
            allow_destructive: false,
            allow_schema_changes: false,
        };
        let p2 = PolicyFlags {
            read_only_mode: false,
            allow_destructive: true,
            allow_schema_changes: true,
        };
        for sql in ["SELECT 1", "INSERT INTO t VALUES (1)", "DROP TABLE t", "EXEC sp_who"] {
            let c = classify(sql);
            if authorize(c, p1).allowed {
                assert!(authorize(c, p2).allowed, "{sql} regressed under a more permissive policy");
            }
        }
    }

    #[test]
    fn classifier_never_modifies_the_statement() {
        let sql = "SELECT * FROM t WHERE a = 1";
        let _ = classify(sql);
        assert_eq!(sql, "SELECT * FROM t WHERE a = 1");
    }
}
