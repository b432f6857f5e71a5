//! Filter-predicate column extraction and canonical index DDL synthesis
//!
//! PostgreSQL reports scan predicates as strings like
//! `((lineitem.l_comment)::text = 'rare'::text)`. The analyzer needs the
//! column names back out of that text to build grounded index suggestions:
//! parentheses are stripped, `::type` casts removed, the predicate is split
//! at its top-level connective, and the left-hand identifier of each
//! comparison is kept.

/// Top-level connective of an extracted predicate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connective {
    Single,
    And,
    Or,
}

/// Columns referenced by a filter predicate, in source order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedPredicate {
    pub columns: Vec<String>,
    pub connective: Connective,
}

const RESERVED: &[&str] = &[
    "and", "or", "not", "is", "null", "true", "false", "in", "like", "ilike", "between",
    "exists", "any", "all", "case", "when", "then", "else", "end", "distinct",
];

/// Extract the ordered unique column list and the top-level connective
/// from a PostgreSQL filter string. Returns an empty column list when
/// nothing identifier-like can be recovered.
pub fn extract_predicate(filter: &str) -> ExtractedPredicate {
    let stripped = strip_outer_parens(filter.trim());

    // OR binds loosest, so a top-level OR makes the whole predicate
    // disjunctive regardless of nested ANDs.
    let or_parts = split_top_level(stripped, "OR");
    let (parts, connective) = if or_parts.len() > 1 {
        (or_parts, Connective::Or)
    } else {
        let and_parts = split_top_level(stripped, "AND");
        if and_parts.len() > 1 {
            (and_parts, Connective::And)
        } else {
            (vec![stripped.to_string()], Connective::Single)
        }
    };

    let mut columns = Vec::new();
    for part in &parts {
        // A disjunct may itself be a conjunction; harvest every branch.
        let conjuncts = split_top_level(strip_outer_parens(part.trim()), "AND");
        for conjunct in conjuncts {
            if let Some(column) = lhs_identifier(&conjunct) {
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }
    }

    let connective = match (columns.len(), connective) {
        (0 | 1, _) => Connective::Single,
        (_, c) => c,
    };

    ExtractedPredicate { columns, connective }
}

/// Strip matched outer parentheses, recursively
fn strip_outer_parens(s: &str) -> &str {
    let mut current = s.trim();
    while current.starts_with('(') && current.ends_with(')') {
        // Only strip when the opening paren closes at the very end
        let mut depth = 0i32;
        let mut spans_whole = true;
        for (i, ch) in current.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 && i != current.len() - 1 {
                        spans_whole = false;
                        break;
                    }
                }
                _ => {}
            }
        }
        if !spans_whole || depth != 0 {
            break;
        }
        current = current[1..current.len() - 1].trim();
    }
    current
}

/// Split on a logical keyword at paren depth zero, case-insensitively
fn split_top_level(s: &str, keyword: &str) -> Vec<String> {
    let upper = s.to_uppercase();
    let needle = format!(" {keyword} ");
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let bytes = upper.as_bytes();

    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b'\'' => {
                // skip string literal
                i += 1;
                while i < bytes.len() && bytes[i] != b'\'' {
                    i += 1;
                }
            }
            _ => {
                if depth == 0 && upper[i..].starts_with(&needle) {
                    parts.push(s[start..i].trim().to_string());
                    i += needle.len();
                    start = i;
                    continue;
                }
            }
        }
        i += 1;
    }
    parts.push(s[start..].trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Left-hand identifier of the first comparison in one conjunct, cleaned:
/// casts cut at `::`, qualifier dropped, quotes removed, reserved words and
/// literals discarded.
fn lhs_identifier(conjunct: &str) -> Option<String> {
    let mut conjunct = strip_outer_parens(conjunct.trim());
    while conjunct.to_uppercase().starts_with("NOT ") {
        conjunct = strip_outer_parens(conjunct[4..].trim());
    }

    const OPERATORS: &[&str] = &["<=", ">=", "<>", "!=", "!~~", "~~", "=", "<", ">"];
    let mut op_pos = None;
    for op in OPERATORS {
        if let Some(pos) = conjunct.find(op) {
            op_pos = Some(match op_pos {
                Some(best) if best <= pos => best,
                _ => pos,
            });
        }
    }
    // IS NULL / IS NOT NULL style predicates have no comparison operator;
    // the identifier is everything before the keyword.
    let lhs_end = op_pos.or_else(|| {
        let upper = conjunct.to_uppercase();
        upper.find(" IS ").or_else(|| upper.find(" IN "))
    })?;

    let mut lhs = strip_outer_parens(conjunct[..lhs_end].trim());

    // Cut type casts: `(col)::text` / `col::numeric(10,2)`
    if let Some(cast) = lhs.find("::") {
        lhs = lhs[..cast].trim();
    }
    lhs = strip_outer_parens(lhs);

    // Qualified name: keep the column, drop the relation/alias
    let ident = lhs.rsplit('.').next().unwrap_or(lhs);
    let ident = ident.trim_matches('"').trim();

    if ident.is_empty()
        || !ident.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        || !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || RESERVED.contains(&ident.to_lowercase().as_str())
    {
        return None;
    }
    Some(ident.to_string())
}

/// Canonical index DDL for an extracted predicate.
///
/// One column yields a single named index; an AND conjunction yields one
/// composite index; an OR disjunction yields one index per column,
/// semicolon-joined.
pub fn index_suggestion(table: &str, predicate: &ExtractedPredicate) -> Option<String> {
    if predicate.columns.is_empty() {
        return None;
    }
    let ddl = match (predicate.columns.len(), predicate.connective) {
        (1, _) => single_column_index(table, &predicate.columns[0]),
        (_, Connective::Or) => predicate
            .columns
            .iter()
            .map(|c| single_column_index(table, c))
            .collect::<Vec<_>>()
            .join("; "),
        _ => composite_index(table, &predicate.columns),
    };
    Some(ddl)
}

/// Index covering an explicit column list in the given order (sort keys,
/// join column plus filter columns)
pub fn ordered_index(table: &str, columns: &[String]) -> Option<String> {
    match columns {
        [] => None,
        [one] => Some(single_column_index(table, one)),
        many => Some(composite_index(table, many)),
    }
}

pub fn run_analyze_suggestion(table: &str) -> String {
    format!("RUN_ANALYZE {table}")
}

fn single_column_index(table: &str, column: &str) -> String {
    format!("CREATE INDEX idx_{table}_{column} ON {table}({column})")
}

fn composite_index(table: &str, columns: &[String]) -> String {
    format!(
        "CREATE INDEX idx_{table}_composite ON {table}({})",
        columns.join(", ")
    )
}

/// Column of `relation` referenced in a join condition like
/// `(orders.o_custkey = customers.c_custkey)`. Falls back to the first
/// identifier when no side is qualified by the relation name.
pub fn join_column_for(condition: &str, relation: &str) -> Option<String> {
    let stripped = strip_outer_parens(condition.trim());
    let mut first: Option<String> = None;

    for side in stripped.split(|c| c == '=' || c == '<' || c == '>') {
        // Splitting on the operator leaves unbalanced paren remnants
        let side = side.trim().trim_matches(|c: char| c == '(' || c == ')' || c.is_whitespace());
        let side = side.split("::").next().unwrap_or(side).trim();
        let side = side.trim_matches(|c: char| c == '(' || c == ')');
        let (qualifier, column) = match side.rsplit_once('.') {
            Some((q, c)) => (Some(q.trim_matches('"')), c.trim_matches('"')),
            None => (None, side.trim_matches('"')),
        };
        if column.is_empty()
            || !column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            || RESERVED.contains(&column.to_lowercase().as_str())
        {
            continue;
        }
        if qualifier == Some(relation) {
            return Some(column.to_string());
        }
        if first.is_none() {
            first = Some(column.to_string());
        }
    }
    first
}

/// Strip qualifier and ordering direction from an EXPLAIN sort key entry
/// (`orders.o_orderdate DESC` -> `o_orderdate`)
pub fn sort_key_column(entry: &str) -> Option<String> {
    let mut token = entry.trim();
    for suffix in ["NULLS FIRST", "NULLS LAST", "DESC", "ASC"] {
        let upper = token.to_uppercase();
        if let Some(stripped) = upper.strip_suffix(suffix) {
            if stripped.ends_with(' ') {
                token = token[..stripped.len()].trim();
            }
        }
    }
    let token = token.split("::").next().unwrap_or(token).trim();
    let token = strip_outer_parens(token);
    let column = token.rsplit('.').next().unwrap_or(token).trim_matches('"');
    if column.is_empty() || !column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(column.to_string())
}
