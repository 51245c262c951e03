//! Condition trees: the evaluated form of a parsed query.
//!
//! The parser is an external collaborator; programs (or its output) build
//! these trees directly. Evaluation walks the table's clusters row by row,
//! except that a top-level equality over an indexed column is answered
//! straight from the radix index.

use tarn_alloc::SlabAlloc;
use tarn_core::{Group, table};
use tarn_error::{Result, TarnError};
use tarn_index::RadixTree;
use tarn_types::{ColKey, Mixed, ObjKey, TableKey};
use tracing::trace;

/// Relational comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// String operators (each usable case-insensitively).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrOp {
    Equal,
    NotEqual,
    BeginsWith,
    EndsWith,
    Contains,
    Like,
}

/// A predicate over one table's rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Always true (the empty query).
    True,
    /// Relational comparison against a constant.
    Cmp {
        col: ColKey,
        op: CmpOp,
        value: Mixed,
    },
    /// String comparison against a constant.
    Str {
        col: ColKey,
        op: StrOp,
        value: String,
        case_sensitive: bool,
    },
    /// The column holds null.
    IsNull { col: ColKey },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// `col == value`.
    #[must_use]
    pub fn eq(col: ColKey, value: Mixed) -> Self {
        Self::Cmp {
            col,
            op: CmpOp::Eq,
            value,
        }
    }

    /// `col > value`.
    #[must_use]
    pub fn gt(col: ColKey, value: Mixed) -> Self {
        Self::Cmp {
            col,
            op: CmpOp::Gt,
            value,
        }
    }

    /// `col < value`.
    #[must_use]
    pub fn lt(col: ColKey, value: Mixed) -> Self {
        Self::Cmp {
            col,
            op: CmpOp::Lt,
            value,
        }
    }

    /// Validate that every referenced column exists in `tk`.
    pub fn validate(&self, group: &Group, tk: TableKey) -> Result<()> {
        let info = group.table(tk)?;
        match self {
            Self::True => Ok(()),
            Self::Cmp { col, value, .. } => {
                info.col_index(*col).map_err(|_| TarnError::invalid_query(
                    format!("unknown column {col} in comparison"),
                ))?;
                if !value.is_null() {
                    let comparable = match value.data_type() {
                        Some(dt) => {
                            dt == col.data_type()
                                || (dt.is_numeric() && col.data_type().is_numeric())
                        }
                        None => false,
                    };
                    if !comparable {
                        return Err(TarnError::invalid_query(format!(
                            "cannot compare {value} against column {col}"
                        )));
                    }
                }
                Ok(())
            }
            Self::Str { col, .. } => {
                info.col_index(*col).map_err(|_| TarnError::invalid_query(
                    format!("unknown column {col} in string operation"),
                ))?;
                if col.data_type() != tarn_types::DataType::String {
                    return Err(TarnError::invalid_query(format!(
                        "string operation on non-string column {col}"
                    )));
                }
                Ok(())
            }
            Self::IsNull { col } => {
                info.col_index(*col).map_err(|_| TarnError::invalid_query(
                    format!("unknown column {col} in null check"),
                ))?;
                Ok(())
            }
            Self::And(children) | Self::Or(children) => {
                children.iter().try_for_each(|c| c.validate(group, tk))
            }
            Self::Not(child) => child.validate(group, tk),
        }
    }

    /// Whether the row at `key` matches.
    pub fn matches(
        &self,
        alloc: &SlabAlloc,
        group: &Group,
        tk: TableKey,
        key: ObjKey,
    ) -> Result<bool> {
        Ok(match self {
            Self::True => true,
            Self::Cmp { col, op, value } => {
                let actual = table::get_value(alloc, group, tk, key, *col)?;
                cmp_matches(&actual, *op, value)
            }
            Self::Str {
                col,
                op,
                value,
                case_sensitive,
            } => {
                let actual = table::get_value(alloc, group, tk, key, *col)?;
                match actual {
                    Mixed::String(s) => str_matches(&s, *op, value, *case_sensitive),
                    // Null never matches a string op except NotEqual.
                    _ => *op == StrOp::NotEqual,
                }
            }
            Self::IsNull { col } => {
                table::get_value(alloc, group, tk, key, *col)?.is_null()
            }
            Self::And(children) => {
                for c in children {
                    if !c.matches(alloc, group, tk, key)? {
                        return Ok(false);
                    }
                }
                true
            }
            Self::Or(children) => {
                for c in children {
                    if c.matches(alloc, group, tk, key)? {
                        return Ok(true);
                    }
                }
                false
            }
            Self::Not(child) => !child.matches(alloc, group, tk, key)?,
        })
    }

    /// An equality the radix index can answer directly, when the whole
    /// condition is one indexed comparison.
    fn index_probe(&self, group: &Group, tk: TableKey) -> Option<(usize, Mixed)> {
        let Self::Cmp {
            col,
            op: CmpOp::Eq,
            value,
        } = self
        else {
            return None;
        };
        let info = group.table(tk).ok()?;
        let idx = info.col_index(*col).ok()?;
        info.index_roots[idx].is_some().then(|| (idx, value.clone()))
    }
}

/// Evaluate a condition over a whole table, in key order, skipping
/// tombstones.
pub fn evaluate(
    alloc: &SlabAlloc,
    group: &Group,
    tk: TableKey,
    condition: &Condition,
) -> Result<Vec<ObjKey>> {
    condition.validate(group, tk)?;

    if let Some((idx, value)) = condition.index_probe(group, tk) {
        let info = group.table(tk)?;
        let tree = RadixTree::from_ref(info.index_roots[idx]);
        let mut keys: Vec<ObjKey> = tree
            .find_all(alloc, &value)?
            .into_iter()
            .filter(|k| !k.is_tombstone())
            .collect();
        keys.sort_unstable();
        trace!(count = keys.len(), "query answered from index");
        return Ok(keys);
    }

    let mut all = Vec::new();
    table::for_each_key(alloc, group, tk, &mut |k| all.push(k))?;
    let mut out = Vec::new();
    for key in all {
        if key.is_tombstone() {
            continue;
        }
        if condition.matches(alloc, group, tk, key)? {
            out.push(key);
        }
    }
    Ok(out)
}

fn cmp_matches(actual: &Mixed, op: CmpOp, expected: &Mixed) -> bool {
    use std::cmp::Ordering;
    // Equality spans the numeric family and treats null == null as true;
    // relational operators never match nulls or mismatched families.
    let both_null = actual.is_null() && expected.is_null();
    let comparable = both_null
        || match (actual.data_type(), expected.data_type()) {
            (Some(a), Some(b)) => a == b || (a.is_numeric() && b.is_numeric()),
            _ => false,
        };
    match op {
        CmpOp::Eq => comparable && actual.total_cmp(expected) == Ordering::Equal,
        CmpOp::Ne => !(comparable && actual.total_cmp(expected) == Ordering::Equal),
        CmpOp::Lt => comparable && !both_null && actual.total_cmp(expected) == Ordering::Less,
        CmpOp::Le => {
            comparable && !both_null && actual.total_cmp(expected) != Ordering::Greater
        }
        CmpOp::Gt => {
            comparable && !both_null && actual.total_cmp(expected) == Ordering::Greater
        }
        CmpOp::Ge => comparable && !both_null && actual.total_cmp(expected) != Ordering::Less,
    }
}

fn str_matches(actual: &str, op: StrOp, expected: &str, case_sensitive: bool) -> bool {
    let (a, e) = if case_sensitive {
        (actual.to_owned(), expected.to_owned())
    } else {
        (actual.to_lowercase(), expected.to_lowercase())
    };
    match op {
        StrOp::Equal => a == e,
        StrOp::NotEqual => a != e,
        StrOp::BeginsWith => a.starts_with(&e),
        StrOp::EndsWith => a.ends_with(&e),
        StrOp::Contains => a.contains(&e),
        StrOp::Like => like_matches(&a, &e),
    }
}

/// Glob matching: `?` matches one character, `*` any run.
fn like_matches(text: &str, pattern: &str) -> bool {
    fn inner(t: &[char], p: &[char]) -> bool {
        match (t.first(), p.first()) {
            (_, None) => t.is_empty(),
            (_, Some('*')) => {
                inner(t, &p[1..]) || (!t.is_empty() && inner(&t[1..], p))
            }
            (Some(_), Some('?')) => inner(&t[1..], &p[1..]),
            (Some(tc), Some(pc)) => tc == pc && inner(&t[1..], &p[1..]),
            (None, Some(_)) => false,
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&t, &p)
}
