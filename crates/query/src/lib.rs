use std::fmt;
use std::io::{self, Write};
use std::iter::Peekable;

use chrono::{Datelike, NaiveDate};
use common::xml::{XmlError, XmlToken, XmlTokenReader, XmlWriter};
use common::{Property, StringPool, Value, ValueParseError};
use tracing::warn;

const ELT_CONJUNCTION: &str = "conjunction";
const ELT_SUBQUERY: &str = "subquery";
const ELT_DISJUNCTION: &str = "disjunction";
const ATTR_PROP: &str = "prop";

/// Clause operator. `Greater`/`Less` are inclusive; the year operators
/// are synthetic and rewritten into Julian-day ranges by `preprocess`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Equals,
    Like,
    NotLike,
    Prefix,
    Suffix,
    Greater,
    Less,
    YearEquals,
    YearGreater,
    YearLess,
}

impl Op {
    /// Serialized element name. Year operators share the plain names and
    /// are recovered on the way back in by the property they apply to.
    pub fn tag_name(self) -> &'static str {
        match self {
            Op::Equals | Op::YearEquals => "equals",
            Op::Like => "like",
            Op::NotLike => "not-like",
            Op::Prefix => "prefix",
            Op::Suffix => "suffix",
            Op::Greater | Op::YearGreater => "greater",
            Op::Less | Op::YearLess => "less",
        }
    }
}

#[derive(Clone, Debug)]
pub enum Clause {
    Prop {
        op: Op,
        prop: Property,
        value: Value,
    },
    Disjunction,
    SubQuery(Query),
}

impl Clause {
    pub fn prop(op: Op, prop: Property, value: Value) -> Clause {
        Clause::Prop { op, prop, value }
    }
}

/// An ordered clause list, implicitly conjunctive between disjunction
/// markers. A plain value object: deep-copyable and freely composable.
#[derive(Clone, Debug, Default)]
pub struct Query {
    clauses: Vec<Clause>,
}

impl Query {
    pub fn new() -> Query {
        Query::default()
    }

    pub fn push(&mut self, clause: Clause) {
        self.clauses.push(clause);
    }

    pub fn with(mut self, clause: Clause) -> Query {
        self.clauses.push(clause);
        self
    }

    pub fn concat(&mut self, other: Query) {
        self.clauses.extend(other.clauses);
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    /// Splits at top-level disjunction markers into purely conjunctive
    /// sub-queries; a match on any of them satisfies the whole query.
    pub fn split_disjunctions(&self) -> Vec<Query> {
        let mut branches = Vec::new();
        let mut current = Query::new();
        for clause in &self.clauses {
            match clause {
                Clause::Disjunction => {
                    branches.push(std::mem::take(&mut current));
                }
                other => current.clauses.push(other.clone()),
            }
        }
        branches.push(current);
        branches
    }

    /// One-time compilation pass: folds string literals aimed at folded
    /// properties, tokenizes free-text search clauses, and rewrites
    /// year operators into Julian-day ranges. Idempotent.
    pub fn preprocess(&mut self, pool: &StringPool) {
        let mut i = 0;
        while i < self.clauses.len() {
            let replacement = match &mut self.clauses[i] {
                Clause::SubQuery(sub) => {
                    sub.preprocess(pool);
                    None
                }
                Clause::Disjunction => None,
                Clause::Prop { op, prop, value } => {
                    if prop.is_derived() {
                        if let Value::Str(s) = value {
                            *value = Value::Str(pool.intern(&common::search_fold(s)));
                        }
                        None
                    } else if *prop == Property::SearchMatch {
                        if let Value::Str(s) = value {
                            *value = Value::StrList(common::split_words(&common::search_fold(s)));
                        }
                        None
                    } else if *prop == Property::Date {
                        rewrite_year_clause(*op, value)
                    } else {
                        None
                    }
                }
            };
            if let Some(clause) = replacement {
                self.clauses[i] = clause;
                // Re-examine in case the rewrite needs another pass.
                continue;
            }
            i += 1;
        }
    }

    pub fn serialize<W: Write>(&self, writer: &mut XmlWriter<W>) -> io::Result<()> {
        writer.open(ELT_CONJUNCTION, &[])?;
        for clause in &self.clauses {
            match clause {
                Clause::Disjunction => writer.empty(ELT_DISJUNCTION)?,
                Clause::SubQuery(sub) => {
                    writer.open(ELT_SUBQUERY, &[])?;
                    sub.serialize(writer)?;
                    writer.close(ELT_SUBQUERY)?;
                }
                Clause::Prop { op, prop, value } => {
                    writer.element_text_attrs(
                        op.tag_name(),
                        &[(ATTR_PROP, prop.tag_name())],
                        &value.to_text(),
                    )?;
                }
            }
        }
        writer.close(ELT_CONJUNCTION)
    }

    pub fn to_xml_string(&self) -> String {
        let mut writer = XmlWriter::new(Vec::new());
        // Writing to a Vec cannot fail.
        self.serialize(&mut writer).expect("serialize to memory");
        String::from_utf8(writer.into_inner()).expect("serializer emits UTF-8")
    }

    pub fn from_xml(input: &str, pool: &StringPool) -> Result<Query, QueryParseError> {
        let mut tokens = XmlTokenReader::new(input).peekable();
        match tokens.next() {
            Some(Ok(XmlToken::Open { name, .. })) if name == ELT_CONJUNCTION => {}
            Some(Ok(token)) => {
                return Err(QueryParseError::Malformed(format!(
                    "expected <{}>, found {:?}",
                    ELT_CONJUNCTION, token
                )))
            }
            Some(Err(err)) => return Err(err.into()),
            None => return Err(QueryParseError::Malformed("empty document".to_string())),
        }
        parse_conjunction_body(&mut tokens, pool)
    }
}

/// Parses clauses up to and including the closing conjunction tag.
fn parse_conjunction_body(
    tokens: &mut Peekable<XmlTokenReader<'_>>,
    pool: &StringPool,
) -> Result<Query, QueryParseError> {
    let mut query = Query::new();
    loop {
        match tokens.next() {
            Some(Ok(XmlToken::Close(name))) if name == ELT_CONJUNCTION => return Ok(query),
            Some(Ok(XmlToken::Close(name))) => {
                return Err(QueryParseError::Malformed(format!("unexpected </{}>", name)))
            }
            Some(Ok(XmlToken::Text(_))) => continue,
            Some(Ok(XmlToken::Open { name, attrs })) => {
                if name == ELT_DISJUNCTION {
                    expect_close(tokens, ELT_DISJUNCTION)?;
                    query.push(Clause::Disjunction);
                } else if name == ELT_SUBQUERY {
                    expect_open(tokens, ELT_CONJUNCTION)?;
                    let sub = parse_conjunction_body(tokens, pool)?;
                    expect_close(tokens, ELT_SUBQUERY)?;
                    query.push(Clause::SubQuery(sub));
                } else {
                    query.push(parse_prop_clause(tokens, &name, &attrs, pool)?);
                }
            }
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(QueryParseError::Malformed(
                    "unterminated conjunction".to_string(),
                ))
            }
        }
    }
}

fn parse_prop_clause(
    tokens: &mut Peekable<XmlTokenReader<'_>>,
    tag: &str,
    attrs: &[(String, String)],
    pool: &StringPool,
) -> Result<Clause, QueryParseError> {
    let prop_name = attrs
        .iter()
        .find(|(key, _)| key == ATTR_PROP)
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| QueryParseError::Malformed(format!("<{}> missing prop", tag)))?;
    let prop = Property::from_tag_name(prop_name)
        .ok_or_else(|| QueryParseError::UnknownProperty(prop_name.to_string()))?;

    let year_based = prop == Property::Date;
    let op = match tag {
        "equals" if year_based => Op::YearEquals,
        "equals" => Op::Equals,
        "like" => Op::Like,
        "not-like" => Op::NotLike,
        "prefix" => Op::Prefix,
        "suffix" => Op::Suffix,
        "greater" if year_based => Op::YearGreater,
        "greater" => Op::Greater,
        "less" if year_based => Op::YearLess,
        "less" => Op::Less,
        other => return Err(QueryParseError::UnknownOperator(other.to_string())),
    };

    let mut text = String::new();
    loop {
        match tokens.next() {
            Some(Ok(XmlToken::Text(chunk))) => text.push_str(&chunk),
            Some(Ok(XmlToken::Close(name))) if name == tag => break,
            Some(Ok(token)) => {
                return Err(QueryParseError::Malformed(format!(
                    "unexpected {:?} inside <{}>",
                    token, tag
                )))
            }
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(QueryParseError::Malformed(format!(
                    "unterminated <{}>",
                    tag
                )))
            }
        }
    }

    let value = Value::from_text(prop.kind(), &text, pool)?;
    Ok(Clause::Prop { op, prop, value })
}

fn expect_open(
    tokens: &mut Peekable<XmlTokenReader<'_>>,
    expected: &str,
) -> Result<(), QueryParseError> {
    loop {
        match tokens.next() {
            Some(Ok(XmlToken::Open { name, .. })) if name == expected => return Ok(()),
            Some(Ok(XmlToken::Text(text))) if text.trim().is_empty() => continue,
            Some(Ok(token)) => {
                return Err(QueryParseError::Malformed(format!(
                    "expected <{}>, found {:?}",
                    expected, token
                )))
            }
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(QueryParseError::Malformed(format!(
                    "expected <{}>, found end of input",
                    expected
                )))
            }
        }
    }
}

fn expect_close(
    tokens: &mut Peekable<XmlTokenReader<'_>>,
    expected: &str,
) -> Result<(), QueryParseError> {
    loop {
        match tokens.next() {
            Some(Ok(XmlToken::Close(name))) if name == expected => return Ok(()),
            Some(Ok(XmlToken::Text(text))) if text.trim().is_empty() => continue,
            Some(Ok(token)) => {
                return Err(QueryParseError::Malformed(format!(
                    "expected </{}>, found {:?}",
                    expected, token
                )))
            }
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(QueryParseError::Malformed(format!(
                    "expected </{}>, found end of input",
                    expected
                )))
            }
        }
    }
}

/// Rewrites one year clause into its Julian-day form. Day 0 means "no
/// date" and needs no range computation.
fn rewrite_year_clause(op: Op, value: &mut Value) -> Option<Clause> {
    let julian = match value {
        Value::ULong(v) => *v,
        _ => return None,
    };
    match op {
        Op::YearEquals => {
            if julian == 0 {
                return Some(Clause::prop(Op::Equals, Property::Date, Value::ULong(0)));
            }
            let (begin, end) = match year_bounds(julian) {
                Some(bounds) => bounds,
                None => {
                    warn!(julian, "date out of calendar range, leaving clause as-is");
                    return Some(Clause::prop(Op::Equals, Property::Date, Value::ULong(julian)));
                }
            };
            Some(Clause::SubQuery(
                Query::new()
                    .with(Clause::prop(Op::Greater, Property::Date, Value::ULong(begin)))
                    .with(Clause::prop(Op::Less, Property::Date, Value::ULong(end))),
            ))
        }
        Op::YearGreater => {
            if julian == 0 {
                return Some(Clause::prop(Op::Greater, Property::Date, Value::ULong(0)));
            }
            let begin = year_bounds(julian).map(|(begin, _)| begin).unwrap_or(julian);
            Some(Clause::prop(Op::Greater, Property::Date, Value::ULong(begin)))
        }
        Op::YearLess => {
            if julian == 0 {
                return Some(Clause::prop(Op::Less, Property::Date, Value::ULong(0)));
            }
            let end = year_bounds(julian).map(|(_, end)| end).unwrap_or(julian);
            Some(Clause::prop(Op::Less, Property::Date, Value::ULong(end)))
        }
        _ => None,
    }
}

/// First and last Julian day (day 1 = 0001-01-01) of the year containing
/// the given Julian day.
pub fn year_bounds(julian: u64) -> Option<(u64, u64)> {
    let date = NaiveDate::from_num_days_from_ce_opt(i32::try_from(julian).ok()?)?;
    let year = date.year();
    let begin = NaiveDate::from_ymd_opt(year, 1, 1)?.num_days_from_ce();
    let next = NaiveDate::from_ymd_opt(year + 1, 1, 1)?.num_days_from_ce();
    Some((begin as u64, (next - 1) as u64))
}

/// Julian day for a calendar date, for query construction and tests.
pub fn julian_day(year: i32, month: u32, day: u32) -> Option<u64> {
    Some(NaiveDate::from_ymd_opt(year, month, day)?.num_days_from_ce() as u64)
}

#[derive(Debug)]
pub enum QueryParseError {
    Xml(XmlError),
    Malformed(String),
    BadValue(ValueParseError),
    UnknownProperty(String),
    UnknownOperator(String),
}

impl fmt::Display for QueryParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryParseError::Xml(err) => write!(f, "xml error: {}", err),
            QueryParseError::Malformed(msg) => write!(f, "malformed query: {}", msg),
            QueryParseError::BadValue(err) => write!(f, "bad query value: {}", err),
            QueryParseError::UnknownProperty(name) => write!(f, "unknown property: {}", name),
            QueryParseError::UnknownOperator(name) => write!(f, "unknown operator: {}", name),
        }
    }
}

impl std::error::Error for QueryParseError {}

impl From<XmlError> for QueryParseError {
    fn from(err: XmlError) -> Self {
        QueryParseError::Xml(err)
    }
}

impl From<ValueParseError> for QueryParseError {
    fn from(err: ValueParseError) -> Self {
        QueryParseError::BadValue(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StringPool {
        StringPool::new()
    }

    #[test]
    fn split_three_branches() {
        let q = Query::new()
            .with(Clause::prop(
                Op::Equals,
                Property::Genre,
                Value::Str(pool().intern("Rock")),
            ))
            .with(Clause::Disjunction)
            .with(Clause::prop(
                Op::Equals,
                Property::Artist,
                Value::Str(pool().intern("X")),
            ))
            .with(Clause::Disjunction)
            .with(Clause::prop(Op::Greater, Property::Rating, Value::Double(4.0)));
        let branches = q.split_disjunctions();
        assert_eq!(branches.len(), 3);
        assert_eq!(branches[0].len(), 1);
        assert_eq!(branches[2].len(), 1);
    }

    #[test]
    fn preprocess_folds_and_tokenizes() {
        let pool = pool();
        let mut q = Query::new()
            .with(Clause::prop(
                Op::Like,
                Property::TitleFolded,
                Value::Str(pool.intern("Señor")),
            ))
            .with(Clause::prop(
                Op::Like,
                Property::SearchMatch,
                Value::Str(pool.intern("Great GIG sky")),
            ));
        q.preprocess(&pool);
        match &q.clauses()[0] {
            Clause::Prop { value, .. } => assert_eq!(value.as_str(), "senor"),
            other => panic!("unexpected clause {:?}", other),
        }
        match &q.clauses()[1] {
            Clause::Prop { value, .. } => {
                assert_eq!(value.as_words(), &["great", "gig", "sky"]);
            }
            other => panic!("unexpected clause {:?}", other),
        }
    }

    #[test]
    fn preprocess_rewrites_year_equals() {
        let pool = pool();
        let mid_1994 = julian_day(1994, 6, 1).unwrap();
        let mut q = Query::new().with(Clause::prop(
            Op::YearEquals,
            Property::Date,
            Value::ULong(mid_1994),
        ));
        q.preprocess(&pool);
        match &q.clauses()[0] {
            Clause::SubQuery(sub) => {
                let begin = julian_day(1994, 1, 1).unwrap();
                let end = julian_day(1994, 12, 31).unwrap();
                match (&sub.clauses()[0], &sub.clauses()[1]) {
                    (
                        Clause::Prop { op: Op::Greater, value: a, .. },
                        Clause::Prop { op: Op::Less, value: b, .. },
                    ) => {
                        assert_eq!(a.as_ulong(), begin);
                        assert_eq!(b.as_ulong(), end);
                    }
                    other => panic!("unexpected rewrite {:?}", other),
                }
            }
            other => panic!("expected subquery, got {:?}", other),
        }
    }

    #[test]
    fn preprocess_leaves_no_date_alone() {
        let pool = pool();
        let mut q = Query::new().with(Clause::prop(
            Op::YearEquals,
            Property::Date,
            Value::ULong(0),
        ));
        q.preprocess(&pool);
        match &q.clauses()[0] {
            Clause::Prop { op: Op::Equals, value, .. } => assert_eq!(value.as_ulong(), 0),
            other => panic!("unexpected clause {:?}", other),
        }
    }

    #[test]
    fn xml_round_trip_with_nesting() {
        let pool = pool();
        let q = Query::new()
            .with(Clause::prop(
                Op::Equals,
                Property::Artist,
                Value::Str(pool.intern("Pink Floyd")),
            ))
            .with(Clause::Disjunction)
            .with(Clause::SubQuery(
                Query::new()
                    .with(Clause::prop(
                        Op::Equals,
                        Property::Genre,
                        Value::Str(pool.intern("Classical & Baroque")),
                    ))
                    .with(Clause::prop(Op::Greater, Property::Rating, Value::Double(5.0))),
            ));
        let xml = q.to_xml_string();
        let parsed = Query::from_xml(&xml, &pool).unwrap();
        assert_eq!(parsed.to_xml_string(), xml);
    }

    #[test]
    fn year_ops_survive_round_trip() {
        let pool = pool();
        let q = Query::new().with(Clause::prop(
            Op::YearEquals,
            Property::Date,
            Value::ULong(julian_day(2001, 3, 4).unwrap()),
        ));
        let parsed = Query::from_xml(&q.to_xml_string(), &pool).unwrap();
        match parsed.clauses() {
            [Clause::Prop { op: Op::YearEquals, prop: Property::Date, .. }] => {}
            other => panic!("unexpected clauses {:?}", other),
        }
    }

    #[test]
    fn unknown_property_is_error() {
        let pool = pool();
        let xml = "<conjunction><equals prop=\"nope\">x</equals></conjunction>";
        assert!(matches!(
            Query::from_xml(xml, &pool),
            Err(QueryParseError::UnknownProperty(_))
        ));
    }

    #[test]
    fn mismatched_close_tag_is_malformed() {
        let pool = pool();
        let xml = "<conjunction></subquery></conjunction>";
        assert!(matches!(
            Query::from_xml(xml, &pool),
            Err(QueryParseError::Malformed(_))
        ));
    }
}
