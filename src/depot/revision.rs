//! Perforce revision specifiers.
//!
//! A revision is a small sum type with a canonical string form (`#42`,
//! `@mylabel`, `@2019/08/15:11:24:45`, `#have,#head`, `@=4569`). Parsing is
//! total: every recognized form maps to a variant, anything else maps to
//! "no revision" (`None` from [`Revision::parse`]).

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Calendar timestamp carried by a date revision.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RevDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl fmt::Display for RevDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}/{:02}/{:02}:{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// A revision specifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Revision {
    /// `#none`, the null revision.
    None,
    /// `#have`, the client's have revision.
    Have,
    /// `#head`, the latest depot revision.
    Head,
    /// `#N`, a specific file revision.
    Number(i32),
    /// `@N`, the state at a changelist.
    Changelist(i32),
    /// `@label`, the state selected by a label.
    Label(String),
    /// `@yyyy/mm/dd[:hh:mm:ss]`, the state at a point in time.
    Date(RevDate),
    /// `@now`, the state at the current time.
    Now,
    /// `a,b`, a revision range.
    Range(Box<Revision>, Box<Revision>),
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static revision pattern"))
}

impl Revision {
    /// Parses one revision specifier. Unrecognized forms yield `None`.
    pub fn parse(text: &str) -> Option<Revision> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        static NUMBER: OnceLock<Regex> = OnceLock::new();
        static CHANGE: OnceLock<Regex> = OnceLock::new();
        static LABEL: OnceLock<Regex> = OnceLock::new();
        static RANGE: OnceLock<Regex> = OnceLock::new();
        static RANGE_EQ: OnceLock<Regex> = OnceLock::new();
        static DATE: OnceLock<Regex> = OnceLock::new();

        if let Some(m) = regex(&NUMBER, r"^#(\d+)$").captures(trimmed) {
            let value: i32 = m[1].parse().ok()?;
            return Some(if value == 0 { Revision::None } else { Revision::Number(value) });
        }
        if let Some(m) = regex(&CHANGE, r"^@(\d+)$").captures(trimmed) {
            return Some(Revision::Changelist(m[1].parse().ok()?));
        }
        if trimmed.eq_ignore_ascii_case("@now") {
            return Some(Revision::Now);
        }
        if trimmed.eq_ignore_ascii_case("#none") {
            return Some(Revision::None);
        }
        if trimmed.eq_ignore_ascii_case("#have") {
            return Some(Revision::Have);
        }
        if trimmed.eq_ignore_ascii_case("#head") {
            return Some(Revision::Head);
        }
        if let Some(m) = regex(&DATE, r"^@(\d{4})/(\d{2})/(\d{2})(?::(\d{2}):(\d{2}):(\d{2}))?$")
            .captures(trimmed)
        {
            return Some(Revision::Date(RevDate {
                year: m[1].parse().ok()?,
                month: m[2].parse().ok()?,
                day: m[3].parse().ok()?,
                hour: m.get(4).map_or(Ok(0), |v| v.as_str().parse()).ok()?,
                minute: m.get(5).map_or(Ok(0), |v| v.as_str().parse()).ok()?,
                second: m.get(6).map_or(Ok(0), |v| v.as_str().parse()).ok()?,
            }));
        }
        if let Some(m) = regex(&LABEL, r"^@([a-zA-Z]\S+)$").captures(trimmed) {
            return Some(Revision::Label(m[1].to_string()));
        }
        if let Some(m) = regex(&RANGE_EQ, r"^@=(\d+)$").captures(trimmed) {
            let change = Revision::Changelist(m[1].parse().ok()?);
            return Some(Revision::Range(Box::new(change.clone()), Box::new(change)));
        }
        if let Some(m) = regex(&RANGE, r"^([@#][^,\s]+),([@#]?[^,\s]+)$").captures(trimmed) {
            let start_text = m[1].to_string();
            let mut end_text = m[2].to_string();
            if !end_text.starts_with(['@', '#']) {
                // The end of a range inherits the start's specifier kind.
                end_text.insert(0, start_text.as_bytes()[0] as char);
            }
            let start = Revision::parse(&start_text)?;
            let end = Revision::parse(&end_text)?;
            return Some(Revision::Range(Box::new(start), Box::new(end)));
        }
        None
    }

    /// Renders an optional revision; absent revisions render empty.
    pub fn to_spec_string(revision: Option<&Revision>) -> String {
        revision.map(Revision::to_string).unwrap_or_default()
    }

    pub fn is_head(&self) -> bool {
        matches!(self, Revision::Head)
    }

    pub fn is_have(&self) -> bool {
        matches!(self, Revision::Have)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Revision::None)
    }

    /// The numeric file revision, when this is a `#N` revision.
    pub fn number(&self) -> Option<i32> {
        match self {
            Revision::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::None => write!(f, "#none"),
            Revision::Have => write!(f, "#have"),
            Revision::Head => write!(f, "#head"),
            Revision::Number(n) => write!(f, "#{n}"),
            Revision::Changelist(n) => write!(f, "@{n}"),
            Revision::Label(name) => write!(f, "@{name}"),
            Revision::Date(date) => write!(f, "@{date}"),
            Revision::Now => write!(f, "@now"),
            Revision::Range(start, end) => write!(f, "{start},{end}"),
        }
    }
}

impl std::str::FromStr for Revision {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Revision::parse(s).ok_or(())
    }
}
