//! Course code normalization.
//!
//! A course code is `"<DEPARTMENT> <NUMBER>"`, both upper-cased. Two labels
//! refer to the same course iff their normalized forms are equal, so every
//! comparison in matching and group lookup goes through [`CourseCode::parse`].

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseCode(String);

impl CourseCode {
    /// Normalize a raw course label.
    ///
    /// With two or more tokens the last token is the number and the rest,
    /// joined by single spaces, is the department. A single token such as
    /// `CS31A` is split where its first digit starts, provided a letter
    /// prefix exists. Anything else is kept as one upper-cased token: such
    /// degenerate codes are valid values that simply never match a real course.
    pub fn parse(raw: &str) -> Self {
        let tokens: Vec<String> = raw.split_whitespace().map(|t| t.to_uppercase()).collect();
        match tokens.as_slice() {
            [] => CourseCode(String::new()),
            [single] => match single.find(|c: char| c.is_ascii_digit()) {
                Some(idx) if idx > 0 => CourseCode(format!("{} {}", &single[..idx], &single[idx..])),
                _ => CourseCode(single.clone()),
            },
            [department @ .., number] => CourseCode(format!("{} {}", department.join(" "), number)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the code has both a department and a number part.
    pub fn is_well_formed(&self) -> bool {
        self.0.contains(' ')
    }

    /// Wrap a value that was normalized before being stored.
    pub(crate) fn from_stored(value: String) -> Self {
        CourseCode(value)
    }
}

impl fmt::Display for CourseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
