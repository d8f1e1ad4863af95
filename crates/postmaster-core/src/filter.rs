//! Filter expression compiler.
//!
//! User text plus two toggles (case sensitivity, literal vs pattern) compile to
//! a [`Matcher`]. Three field matchers (origin, destination, stringified data)
//! AND together into a [`CompositeFilter`], which is used two ways:
//!
//! - as an exclusion filter by the store: matching events are never buffered
//! - as a search filter by the view: only matching events are shown
//!
//! [`ActiveFilter`] is the "maybe a filter" slot both of those hold.

use std::{fmt, sync::Arc};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CapturedEvent;

/// Filter compilation error.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{field} filter: {source}")]
    InvalidField {
        field: Field,
        #[source]
        source: Box<FilterError>,
    },
}

/// Event field a pattern applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Origin,
    Destination,
    Data,
}

impl Field {
    /// All filterable fields, in display order.
    pub const ALL: [Self; 3] = [Self::Origin, Self::Destination, Self::Data];
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Origin => "origin",
            Self::Destination => "destination",
            Self::Data => "data",
        })
    }
}

/// Compiled single-field matcher.
#[derive(Debug, Clone, Default)]
pub enum Matcher {
    /// No pattern configured; matches everything.
    #[default]
    Always,
    /// Unanchored search for a compiled pattern.
    Pattern(Regex),
}

impl Matcher {
    /// Compile user text into a matcher.
    ///
    /// An empty pattern yields [`Matcher::Always`]. With `literal` set every
    /// metacharacter is escaped so the text matches verbatim.
    ///
    /// # Errors
    /// Returns [`FilterError::InvalidPattern`] if the pattern does not compile.
    pub fn compile(pattern: &str, case_sensitive: bool, literal: bool) -> Result<Self, FilterError> {
        if pattern.is_empty() {
            return Ok(Self::Always);
        }

        let source = if literal {
            regex::escape(pattern)
        } else {
            pattern.to_string()
        };

        RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .build()
            .map(Self::Pattern)
            .map_err(|source| FilterError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    /// Whether `text` contains a match.
    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Always => true,
            Self::Pattern(re) => re.is_match(text),
        }
    }

    /// Whether this matcher lets every input through.
    #[must_use]
    pub const fn is_pass_through(&self) -> bool {
        matches!(self, Self::Always)
    }
}

/// Compile a single pattern; shorthand for [`Matcher::compile`].
///
/// # Errors
/// Returns [`FilterError::InvalidPattern`] if the pattern does not compile.
pub fn compile(pattern: &str, case_sensitive: bool, literal: bool) -> Result<Matcher, FilterError> {
    Matcher::compile(pattern, case_sensitive, literal)
}

/// User-facing settings for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPattern {
    pub pattern: String,
    pub case_sensitive: bool,
    pub literal: bool,
}

impl Default for FieldPattern {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            case_sensitive: false,
            literal: true,
        }
    }
}

impl FieldPattern {
    /// Case-insensitive literal text.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Self::default()
        }
    }

    /// Set case sensitivity.
    #[must_use]
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Treat the text as a regular expression instead of literal text.
    #[must_use]
    pub fn regex(mut self) -> Self {
        self.literal = false;
        self
    }

    /// Whether a non-empty pattern is configured.
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.pattern.is_empty()
    }

    /// Compile this field.
    ///
    /// # Errors
    /// Returns [`FilterError::InvalidPattern`] if the pattern does not compile.
    pub fn compile(&self) -> Result<Matcher, FilterError> {
        Matcher::compile(&self.pattern, self.case_sensitive, self.literal)
    }
}

/// Editable filter state behind a filter bar: one pattern per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterInput {
    pub origin: FieldPattern,
    pub destination: FieldPattern,
    pub data: FieldPattern,
}

impl FilterInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: Field, pattern: FieldPattern) -> Self {
        *self.field_mut(field) = pattern;
        self
    }

    #[must_use]
    pub const fn field(&self, field: Field) -> &FieldPattern {
        match field {
            Field::Origin => &self.origin,
            Field::Destination => &self.destination,
            Field::Data => &self.data,
        }
    }

    pub const fn field_mut(&mut self, field: Field) -> &mut FieldPattern {
        match field {
            Field::Origin => &mut self.origin,
            Field::Destination => &mut self.destination,
            Field::Data => &mut self.data,
        }
    }

    /// Replace the text of one field.
    pub fn set_text(&mut self, field: Field, text: impl Into<String>) {
        self.field_mut(field).pattern = text.into();
    }

    /// Flip case sensitivity of one field.
    pub fn toggle_case(&mut self, field: Field) {
        let f = self.field_mut(field);
        f.case_sensitive = !f.case_sensitive;
    }

    /// Flip literal/regex mode of one field.
    pub fn toggle_regex(&mut self, field: Field) {
        let f = self.field_mut(field);
        f.literal = !f.literal;
    }

    /// True iff at least one field has a non-empty pattern.
    #[must_use]
    pub fn is_active(&self) -> bool {
        Field::ALL.iter().any(|f| self.field(*f).is_set())
    }

    /// Compile into a filter slot; blank input compiles to [`ActiveFilter::Off`].
    ///
    /// # Errors
    /// Returns the first field that fails to compile.
    pub fn compile(&self) -> Result<ActiveFilter, FilterError> {
        CompositeFilter::compile(self).map(ActiveFilter::from)
    }

    /// Compile, treating fields that fail as pass-through.
    #[must_use]
    pub fn compile_lenient(&self) -> ActiveFilter {
        ActiveFilter::from(CompositeFilter::compile_lenient(self))
    }
}

/// AND of the origin, destination and data matchers.
#[derive(Debug, Clone, Default)]
pub struct CompositeFilter {
    origin: Matcher,
    destination: Matcher,
    data: Matcher,
}

impl CompositeFilter {
    /// Compile every field of `input`.
    ///
    /// # Errors
    /// Returns [`FilterError::InvalidField`] for the first field that fails.
    pub fn compile(input: &FilterInput) -> Result<Self, FilterError> {
        let field = |field: Field| {
            input
                .field(field)
                .compile()
                .map_err(|e| FilterError::InvalidField {
                    field,
                    source: Box::new(e),
                })
        };

        Ok(Self {
            origin: field(Field::Origin)?,
            destination: field(Field::Destination)?,
            data: field(Field::Data)?,
        })
    }

    /// Compile every field of `input`, falling back to pass-through for any
    /// field whose pattern is malformed.
    #[must_use]
    pub fn compile_lenient(input: &FilterInput) -> Self {
        let field = |field: Field| {
            input.field(field).compile().unwrap_or_else(|e| {
                tracing::warn!(%field, error = %e, "Ignoring malformed filter pattern");
                Matcher::Always
            })
        };

        Self {
            origin: field(Field::Origin),
            destination: field(Field::Destination),
            data: field(Field::Data),
        }
    }

    /// Whether every field matches `event`.
    #[must_use]
    pub fn matches(&self, event: &CapturedEvent) -> bool {
        self.origin.is_match(&event.origin)
            && self.destination.is_match(&event.destination)
            && (self.data.is_pass_through() || self.data.is_match(&event.data_text()))
    }

    /// True iff at least one field carries a real pattern.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !(self.origin.is_pass_through()
            && self.destination.is_pass_through()
            && self.data.is_pass_through())
    }
}

/// Either no filter, or a shared compiled filter.
///
/// Equality is identity: two `On` values are equal only when they share the
/// same compiled filter.
#[derive(Debug, Clone, Default)]
pub enum ActiveFilter {
    #[default]
    Off,
    On(Arc<CompositeFilter>),
}

impl ActiveFilter {
    #[must_use]
    pub const fn is_off(&self) -> bool {
        matches!(self, Self::Off)
    }

    /// Exclusion semantics: true if the event should be dropped.
    #[must_use]
    pub fn excludes(&self, event: &CapturedEvent) -> bool {
        match self {
            Self::Off => false,
            Self::On(filter) => filter.matches(event),
        }
    }

    /// Search semantics: true if the event should be shown.
    #[must_use]
    pub fn includes(&self, event: &CapturedEvent) -> bool {
        match self {
            Self::Off => true,
            Self::On(filter) => filter.matches(event),
        }
    }
}

impl From<CompositeFilter> for ActiveFilter {
    fn from(filter: CompositeFilter) -> Self {
        if filter.is_active() {
            Self::On(Arc::new(filter))
        } else {
            Self::Off
        }
    }
}

impl PartialEq for ActiveFilter {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Off, Self::Off) => true,
            (Self::On(a), Self::On(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for ActiveFilter {}
