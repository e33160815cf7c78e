//! Name filters attached to directory zones.

use regex::Regex;

/// How a [`Filter`]'s text is interpreted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FilterKind {
    /// The text must equal the target, e.g. `myfile.txt`.
    #[default]
    Exact,
    /// The text is a regular expression that must match the whole target,
    /// e.g. `.*\.txt`.
    Regex,
}

/// A single include or exclude filter of a directory zone.
///
/// By default a filter is applied to the basename of the examined entry.
/// With [`apply_to_path`](Filter::apply_to_path) set it is applied to the
/// full absolute path instead, so a pattern like `.*B.*` can select
/// `/A/B/C` by its middle component.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    /// How [`text`](Filter::text) is interpreted.
    pub kind: FilterKind,
    /// The filter text: a literal name or a regular expression.
    pub text: String,
    /// Match against the full path rather than the basename.
    pub apply_to_path: bool,
    compiled: Option<Regex>,
}

impl Filter {
    /// Creates an exact-name filter.
    pub fn exact(text: impl Into<String>) -> Filter {
        Filter {
            kind: FilterKind::Exact,
            text: text.into(),
            ..Filter::default()
        }
    }

    /// Creates a regular-expression filter.
    pub fn regex(text: impl Into<String>) -> Filter {
        Filter {
            kind: FilterKind::Regex,
            text: text.into(),
            ..Filter::default()
        }
    }

    /// Makes the filter match against the full path.
    pub fn applied_to_path(mut self) -> Filter {
        self.apply_to_path = true;
        self
    }

    /// Compiles the regular expression, anchored to the whole target.
    ///
    /// Called when the owning zone is added; a filter that fails to compile
    /// rejects the zone.
    pub(crate) fn compile(&mut self) -> Result<(), String> {
        if self.kind != FilterKind::Regex {
            return Ok(());
        }
        let anchored = format!("^(?:{})$", self.text);
        match Regex::new(&anchored) {
            Ok(regex) => {
                self.compiled = Some(regex);
                Ok(())
            }
            Err(err) => Err(format!("Invalid filter pattern '{}': {err}", self.text)),
        }
    }

    /// Whether this filter matches the given entry.
    pub(crate) fn matches(&self, name: &str, path: &str) -> bool {
        let target = if self.apply_to_path { path } else { name };
        match self.kind {
            FilterKind::Exact => target == self.text,
            FilterKind::Regex => match &self.compiled {
                Some(regex) => regex.is_match(target),
                None => false,
            },
        }
    }
}

/// Whether any filter in the list matches; an empty list matches nothing.
pub(crate) fn any_match(filters: &[Filter], name: &str, path: &str) -> bool {
    filters.iter().any(|f| f.matches(name, path))
}
