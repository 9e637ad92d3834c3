//! Dimension declarations.
//!
//! A solution declares its dimensions once: at most one step dimension
//! (usually `t`), one or more domain dimensions (`x`, `y`, `z`, ...) and any
//! number of misc dimensions. The declared kind of a dimension never changes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SolnError};

/// Per-dimension integer values keyed by dimension name.
pub type DimMap = BTreeMap<String, i64>;

/// The role a dimension plays in the solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimKind {
    /// The time-stepping dimension.
    Step,
    /// A spatial dimension partitioned across ranks.
    Domain,
    /// Any other index dimension (e.g. a component index).
    Misc,
}

impl fmt::Display for DimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Step => "step",
            Self::Domain => "domain",
            Self::Misc => "misc",
        };
        f.write_str(name)
    }
}

/// A declared dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim {
    /// Dimension name, unique within the solution.
    pub name: String,
    /// Declared kind.
    pub kind: DimKind,
}

/// The ordered set of dimensions declared by a solution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims {
    dims: Vec<Dim>,
}

impl Dims {
    /// Declares a step dimension plus the given domain dimensions.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use solnctx::dims::{DimKind, Dims};
    ///
    /// let dims = Dims::new("t", ["x", "y", "z"]);
    /// assert_eq!(dims.kind_of("t"), Some(DimKind::Step));
    /// assert_eq!(dims.domain_dims().count(), 3);
    /// ```
    pub fn new<'a>(step: &str, domain: impl IntoIterator<Item = &'a str>) -> Self {
        let mut dims = Self::default();
        dims.push(step, DimKind::Step);
        for name in domain {
            dims.push(name, DimKind::Domain);
        }
        dims
    }

    /// Adds a misc dimension.
    #[must_use]
    pub fn with_misc(mut self, name: &str) -> Self {
        self.push(name, DimKind::Misc);
        self
    }

    fn push(&mut self, name: &str, kind: DimKind) {
        if self.kind_of(name).is_none() {
            self.dims.push(Dim {
                name: name.to_string(),
                kind,
            });
        }
    }

    /// Returns the declared kind of `name`, if declared.
    pub fn kind_of(&self, name: &str) -> Option<DimKind> {
        self.dims.iter().find(|d| d.name == name).map(|d| d.kind)
    }

    /// Checks that `name` is declared with one of the `allowed` kinds.
    ///
    /// # Errors
    ///
    /// - [`SolnError::UnknownDimension`] if `name` was never declared
    /// - [`SolnError::InvalidDimensionKind`] if its kind is not in `allowed`
    pub fn check(&self, name: &str, api: &'static str, allowed: &'static [DimKind]) -> Result<DimKind> {
        let kind = self.kind_of(name).ok_or_else(|| SolnError::UnknownDimension {
            api,
            dim: name.to_string(),
        })?;
        if allowed.contains(&kind) {
            Ok(kind)
        } else {
            Err(SolnError::InvalidDimensionKind {
                api,
                dim: name.to_string(),
                actual: kind,
                allowed,
            })
        }
    }

    /// Name of the step dimension, if declared.
    pub fn step_dim(&self) -> Option<&str> {
        self.of_kind(DimKind::Step).next()
    }

    /// Names of the domain dimensions in declaration order.
    pub fn domain_dims(&self) -> impl Iterator<Item = &str> {
        self.of_kind(DimKind::Domain)
    }

    /// Names of all dimensions whose kind is in `kinds`, in declaration order.
    pub fn of_kinds<'a>(&'a self, kinds: &'a [DimKind]) -> impl Iterator<Item = &'a str> {
        self.dims
            .iter()
            .filter(move |d| kinds.contains(&d.kind))
            .map(|d| d.name.as_str())
    }

    fn of_kind(&self, kind: DimKind) -> impl Iterator<Item = &str> {
        self.dims
            .iter()
            .filter(move |d| d.kind == kind)
            .map(|d| d.name.as_str())
    }

    /// All declared dimensions.
    pub fn iter(&self) -> impl Iterator<Item = &Dim> {
        self.dims.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declaration_order_and_kinds() {
        let dims = Dims::new("t", ["x", "y"]).with_misc("m");
        let names: Vec<_> = dims.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["t", "x", "y", "m"]);
        assert_eq!(dims.step_dim(), Some("t"));
        assert_eq!(dims.kind_of("m"), Some(DimKind::Misc));
        assert_eq!(dims.kind_of("w"), None);
    }

    #[test]
    fn test_redeclaration_keeps_original_kind() {
        let dims = Dims::new("t", ["x"]).with_misc("x");
        assert_eq!(dims.kind_of("x"), Some(DimKind::Domain));
        assert_eq!(dims.iter().count(), 2);
    }

    #[test]
    fn test_check_rejects_wrong_kind() {
        let dims = Dims::new("t", ["x"]);
        let err = dims.check("t", "num_ranks", &[DimKind::Domain]).unwrap_err();
        assert!(matches!(
            err,
            SolnError::InvalidDimensionKind { actual: DimKind::Step, .. }
        ));
        assert!(matches!(
            dims.check("q", "num_ranks", &[DimKind::Domain]),
            Err(SolnError::UnknownDimension { .. })
        ));
        assert_eq!(
            dims.check("x", "num_ranks", &[DimKind::Domain]).unwrap(),
            DimKind::Domain
        );
    }
}
