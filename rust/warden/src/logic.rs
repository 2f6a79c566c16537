//! Boolean algebra shared by both execution modes.
//!
//! The in-memory evaluator folds clauses into `bool`s, the query compiler
//! folds the very same clauses into [`crate::query::Expr`] trees. Both go
//! through [`any`] and [`all`] so the fold order and the simplifications
//! (`false AND x = false`, `true OR x = true`, ...) are identical, and an
//! already decided accumulator stops the fold in both modes.

/// A value that can be combined with boolean connectives
pub trait Logic: Sized {
    /// The value that always holds.
    fn always() -> Self;

    /// The value that never holds.
    fn never() -> Self;

    /// Returns `true` if this value is known to always hold.
    fn is_always(&self) -> bool;

    /// Returns `true` if this value is known to never hold.
    fn is_never(&self) -> bool;

    /// Conjunction. Implementations must simplify `never AND x` to `never`
    /// and `always AND x` to `x`.
    fn and(self, other: Self) -> Self;

    /// Disjunction. Implementations must simplify `always OR x` to `always`
    /// and `never OR x` to `x`.
    fn or(self, other: Self) -> Self;

    /// Negation.
    fn not(self) -> Self;
}

impl Logic for bool {
    fn always() -> Self {
        true
    }

    fn never() -> Self {
        false
    }

    fn is_always(&self) -> bool {
        *self
    }

    fn is_never(&self) -> bool {
        !*self
    }

    fn and(self, other: Self) -> Self {
        self && other
    }

    fn or(self, other: Self) -> Self {
        self || other
    }

    fn not(self) -> Self {
        !self
    }
}

/// Folds items with OR, starting from [`Logic::never`]. Stops as soon as
/// the accumulator always holds.
pub fn any<L, T, E>(
    items: impl IntoIterator<Item = T>,
    mut each: impl FnMut(T) -> Result<L, E>,
) -> Result<L, E>
where
    L: Logic,
{
    let mut result = L::never();
    for item in items {
        if result.is_always() {
            break;
        }
        result = result.or(each(item)?);
    }
    Ok(result)
}

/// Folds items with AND, starting from [`Logic::always`]. Stops as soon as
/// the accumulator never holds.
pub fn all<L, T, E>(
    items: impl IntoIterator<Item = T>,
    mut each: impl FnMut(T) -> Result<L, E>,
) -> Result<L, E>
where
    L: Logic,
{
    let mut result = L::always();
    for item in items {
        if result.is_never() {
            break;
        }
        result = result.and(each(item)?);
    }
    Ok(result)
}

/// Combines the outcome of a rule's allow and deny lists:
/// `allowed AND NOT denied`. The deny list is only consulted when something
/// may be allowed.
pub fn permit<L, E>(
    allowed: L,
    denied: impl FnOnce() -> Result<L, E>,
) -> Result<L, E>
where
    L: Logic,
{
    if allowed.is_never() {
        return Ok(allowed);
    }
    Ok(allowed.and(denied()?.not()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_empty_folds() {
        let none: [bool; 0] = [];
        assert_eq!(any(none, Ok::<_, Infallible>), Ok(false));
        assert_eq!(all(none, Ok::<_, Infallible>), Ok(true));
    }

    #[test]
    fn test_any_short_circuits_on_first_match() {
        let mut visited = vec![];
        let result = any([false, true, false], |value| {
            visited.push(value);
            Ok::<_, Infallible>(value)
        });

        assert_eq!(result, Ok(true));
        assert_eq!(visited, vec![false, true]);
    }

    #[test]
    fn test_all_short_circuits_on_first_failure() {
        let mut visited = 0;
        let result = all([true, false, true], |value| {
            visited += 1;
            Ok::<_, Infallible>(value)
        });

        assert_eq!(result, Ok(false));
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_errors_propagate() {
        let result: Result<bool, &str> = all([true, true], |_| Err("boom"));
        assert_eq!(result, Err("boom"));
    }

    #[test]
    fn test_permit_skips_deny_when_nothing_is_allowed() {
        let result = permit(false, || -> Result<bool, &str> { Err("not consulted") });
        assert_eq!(result, Ok(false));

        assert_eq!(permit(true, || Ok::<_, Infallible>(true)), Ok(false));
        assert_eq!(permit(true, || Ok::<_, Infallible>(false)), Ok(true));
    }
}
