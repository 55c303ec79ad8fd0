//! Environment slices
//!
//! Every series is scoped by an optional environment. A write to environment
//! `e` is applied twice: once to the `Some(e)` slice and once to the `None`
//! slice, which therefore accumulates all environments of a key. Clearing
//! operations (delete, merge) likewise always include the `None` slice in
//! addition to whatever environments the caller names.
//!
//! The aggregate algebras call into this module explicitly rather than the
//! store doing the duplication behind their back.

/// Identifier of an environment.
pub type EnvironmentId = u64;

/// The slices a write scoped to `environment` lands in.
///
/// The named slice comes first, the global `None` slice last. A write with no
/// environment lands in the global slice only once.
pub fn write_targets(
    environment: Option<EnvironmentId>,
) -> impl Iterator<Item = Option<EnvironmentId>> {
    environment.map(Some).into_iter().chain(std::iter::once(None))
}

/// The slices a delete or merge scoped to `environments` clears.
///
/// Always contains `None`, followed by each distinct named environment in the
/// order given.
#[must_use]
pub fn clear_targets(environments: Option<&[EnvironmentId]>) -> Vec<Option<EnvironmentId>> {
    let mut targets = vec![None];
    for environment in environments.unwrap_or_default() {
        let target = Some(*environment);
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}
