//! Runtime version compatibility for plugins.

/// Check that `runtime` satisfies `required`, component by component.
///
/// Walks the runtime's dotted components and fails as soon as one is
/// non-numeric, its required counterpart is missing or non-numeric, or it is
/// smaller than the required one. The check is per component, not
/// lexicographic: `2.0.0` does not satisfy `1.2.0`.
pub fn check_required_version(runtime: &str, required: &str) -> bool {
    let required: Vec<&str> = required.split('.').collect();

    runtime.split('.').enumerate().all(|(i, component)| {
        let Ok(have) = component.trim().parse::<u64>() else {
            return false;
        };
        let Some(Ok(want)) = required.get(i).map(|c| c.trim().parse::<u64>()) else {
            return false;
        };
        have >= want
    })
}
