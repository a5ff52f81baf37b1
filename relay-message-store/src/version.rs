use std::cmp::Ordering;

/// Compares two dot-separated numeric API version strings (`"3.2"` vs
/// `"3.10"`), grounded on `landscape.lib.versioning.sort_versions` /
/// `is_version_higher`, which compare field-by-field as integers rather than
/// lexicographically.
pub fn compare(a: &str, b: &str) -> Ordering {
    let mut a_fields = a.split('.').map(|f| f.parse::<u64>().unwrap_or(0));
    let mut b_fields = b.split('.').map(|f| f.parse::<u64>().unwrap_or(0));
    loop {
        match (a_fields.next(), b_fields.next()) {
            (None, None) => return Ordering::Equal,
            (Some(x), None) => {
                if x != 0 {
                    return Ordering::Greater;
                }
            }
            (None, Some(y)) => {
                if y != 0 {
                    return Ordering::Less;
                }
            }
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// True if `candidate <= reference` under [`compare`] — the "reference
/// version is high enough to speak this candidate version" test used to
/// pick schemas and gate `get_pending_messages` by API homogeneity.
pub fn is_at_most(candidate: &str, reference: &str) -> bool {
    compare(candidate, reference) != Ordering::Greater
}
