//! Domain-name bucketing for the certificates-per-name limit.

use std::collections::BTreeSet;

/// Names partitioned by how the per-name limit counts them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamePartition {
    /// Registered domains (eTLD+1); issuance under any subdomain counts
    /// against this bucket.
    pub registered: Vec<String>,

    /// Names that are themselves public suffixes (e.g. `co.uk`). These get
    /// exact-match counting so one busy suffix cannot starve unrelated names
    /// beneath it.
    pub exact_suffixes: Vec<String>,
}

/// Buckets each name by its registered domain, splitting out names that are
/// themselves public suffixes. Duplicate buckets collapse.
pub fn partition_by_registered_domain<'a>(
    names: impl IntoIterator<Item = &'a str>,
) -> NamePartition {
    let mut registered = BTreeSet::new();
    let mut exact_suffixes = BTreeSet::new();

    for name in names {
        match psl::domain_str(name) {
            Some(domain) => {
                registered.insert(domain.to_owned());
            }
            // The name has no registrable label above the suffix list, so it
            // is a public suffix itself.
            None => {
                exact_suffixes.insert(name.to_owned());
            }
        }
    }

    NamePartition {
        registered: registered.into_iter().collect(),
        exact_suffixes: exact_suffixes.into_iter().collect(),
    }
}
