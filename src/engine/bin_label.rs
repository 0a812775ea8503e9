use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tracing::warn;

pub const DEFAULT_PASS_BIN_CODE: u32 = 1;

/// Zero-padded code, suffixed with `_<name>` when a non-blank name exists.
pub fn bin_label(code: u32, name: Option<&str>) -> String {
    let padded = format!("{code:02}");
    match name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => format!("{padded}_{name}"),
        None => padded,
    }
}

/// Labels for every bin code seen in one query result.
///
/// The first label observed for a code wins; later records carrying a
/// different name for the same code are counted and logged.
#[derive(Debug, Clone, Default)]
pub struct BinLabels {
    labels: BTreeMap<u32, String>,
    pass_code: u32,
    duplicate_names: usize,
}

impl BinLabels {
    pub fn resolve<'a, I>(observations: I, pass_code: u32) -> Self
    where
        I: IntoIterator<Item = (u32, Option<&'a str>)>,
    {
        let mut labels = BTreeMap::new();
        let mut duplicate_names = 0;

        for (code, name) in observations {
            let label = bin_label(code, name);
            match labels.entry(code) {
                Entry::Vacant(slot) => {
                    slot.insert(label);
                }
                Entry::Occupied(existing) => {
                    if *existing.get() != label {
                        duplicate_names += 1;
                        warn!(
                            bin_code = code,
                            kept = %existing.get(),
                            ignored = %label,
                            "conflicting bin names for one code; keeping first seen"
                        );
                    }
                }
            }
        }

        Self {
            labels,
            pass_code,
            duplicate_names,
        }
    }

    pub fn label(&self, code: u32) -> Option<&str> {
        self.labels.get(&code).map(String::as_str)
    }

    /// `None` when no record carries the pass code; pass rate is then undefined.
    pub fn pass_label(&self) -> Option<&str> {
        self.label(self.pass_code)
    }

    pub fn pass_code(&self) -> u32 {
        self.pass_code
    }

    /// Non-pass codes with their labels, in ascending code order.
    pub fn fail_bins(&self) -> Vec<(u32, String)> {
        self.labels
            .iter()
            .filter(|(code, _)| **code != self.pass_code)
            .map(|(code, label)| (*code, label.clone()))
            .collect()
    }

    pub fn duplicate_names(&self) -> usize {
        self.duplicate_names
    }
}
