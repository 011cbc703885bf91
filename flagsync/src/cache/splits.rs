use super::RuleCache;
use crate::error::SyncError;
use crate::types::{ChangeNumber, Split};
use std::collections::{BTreeSet, HashMap};

pub type SplitCache = RuleCache<Split>;

impl RuleCache<Split> {
    /// Marks a flag as killed ahead of the fetch that will deliver its new
    /// definition. Does nothing if the cached flag is already at or past
    /// `change_number`, and never moves the cache watermark.
    pub fn kill_locally(
        &self,
        name: &str,
        default_treatment: &str,
        change_number: ChangeNumber,
    ) -> Result<bool, SyncError> {
        self.update_item(name, |split| {
            if split.change_number >= change_number {
                return None;
            }
            let mut killed = split.clone();
            killed.killed = true;
            killed.default_treatment = default_treatment.to_string();
            killed.change_number = change_number;
            Some(killed)
        })
    }

    /// Flag names grouped by the requested flag sets. Sets with no flags map to an
    /// empty list.
    pub fn names_by_flag_sets(&self, sets: &[&str]) -> HashMap<String, BTreeSet<String>> {
        let mut result: HashMap<String, BTreeSet<String>> = sets
            .iter()
            .map(|s| (s.to_string(), BTreeSet::new()))
            .collect();

        self.with_items(|items| {
            for split in items.values() {
                let Some(flag_sets) = &split.sets else {
                    continue;
                };
                for set in flag_sets {
                    if let Some(names) = result.get_mut(set) {
                        names.insert(split.name.clone());
                    }
                }
            }
        });

        result
    }

    /// Rule-based segments referenced by any cached flag.
    pub fn rule_based_segment_names(&self) -> BTreeSet<String> {
        self.with_items(|items| {
            items
                .values()
                .flat_map(|s| s.rule_based_segment_names())
                .collect()
        })
    }
}
