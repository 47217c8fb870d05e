use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ScrapeError;
use crate::extract::FragmentData;

/// Fragments gathered for one symbol before merging. Inserts are
/// collision-checked: the same name may be recorded twice only with
/// identical content, never silently overwritten.
#[derive(Default)]
pub struct ScrapeResult {
    fragments: BTreeMap<String, FragmentData>,
}

impl ScrapeResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: FragmentData) -> Result<(), ScrapeError> {
        if let Some(existing) = self.fragments.get(name) {
            if *existing != data {
                return Err(ScrapeError::Collision {
                    name: name.to_string(),
                });
            }
            return Ok(());
        }
        self.fragments.insert(name.to_string(), data);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Names of fragments that were scraped but turned out absent on the page.
    pub fn empty_fragment_names(&self) -> Vec<String> {
        self.fragments
            .iter()
            .filter(|(_, data)| data.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Assemble the single flat document persisted for a symbol. Every scraped
/// fragment is present, empty ones as empty containers, so a missing key
/// always means "leg never fetched" rather than "section absent on page".
/// Key order is deterministic, so identical input markup yields
/// byte-identical documents.
pub fn merge_document(symbol: &str, result: &ScrapeResult) -> Value {
    let mut doc = serde_json::Map::new();
    doc.insert("symbol".to_string(), Value::String(symbol.to_string()));
    for (name, data) in &result.fragments {
        doc.insert(name.clone(), data.to_json());
    }
    Value::Object(doc)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn items(pairs: &[(&str, &str)]) -> FragmentData {
        FragmentData::Items(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn empty_fragment_kept_as_empty_container() {
        let mut result = ScrapeResult::new();
        result.insert("peers", FragmentData::Rows(Vec::new())).unwrap();
        result.insert("stock_details", items(&[("P/E", "24.3")])).unwrap();

        let doc = merge_document("TCS", &result);
        assert_eq!(doc["symbol"], "TCS");
        assert_eq!(doc["peers"], serde_json::json!([]));
        assert_eq!(doc["stock_details"]["P/E"], "24.3");
        assert_eq!(result.empty_fragment_names(), vec!["peers".to_string()]);
    }

    #[test]
    fn differing_content_under_one_name_is_collision() {
        let mut result = ScrapeResult::new();
        result.insert("ratios", items(&[("ROE", "18%")])).unwrap();
        let err = result.insert("ratios", items(&[("ROE", "12%")])).unwrap_err();
        assert!(matches!(err, ScrapeError::Collision { ref name } if name == "ratios"));
    }

    #[test]
    fn identical_content_under_one_name_is_not_collision() {
        let mut result = ScrapeResult::new();
        result.insert("ratios", items(&[("ROE", "18%")])).unwrap();
        result.insert("ratios", items(&[("ROE", "18%")])).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn merge_is_deterministic() {
        let build = || {
            let mut result = ScrapeResult::new();
            result
                .insert("b_fragment", FragmentData::Rows(vec![BTreeMap::new()]))
                .unwrap();
            result.insert("a_fragment", items(&[("k", "v")])).unwrap();
            merge_document("INFY", &result)
        };
        assert_eq!(
            serde_json::to_string(&build()).unwrap(),
            serde_json::to_string(&build()).unwrap()
        );
    }
}
