use std::collections::BTreeMap;
use std::fmt;

/// Equality-based label selector (`k1=v1,k2=v2`), keys kept sorted so the
/// rendered form is stable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }

    pub fn single(key: &str, value: &str) -> Self {
        Self(BTreeMap::from([(key.to_string(), value.to_string())]))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for LabelSelector {
    fn from(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}
