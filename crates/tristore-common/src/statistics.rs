//! Hierarchical key/value reports describing component memory usage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value of one statistics item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatisticValue {
    Integer(u64),
    Float(f64),
    Text(String),
}

impl fmt::Display for StatisticValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatisticValue::Integer(value) => write!(f, "{}", value),
            StatisticValue::Float(value) => write!(f, "{:.2}", value),
            StatisticValue::Text(value) => f.write_str(value),
        }
    }
}

/// Named report with ordered items and nested subcomponent reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatistics {
    name: String,
    items: Vec<(String, StatisticValue)>,
    subcomponents: Vec<ComponentStatistics>,
}

impl ComponentStatistics {
    /// Creates an empty report.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
            subcomponents: Vec::new(),
        }
    }

    /// Returns the component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_integer_item(&mut self, key: impl Into<String>, value: u64) {
        self.items.push((key.into(), StatisticValue::Integer(value)));
    }

    pub fn add_float_item(&mut self, key: impl Into<String>, value: f64) {
        self.items.push((key.into(), StatisticValue::Float(value)));
    }

    pub fn add_text_item(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.push((key.into(), StatisticValue::Text(value.into())));
    }

    pub fn add_subcomponent(&mut self, subcomponent: ComponentStatistics) {
        self.subcomponents.push(subcomponent);
    }

    /// Looks up an item by key.
    pub fn item(&self, key: &str) -> Option<&StatisticValue> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns an integer item, or 0 if it is missing or not an integer.
    pub fn integer_value(&self, key: &str) -> u64 {
        match self.item(key) {
            Some(StatisticValue::Integer(value)) => *value,
            _ => 0,
        }
    }

    /// Returns a float item, if present.
    pub fn float_value(&self, key: &str) -> Option<f64> {
        match self.item(key) {
            Some(StatisticValue::Float(value)) => Some(*value),
            _ => None,
        }
    }

    /// Returns all items in insertion order.
    pub fn items(&self) -> &[(String, StatisticValue)] {
        &self.items
    }

    /// Returns nested reports.
    pub fn subcomponents(&self) -> &[ComponentStatistics] {
        &self.subcomponents
    }

    /// Finds a direct subcomponent by name.
    pub fn subcomponent(&self, name: &str) -> Option<&ComponentStatistics> {
        self.subcomponents.iter().find(|s| s.name == name)
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        writeln!(f, "{}{}", indent, self.name)?;
        for (key, value) in &self.items {
            writeln!(f, "{}  {}: {}", indent, key, value)?;
        }
        for subcomponent in &self.subcomponents {
            subcomponent.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for ComponentStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_and_lookup() {
        let mut stats = ComponentStatistics::new("ConcurrentTripleList");
        stats.add_integer_item("Size", 4096);
        stats.add_float_item("Bytes per triple", 51.0);
        stats.add_text_item("Layout", "segmented");

        assert_eq!(stats.name(), "ConcurrentTripleList");
        assert_eq!(stats.integer_value("Size"), 4096);
        assert_eq!(stats.float_value("Bytes per triple"), Some(51.0));
        assert_eq!(stats.integer_value("Missing"), 0);
        assert_eq!(stats.items().len(), 3);
    }

    #[test]
    fn test_subcomponents_and_display() {
        let mut child = ComponentStatistics::new("ThreeKeysManager");
        child.add_integer_item("Size", 8);

        let mut parent = ComponentStatistics::new("TripleTable");
        parent.add_integer_item("Aggregate size", 8);
        parent.add_subcomponent(child);

        assert!(parent.subcomponent("ThreeKeysManager").is_some());
        let rendered = parent.to_string();
        assert!(rendered.starts_with("TripleTable\n"));
        assert!(rendered.contains("  Aggregate size: 8"));
        assert!(rendered.contains("  ThreeKeysManager\n"));
        assert!(rendered.contains("    Size: 8"));
    }
}
