//! Delivery Reports
//!
//! The merged outcome of one change fanned out to many peers. Delivery
//! problems never abort the fan-out; each peer contributes an entry.

use crate::domain::NodeName;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryEntry {
    pub node: NodeName,
    pub level: ReportLevel,
    pub message: String,
}

/// Per-peer entries of one notification round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub entries: Vec<DeliveryEntry>,
}

impl DeliveryReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, node: &NodeName, message: impl Into<String>) {
        self.push(node, ReportLevel::Info, message);
    }

    pub fn warning(&mut self, node: &NodeName, message: impl Into<String>) {
        self.push(node, ReportLevel::Warning, message);
    }

    pub fn error(&mut self, node: &NodeName, message: impl Into<String>) {
        self.push(node, ReportLevel::Error, message);
    }

    fn push(&mut self, node: &NodeName, level: ReportLevel, message: impl Into<String>) {
        self.entries.push(DeliveryEntry {
            node: node.clone(),
            level,
            message: message.into(),
        });
    }

    pub fn merge(&mut self, other: DeliveryReport) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &DeliveryEntry> {
        self.entries
            .iter()
            .filter(|e| e.level == ReportLevel::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|e| e.level == ReportLevel::Error)
    }

    /// Entries concerning `node`
    pub fn for_node<'a>(&'a self, node: &'a NodeName) -> impl Iterator<Item = &'a DeliveryEntry> {
        self.entries.iter().filter(move |e| e.node == *node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_and_filter() {
        let a = NodeName::new("node-a");
        let b = NodeName::new("node-b");

        let mut report = DeliveryReport::new();
        report.info(&a, "queued for shared pool");
        let mut other = DeliveryReport::new();
        other.warning(&b, "not connected");
        report.merge(other);

        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.warnings().count(), 1);
        assert!(!report.has_errors());
        assert_eq!(report.for_node(&b).next().unwrap().message, "not connected");
    }
}
