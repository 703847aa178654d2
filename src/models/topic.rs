use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub query: String,
    pub weight: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewTopic {
    pub query: String,
    pub weight: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    pub unread: i64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegativeRule {
    pub id: i64,
    pub pattern: String,
    pub penalty: f64,
    pub enabled: bool,
    pub applied_count: i64,
}

#[derive(Debug, Clone)]
pub struct NewNegativeRule {
    pub pattern: String,
    pub penalty: f64,
    pub enabled: bool,
}

/// Penalty a rule actually applies: its magnitude when enabled, zero otherwise.
pub fn effective_penalty(penalty: f64, enabled: bool) -> f64 {
    if enabled {
        penalty
    } else {
        0.0
    }
}
