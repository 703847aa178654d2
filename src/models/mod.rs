mod article;
mod topic;

pub use article::{Article, ArticleHit, ArticleStatus, DedupeStats, StatusCounts};
pub use topic::{effective_penalty, NegativeRule, NewNegativeRule, NewTopic, Topic, TopicStats};
