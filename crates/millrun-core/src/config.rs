//! Workflow configuration and its static validator
//!
//! The validator runs when a script is saved; activation serializes the
//! resulting [`WorkflowConfig`] onto the workflow row and every session
//! reparses it through the same code path. Maps preserve declaration
//! order: consumer selection during a session walks consumers in config
//! order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::HandlerKind;
use crate::schedule::{ScheduleError, ScheduleSpec};

/// Errors from config parsing or validation
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("config is not valid JSON for the expected shape: {0}")]
    Shape(String),

    #[error("workflow declares no producers and no consumers")]
    Empty,

    #[error("duplicate handler name {0:?}")]
    DuplicateHandler(String),

    #[error("duplicate topic {0:?}")]
    DuplicateTopic(String),

    #[error("producer {producer:?}: {source}")]
    Schedule {
        producer: String,
        source: ScheduleError,
    },

    #[error("{handler:?} references undeclared topic {topic:?}")]
    UndeclaredTopic { handler: String, topic: String },

    #[error("consumer {0:?} subscribes to no topics")]
    NoSubscriptions(String),
}

impl From<ConfigError> for crate::error::ClassifiedError {
    fn from(err: ConfigError) -> Self {
        crate::error::ClassifiedError::logic(err.to_string())
    }
}

/// Raw schedule shape as it appears in `handler_config` JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScheduleDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cron: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProducerDoc {
    schedule: ScheduleDoc,
    #[serde(default)]
    publishes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConsumerDoc {
    subscribe: Vec<String>,
    #[serde(default)]
    publishes: Option<Vec<String>>,
    #[serde(default, rename = "hasMutate")]
    has_mutate: bool,
    #[serde(default, rename = "hasNext")]
    has_next: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigDoc {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    producers: IndexMap<String, ProducerDoc>,
    #[serde(default)]
    consumers: IndexMap<String, ConsumerDoc>,
}

/// A validated producer declaration
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    pub schedule: ScheduleSpec,

    /// Topics this producer may publish to; `None` = any declared topic
    pub publishes: Option<Vec<String>>,
}

/// A validated consumer declaration
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub subscribe: Vec<String>,

    /// Topics this consumer's `next` may publish to; `None` = any declared
    pub publishes: Option<Vec<String>>,
    pub has_mutate: bool,
    pub has_next: bool,
}

/// The validated topology of one workflow script
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowConfig {
    pub topics: Vec<String>,
    pub producers: IndexMap<String, ProducerConfig>,
    pub consumers: IndexMap<String, ConsumerConfig>,
}

impl WorkflowConfig {
    /// Parse and validate the `handler_config` JSON shape
    pub fn parse(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let doc: ConfigDoc = serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::Shape(e.to_string()))?;
        Self::from_doc(doc)
    }

    fn from_doc(doc: ConfigDoc) -> Result<Self, ConfigError> {
        if doc.producers.is_empty() && doc.consumers.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut topics = Vec::with_capacity(doc.topics.len());
        for topic in &doc.topics {
            if topics.contains(topic) {
                return Err(ConfigError::DuplicateTopic(topic.clone()));
            }
            topics.push(topic.clone());
        }

        let mut producers = IndexMap::with_capacity(doc.producers.len());
        for (name, p) in doc.producers {
            if doc.consumers.contains_key(&name) {
                return Err(ConfigError::DuplicateHandler(name));
            }
            let schedule = ScheduleSpec::from_config(
                p.schedule.interval.as_deref(),
                p.schedule.cron.as_deref(),
            )
            .map_err(|source| ConfigError::Schedule {
                producer: name.clone(),
                source,
            })?;
            if let Some(publishes) = &p.publishes {
                for topic in publishes {
                    if !topics.contains(topic) {
                        return Err(ConfigError::UndeclaredTopic {
                            handler: name.clone(),
                            topic: topic.clone(),
                        });
                    }
                }
            }
            producers.insert(
                name,
                ProducerConfig {
                    schedule,
                    publishes: p.publishes,
                },
            );
        }

        let mut consumers = IndexMap::with_capacity(doc.consumers.len());
        for (name, c) in doc.consumers {
            if c.subscribe.is_empty() {
                return Err(ConfigError::NoSubscriptions(name));
            }
            for topic in c.subscribe.iter().chain(c.publishes.iter().flatten()) {
                if !topics.contains(topic) {
                    return Err(ConfigError::UndeclaredTopic {
                        handler: name.clone(),
                        topic: topic.clone(),
                    });
                }
            }
            consumers.insert(
                name,
                ConsumerConfig {
                    subscribe: c.subscribe,
                    publishes: c.publishes,
                    has_mutate: c.has_mutate,
                    has_next: c.has_next,
                },
            );
        }

        Ok(Self {
            topics,
            producers,
            consumers,
        })
    }

    /// Serialize back to the stored `handler_config` shape
    pub fn to_json(&self) -> serde_json::Value {
        let producers: serde_json::Map<String, serde_json::Value> = self
            .producers
            .iter()
            .map(|(name, p)| {
                let schedule = match &p.schedule {
                    ScheduleSpec::Interval(d) => {
                        serde_json::json!({ "interval": format!("{}s", d.as_secs()) })
                    }
                    ScheduleSpec::Cron(expr) => serde_json::json!({ "cron": expr }),
                };
                let mut obj = serde_json::json!({ "schedule": schedule });
                if let Some(publishes) = &p.publishes {
                    obj["publishes"] = serde_json::json!(publishes);
                }
                (name.clone(), obj)
            })
            .collect();

        let consumers: serde_json::Map<String, serde_json::Value> = self
            .consumers
            .iter()
            .map(|(name, c)| {
                let mut obj = serde_json::json!({
                    "subscribe": c.subscribe,
                    "hasMutate": c.has_mutate,
                    "hasNext": c.has_next,
                });
                if let Some(publishes) = &c.publishes {
                    obj["publishes"] = serde_json::json!(publishes);
                }
                (name.clone(), obj)
            })
            .collect();

        serde_json::json!({
            "topics": self.topics,
            "producers": producers,
            "consumers": consumers,
        })
    }

    /// Consumers subscribed to `topic`, in config order
    pub fn consumers_subscribing<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a str> {
        self.consumers
            .iter()
            .filter(move |(_, c)| c.subscribe.iter().any(|t| t == topic))
            .map(|(name, _)| name.as_str())
    }

    /// Whether `handler` may publish to `topic`
    ///
    /// The topic must be declared; when the handler enumerates a
    /// `publishes` set, the topic must additionally be in it.
    pub fn may_publish(&self, kind: HandlerKind, handler: &str, topic: &str) -> bool {
        if !self.topics.iter().any(|t| t == topic) {
            return false;
        }
        let publishes = match kind {
            HandlerKind::Producer => self.producers.get(handler).map(|p| p.publishes.as_ref()),
            HandlerKind::Consumer => self.consumers.get(handler).map(|c| c.publishes.as_ref()),
        };
        match publishes {
            // Unknown handler name: deny
            None => false,
            // No declared set: any declared topic is fair game
            Some(None) => true,
            Some(Some(set)) => set.iter().any(|t| t == topic),
        }
    }
}
