use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::SYSTEM_TOPIC_PREFIX;

/// Direction of a declared edge between an origin and a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Emit,
    Subscribe,
}

#[derive(Debug, Clone)]
struct Declaration {
    origin: String,
    topic: String,
    direction: Direction,
}

/// Accumulated emit/subscribe graph across registered components.
///
/// Origins are symbolic labels such as `route:GET /orders`,
/// `event:auditor`, or `cron:sweeper`. The graph only knows *declared*
/// topics: an `emit` with a dynamically computed topic inside a handler
/// opts out of validation.
///
/// `Topology` is `Clone` and shares its state, so every registration
/// surface can feed the same instance.
#[derive(Clone, Default)]
pub struct Topology {
    declarations: Arc<Mutex<Vec<Declaration>>>,
}

/// Validation failure: topics declared on only one side of the graph.
#[derive(Debug)]
pub struct TopologyError {
    /// topic → origins that declare emitting it, with no subscriber.
    pub emit_only: BTreeMap<String, Vec<String>>,
    /// topic → origins that subscribe to it, with no emitter.
    pub subscribe_only: BTreeMap<String, Vec<String>>,
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "event graph validation failed:")?;
        for (topic, origins) in &self.emit_only {
            writeln!(
                f,
                "  '{topic}' is emitted but never subscribed (by {})",
                origins.join(", ")
            )?;
        }
        for (topic, origins) in &self.subscribe_only {
            writeln!(
                f,
                "  '{topic}' is subscribed but never emitted (by {})",
                origins.join(", ")
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for TopologyError {}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_emit(&self, origin: impl Into<String>, topic: impl Into<String>) {
        self.declarations.lock().unwrap().push(Declaration {
            origin: origin.into(),
            topic: topic.into(),
            direction: Direction::Emit,
        });
    }

    pub fn declare_subscribe(&self, origin: impl Into<String>, topic: impl Into<String>) {
        self.declarations.lock().unwrap().push(Declaration {
            origin: origin.into(),
            topic: topic.into(),
            direction: Direction::Subscribe,
        });
    }

    /// Compare emit and subscribe sets, ignoring reserved system topics.
    ///
    /// Fails fast listing every one-sided topic and the origins that
    /// declared it.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let declarations = self.declarations.lock().unwrap();
        let mut emits: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut subscribes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for d in declarations.iter() {
            if d.topic.starts_with(SYSTEM_TOPIC_PREFIX) {
                continue;
            }
            let target = match d.direction {
                Direction::Emit => &mut emits,
                Direction::Subscribe => &mut subscribes,
            };
            target.entry(d.topic.clone()).or_default().push(d.origin.clone());
        }

        let emit_only: BTreeMap<String, Vec<String>> = emits
            .iter()
            .filter(|(topic, _)| !subscribes.contains_key(*topic))
            .map(|(t, o)| (t.clone(), o.clone()))
            .collect();
        let subscribe_only: BTreeMap<String, Vec<String>> = subscribes
            .iter()
            .filter(|(topic, _)| !emits.contains_key(*topic))
            .map(|(t, o)| (t.clone(), o.clone()))
            .collect();

        if emit_only.is_empty() && subscribe_only.is_empty() {
            Ok(())
        } else {
            Err(TopologyError {
                emit_only,
                subscribe_only,
            })
        }
    }

    /// Render the accumulated graph as DOT for introspection.
    pub fn to_dot(&self) -> String {
        let declarations = self.declarations.lock().unwrap();
        let mut out = String::from("digraph events {\n  rankdir=LR;\n");
        let mut topics: Vec<&str> = declarations
            .iter()
            .map(|d| d.topic.as_str())
            .collect();
        topics.sort_unstable();
        topics.dedup();
        for topic in topics {
            out.push_str(&format!("  \"{topic}\" [shape=box];\n"));
        }
        for d in declarations.iter() {
            match d.direction {
                Direction::Emit => {
                    out.push_str(&format!("  \"{}\" -> \"{}\";\n", d.origin, d.topic))
                }
                Direction::Subscribe => {
                    out.push_str(&format!("  \"{}\" -> \"{}\";\n", d.topic, d.origin))
                }
            }
        }
        out.push_str("}\n");
        out
    }
}
