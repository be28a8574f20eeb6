use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::envelope::Envelope;

/// A boxed envelope stream, the currency of operator pipelines.
pub type EnvelopeStream = BoxStream<'static, Envelope>;

/// One stage of a subscription's operator pipeline.
///
/// Operators transform or filter the stream of envelopes between
/// publication and handler invocation. They must preserve run and trace
/// context on envelopes they pass through; the built-ins do, and
/// dropping an envelope is safe because its run token releases on drop.
pub trait Operator: Send + Sync {
    fn apply(&self, input: EnvelopeStream) -> EnvelopeStream;
}

/// Compose a pipeline over a source stream, first operator outermost.
pub fn pipe(ops: &[Arc<dyn Operator>], source: EnvelopeStream) -> EnvelopeStream {
    let mut stream = source;
    for op in ops {
        stream = op.apply(stream);
    }
    stream
}

/// Keep only envelopes whose payload satisfies the predicate.
pub struct Filter {
    predicate: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
}

impl Filter {
    pub fn new(predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            predicate: Arc::new(predicate),
        })
    }
}

impl Operator for Filter {
    fn apply(&self, input: EnvelopeStream) -> EnvelopeStream {
        let predicate = Arc::clone(&self.predicate);
        input
            .filter(move |env| {
                let keep = predicate(&env.data);
                async move { keep }
            })
            .boxed()
    }
}

/// Transform the payload, keeping run and trace context.
pub struct MapData {
    map: Arc<dyn Fn(Value) -> Value + Send + Sync>,
}

impl MapData {
    pub fn new(map: impl Fn(Value) -> Value + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { map: Arc::new(map) })
    }
}

impl Operator for MapData {
    fn apply(&self, input: EnvelopeStream) -> EnvelopeStream {
        let map = Arc::clone(&self.map);
        input
            .map(move |env| {
                let data = map(env.data.clone());
                env.with_data(data)
            })
            .boxed()
    }
}

/// Hold each envelope for a fixed duration before passing it on.
pub struct Delay {
    duration: Duration,
}

impl Delay {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self { duration })
    }
}

impl Operator for Delay {
    fn apply(&self, input: EnvelopeStream) -> EnvelopeStream {
        let duration = self.duration;
        input
            .then(move |env| async move {
                tokio::time::sleep(duration).await;
                env
            })
            .boxed()
    }
}

/// Observe envelopes without changing them.
pub struct Tap {
    observe: Arc<dyn Fn(&Envelope) + Send + Sync>,
}

impl Tap {
    pub fn new(observe: impl Fn(&Envelope) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            observe: Arc::new(observe),
        })
    }
}

impl Operator for Tap {
    fn apply(&self, input: EnvelopeStream) -> EnvelopeStream {
        let observe = Arc::clone(&self.observe);
        input
            .map(move |env| {
                observe(&env);
                env
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelopes(values: Vec<Value>) -> EnvelopeStream {
        futures_util::stream::iter(values.into_iter().map(Envelope::new)).boxed()
    }

    async fn collect(stream: EnvelopeStream) -> Vec<Value> {
        stream.map(|env| env.data).collect().await
    }

    #[tokio::test]
    async fn filter_drops_non_matching() {
        let ops: Vec<Arc<dyn Operator>> =
            vec![Filter::new(|v| v.as_i64().is_some_and(|n| n % 2 == 0))];
        let out = collect(pipe(&ops, envelopes(vec![json!(1), json!(2), json!(3), json!(4)])))
            .await;
        assert_eq!(out, vec![json!(2), json!(4)]);
    }

    #[tokio::test]
    async fn map_transforms_payload_in_order() {
        let ops: Vec<Arc<dyn Operator>> =
            vec![MapData::new(|v| json!(v.as_i64().unwrap() * 10))];
        let out = collect(pipe(&ops, envelopes(vec![json!(1), json!(2)]))).await;
        assert_eq!(out, vec![json!(10), json!(20)]);
    }

    #[tokio::test]
    async fn operators_compose_left_to_right() {
        let ops: Vec<Arc<dyn Operator>> = vec![
            Filter::new(|v| v.as_i64().unwrap() > 1),
            MapData::new(|v| json!(v.as_i64().unwrap() + 100)),
        ];
        let out = collect(pipe(&ops, envelopes(vec![json!(1), json!(2), json!(3)]))).await;
        assert_eq!(out, vec![json!(102), json!(103)]);
    }

    #[tokio::test]
    async fn tap_observes_every_envelope() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let ops: Vec<Arc<dyn Operator>> = vec![Tap::new(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        })];
        let out = collect(pipe(&ops, envelopes(vec![json!(1), json!(2), json!(3)]))).await;
        assert_eq!(out.len(), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn delay_preserves_order() {
        let ops: Vec<Arc<dyn Operator>> = vec![Delay::new(Duration::from_millis(1))];
        let out = collect(pipe(&ops, envelopes(vec![json!("a"), json!("b")]))).await;
        assert_eq!(out, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn empty_pipeline_is_identity() {
        let out = collect(pipe(&[], envelopes(vec![json!(7)]))).await;
        assert_eq!(out, vec![json!(7)]);
    }
}
