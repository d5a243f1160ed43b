//! Rule registry and event dispatch.

use super::compiler::{MatchAll, Predicate, PredicateCompiler};
use super::transform::EventTransformer;
use crate::delivery::DeliveryEndpoint;
use crate::error::{panic_message, BrokerError, Result};
use crate::subscriptions::Subscription;
use crate::types::{CanonicalEvent, Payload, RawMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A compiled predicate paired with the endpoint it delivers to.
pub struct Rule {
    subscription_id: String,
    predicate: Box<dyn Predicate>,
    endpoint: Arc<dyn DeliveryEndpoint>,
    use_raw: bool,
}

impl Rule {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn endpoint(&self) -> &Arc<dyn DeliveryEndpoint> {
        &self.endpoint
    }

    pub fn matches(&self, event: &CanonicalEvent) -> bool {
        self.predicate.matches(event)
    }

    /// Deliver `event` to this rule's endpoint. Failures stop here.
    fn on_matching_event(&self, event: &CanonicalEvent) -> bool {
        let payload = Payload::from_event(event);
        match self.endpoint.deliver(&payload, self.use_raw) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    subscription_id = %self.subscription_id,
                    location = %self.endpoint.effective_location(),
                    error = %e,
                    "Delivery failed"
                );
                false
            }
        }
    }
}

/// Holds one rule per active subscription and routes events to them.
///
/// `filter_message` evaluates a snapshot of the rule set taken under a
/// shared lock, so `register` and `remove_subscription` never wait for
/// in-flight deliveries. A rule removed mid-evaluation may still see the
/// event; its destroyed endpoint rejects the delivery.
pub struct FilterEngine {
    compiler: Arc<dyn PredicateCompiler>,
    transformer: Arc<dyn EventTransformer>,
    rules: RwLock<HashMap<String, Arc<Rule>>>,
}

impl FilterEngine {
    pub fn new(compiler: Arc<dyn PredicateCompiler>, transformer: Arc<dyn EventTransformer>) -> Self {
        Self {
            compiler,
            transformer,
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Compile the subscription's filter and install a rule bound to `endpoint`.
    ///
    /// Registering an id that already has a rule fails with
    /// `RuleAlreadyRegistered`.
    pub fn register(
        &self,
        subscription: &Subscription,
        endpoint: Arc<dyn DeliveryEndpoint>,
    ) -> Result<()> {
        let options = &subscription.options;

        let predicate: Box<dyn Predicate> = match options.filter_expression {
            Some(ref expression) => self
                .compiler
                .compile(expression, options.filter_language_id.as_deref())
                .map_err(|e| {
                    warn!(subscription_id = %subscription.id, error = %e, "Could not instantiate rule");
                    match e {
                        BrokerError::FilterInstantiation(_) => e,
                        other => BrokerError::FilterInstantiation(other.to_string()),
                    }
                })?,
            None => Box::new(MatchAll),
        };

        let use_raw = options
            .delivery_definition
            .as_ref()
            .map(|d| d.use_raw)
            .unwrap_or(false);

        let rule = Arc::new(Rule {
            subscription_id: subscription.id.clone(),
            predicate,
            endpoint,
            use_raw,
        });

        let mut rules = self.rules.write();
        if rules.contains_key(&subscription.id) {
            return Err(BrokerError::RuleAlreadyRegistered(subscription.id.clone()));
        }
        rules.insert(subscription.id.clone(), rule);

        debug!(subscription_id = %subscription.id, "Registered rule");
        Ok(())
    }

    /// Remove the rule for `id` and hand it back.
    pub fn remove_subscription(&self, id: &str) -> Result<Arc<Rule>> {
        let removed = self
            .rules
            .write()
            .remove(id)
            .ok_or_else(|| BrokerError::UnknownSubscription(id.to_string()))?;

        debug!(subscription_id = %id, "Removed rule");
        Ok(removed)
    }

    /// Canonicalize `raw` and deliver it to every matching rule.
    ///
    /// Never fails: unsupported input, transformation errors, predicate
    /// panics and delivery errors are logged. Returns the number of
    /// successful deliveries.
    pub fn filter_message(&self, raw: RawMessage) -> usize {
        if !self.transformer.supports_input(&raw) {
            info!(content_type = raw.content_type(), "Dropping unsupported message");
            return 0;
        }

        let event = match self.transformer.transform(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Could not transform message");
                return 0;
            }
        };

        // Deliveries may be slow; they must not hold up writers or other readers.
        let rules: Vec<Arc<Rule>> = self.rules.read().values().cloned().collect();
        let mut delivered = 0;

        for rule in &rules {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                rule.matches(&event) && rule.on_matching_event(&event)
            }));

            match outcome {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(panic) => warn!(
                    subscription_id = %rule.subscription_id,
                    panic = %panic_message(panic.as_ref()),
                    "Rule evaluation panicked"
                ),
            }
        }

        delivered
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.read().contains_key(id)
    }

    /// The live endpoint of the rule for `id`.
    pub fn endpoint(&self, id: &str) -> Option<Arc<dyn DeliveryEndpoint>> {
        self.rules.read().get(id).map(|r| Arc::clone(&r.endpoint))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Remove every rule, returning them.
    pub fn drain(&self) -> Vec<Arc<Rule>> {
        self.rules.write().drain().map(|(_, rule)| rule).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{DefaultTransformer, RegexPredicateCompiler};
    use crate::types::SubscribeOptions;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingEndpoint {
        delivered: Mutex<Vec<(String, bool)>>,
        fail: bool,
    }

    impl DeliveryEndpoint for RecordingEndpoint {
        fn deliver(&self, payload: &Payload, raw: bool) -> Result<()> {
            if self.fail {
                return Err(BrokerError::Delivery("unreachable".into()));
            }
            self.delivered.lock().push((payload.text().to_string(), raw));
            Ok(())
        }

        fn effective_location(&self) -> String {
            "test:recording".to_string()
        }

        fn destroy(&self) {}
    }

    struct PanickingPredicate;

    impl Predicate for PanickingPredicate {
        fn matches(&self, _event: &CanonicalEvent) -> bool {
            panic!("predicate exploded")
        }
    }

    struct PanickingCompiler;

    impl PredicateCompiler for PanickingCompiler {
        fn compile(&self, _expression: &str, _language: Option<&str>) -> Result<Box<dyn Predicate>> {
            Ok(Box::new(PanickingPredicate))
        }
    }

    fn engine() -> FilterEngine {
        FilterEngine::new(
            Arc::new(RegexPredicateCompiler),
            Arc::new(DefaultTransformer::new()),
        )
    }

    fn subscription(id: &str, filter: Option<&str>, endpoint: Arc<dyn DeliveryEndpoint>) -> Subscription {
        let mut options = SubscribeOptions::new("p1");
        options.filter_expression = filter.map(str::to_string);
        Subscription::new(id, options, endpoint)
    }

    #[test]
    fn test_no_filter_matches_everything() {
        let engine = engine();
        let endpoint = Arc::new(RecordingEndpoint::default());
        let sub = subscription("s1", None, endpoint.clone());
        engine.register(&sub, endpoint.clone()).unwrap();

        assert_eq!(engine.filter_message("anything".into()), 1);
        assert_eq!(engine.filter_message(serde_json::json!({"x": 1}).into()), 1);
        assert_eq!(endpoint.delivered.lock().len(), 2);
    }

    #[test]
    fn test_only_matching_rules_deliver() {
        let engine = engine();
        let hot = Arc::new(RecordingEndpoint::default());
        let cold = Arc::new(RecordingEndpoint::default());
        engine
            .register(&subscription("hot", Some("temp=[3-9]\\d"), hot.clone()), hot.clone())
            .unwrap();
        engine
            .register(&subscription("cold", Some("temp=[0-2]\\d"), cold.clone()), cold.clone())
            .unwrap();

        assert_eq!(engine.filter_message("temp=35".into()), 1);

        assert_eq!(hot.delivered.lock().as_slice(), &[("temp=35".to_string(), false)]);
        assert!(cold.delivered.lock().is_empty());
    }

    #[test]
    fn test_compile_failure() {
        let engine = engine();
        let endpoint = Arc::new(RecordingEndpoint::default());
        let result = engine.register(&subscription("s1", Some("(("), endpoint.clone()), endpoint);

        assert!(matches!(result, Err(BrokerError::FilterInstantiation(_))));
        assert_eq!(engine.rule_count(), 0);
    }

    #[test]
    fn test_double_register_fails() {
        let engine = engine();
        let endpoint = Arc::new(RecordingEndpoint::default());
        let sub = subscription("s1", None, endpoint.clone());
        engine.register(&sub, endpoint.clone()).unwrap();

        assert!(matches!(
            engine.register(&sub, endpoint),
            Err(BrokerError::RuleAlreadyRegistered(_))
        ));
        assert_eq!(engine.rule_count(), 1);
    }

    #[test]
    fn test_remove_unknown() {
        assert!(matches!(
            engine().remove_subscription("ghost"),
            Err(BrokerError::UnknownSubscription(_))
        ));
    }

    #[test]
    fn test_removed_rule_stops_delivering() {
        let engine = engine();
        let endpoint = Arc::new(RecordingEndpoint::default());
        engine
            .register(&subscription("s1", None, endpoint.clone()), endpoint.clone())
            .unwrap();

        let removed = engine.remove_subscription("s1").unwrap();
        assert_eq!(removed.subscription_id(), "s1");
        assert_eq!(engine.filter_message("hello".into()), 0);
        assert!(endpoint.delivered.lock().is_empty());
    }

    #[test]
    fn test_unsupported_input_is_dropped() {
        let engine = engine();
        let endpoint = Arc::new(RecordingEndpoint::default());
        engine
            .register(&subscription("s1", None, endpoint.clone()), endpoint.clone())
            .unwrap();

        assert_eq!(engine.filter_message(RawMessage::Bytes(vec![0xff])), 0);
        assert!(endpoint.delivered.lock().is_empty());
    }

    struct SlowEndpoint {
        entered: crossbeam_channel::Sender<()>,
        delay: std::time::Duration,
    }

    impl DeliveryEndpoint for SlowEndpoint {
        fn deliver(&self, _payload: &Payload, _raw: bool) -> Result<()> {
            let _ = self.entered.send(());
            std::thread::sleep(self.delay);
            Ok(())
        }

        fn effective_location(&self) -> String {
            "test:slow".to_string()
        }

        fn destroy(&self) {}
    }

    #[test]
    fn test_slow_delivery_does_not_block_other_evaluations() {
        use std::time::{Duration, Instant};

        let engine = Arc::new(engine());
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let slow = Arc::new(SlowEndpoint {
            entered: entered_tx,
            delay: Duration::from_millis(1500),
        });
        let fast = Arc::new(RecordingEndpoint::default());

        engine
            .register(&subscription("slow", Some("^slow"), slow.clone()), slow)
            .unwrap();
        engine
            .register(&subscription("fast", Some("^fast"), fast.clone()), fast.clone())
            .unwrap();

        let delivering = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.filter_message("slow event".into()))
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let registering = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let other = Arc::new(RecordingEndpoint::default());
                engine.register(&subscription("other", Some("^other"), other.clone()), other)
            })
        };

        let started = Instant::now();
        assert_eq!(engine.filter_message("fast event".into()), 1);
        assert!(started.elapsed() < Duration::from_millis(500));

        registering.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(delivering.join().unwrap(), 1);
        assert_eq!(fast.delivered.lock().len(), 1);
    }

    #[test]
    fn test_failures_are_isolated_per_rule() {
        let engine = FilterEngine::new(Arc::new(PanickingCompiler), Arc::new(DefaultTransformer::new()));
        let failing = Arc::new(RecordingEndpoint {
            fail: true,
            ..Default::default()
        });
        let panicking = Arc::new(RecordingEndpoint::default());
        let healthy = Arc::new(RecordingEndpoint::default());

        engine
            .register(&subscription("failing", None, failing.clone()), failing)
            .unwrap();
        engine
            .register(&subscription("panicking", Some("x"), panicking.clone()), panicking)
            .unwrap();
        engine
            .register(&subscription("healthy", None, healthy.clone()), healthy.clone())
            .unwrap();

        assert_eq!(engine.filter_message("event".into()), 1);
        assert_eq!(healthy.delivered.lock().len(), 1);
    }
}
