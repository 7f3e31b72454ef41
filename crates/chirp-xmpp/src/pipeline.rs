use crate::stanza::Stanza;

/// What a processor wants done with the stanza it just saw.
pub enum ProcessorOutcome {
    /// Hand the stanza to the next processor.
    Continue,
    /// Stop here; later processors never see the stanza.
    Drop,
}

/// Per-dispatch scratch state shared by the processors of one stanza.
///
/// Processors cannot reach the transport; anything they want sent back goes
/// through [`ProcessorContext::push_reply`] and is flushed by the session
/// after the dispatch completes.
#[derive(Default)]
pub struct ProcessorContext {
    replies: Vec<Stanza>,
}

impl ProcessorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&mut self, stanza: Stanza) {
        self.replies.push(stanza);
    }

    pub fn take_replies(&mut self) -> Vec<Stanza> {
        std::mem::take(&mut self.replies)
    }
}

/// One inbound-stanza handler registered with the pipeline.
pub trait StanzaProcessor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn process(&self, stanza: &mut Stanza, ctx: &mut ProcessorContext) -> ProcessorOutcome;

    /// Lower runs earlier.
    fn priority(&self) -> i32;
}

/// Priority-ordered chain of inbound processors.
pub struct StanzaPipeline {
    processors: Vec<Box<dyn StanzaProcessor>>,
}

impl StanzaPipeline {
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    pub fn register(&mut self, processor: Box<dyn StanzaProcessor>) {
        self.processors.push(processor);
        self.processors.sort_by_key(|p| p.priority());
    }

    /// Remove every processor registered under `name`.
    pub fn unregister(&mut self, name: &str) {
        self.processors.retain(|p| p.name() != name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.processors.iter().any(|p| p.name() == name)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run the chain over one inbound stanza. Returns early when a processor
    /// drops the stanza.
    pub fn dispatch(&self, stanza: &mut Stanza, ctx: &mut ProcessorContext) {
        for processor in &self.processors {
            if let ProcessorOutcome::Drop = processor.process(stanza, ctx) {
                return;
            }
        }
    }
}

impl Default for StanzaPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Recorder {
        name: &'static str,
        priority: i32,
        drop_stanza: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl StanzaProcessor for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn process(&self, _stanza: &mut Stanza, _ctx: &mut ProcessorContext) -> ProcessorOutcome {
            self.log.lock().unwrap().push(self.name);
            if self.drop_stanza {
                ProcessorOutcome::Drop
            } else {
                ProcessorOutcome::Continue
            }
        }

        fn priority(&self) -> i32 {
            self.priority
        }
    }

    fn sample_stanza() -> Stanza {
        Stanza::parse(b"<presence xmlns='jabber:client'/>").unwrap()
    }

    #[test]
    fn processors_run_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = StanzaPipeline::new();
        pipeline.register(Box::new(Recorder {
            name: "late",
            priority: 50,
            drop_stanza: false,
            log: log.clone(),
        }));
        pipeline.register(Box::new(Recorder {
            name: "early",
            priority: 1,
            drop_stanza: false,
            log: log.clone(),
        }));

        pipeline.dispatch(&mut sample_stanza(), &mut ProcessorContext::new());
        assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn drop_short_circuits_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = StanzaPipeline::new();
        pipeline.register(Box::new(Recorder {
            name: "gate",
            priority: 1,
            drop_stanza: true,
            log: log.clone(),
        }));
        pipeline.register(Box::new(Recorder {
            name: "never",
            priority: 2,
            drop_stanza: false,
            log: log.clone(),
        }));

        pipeline.dispatch(&mut sample_stanza(), &mut ProcessorContext::new());
        assert_eq!(*log.lock().unwrap(), vec!["gate"]);
    }

    #[test]
    fn unregister_removes_by_name() {
        let mut pipeline = StanzaPipeline::new();
        pipeline.register(Box::new(Recorder {
            name: "gone",
            priority: 1,
            drop_stanza: false,
            log: Arc::new(Mutex::new(Vec::new())),
        }));
        assert!(pipeline.is_registered("gone"));

        pipeline.unregister("gone");
        assert!(!pipeline.is_registered("gone"));
    }

    struct Replier(AtomicUsize);

    impl StanzaProcessor for Replier {
        fn name(&self) -> &'static str {
            "replier"
        }

        fn process(&self, stanza: &mut Stanza, ctx: &mut ProcessorContext) -> ProcessorOutcome {
            self.0.fetch_add(1, Ordering::Relaxed);
            ctx.push_reply(stanza.clone());
            ProcessorOutcome::Continue
        }

        fn priority(&self) -> i32 {
            10
        }
    }

    #[test]
    fn replies_are_collected_for_the_caller() {
        let mut pipeline = StanzaPipeline::new();
        pipeline.register(Box::new(Replier(AtomicUsize::new(0))));

        let mut ctx = ProcessorContext::new();
        pipeline.dispatch(&mut sample_stanza(), &mut ctx);

        let replies = ctx.take_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].name(), "presence");
        assert!(ctx.take_replies().is_empty());
    }
}
