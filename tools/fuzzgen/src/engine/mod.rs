//! Generate/replay value engine.
//!
//! Every decision, including internal ones such as "which constructor" or "how
//! many method calls", goes through [`ValueEngine::between`]. In generate mode
//! that draws from a seeded ChaCha stream; in replay mode it reads the next
//! record of the input log instead. Both modes write the decision to the output
//! log, so replaying a log reproduces it byte for byte.

mod sample;
mod value_type;

pub use sample::{full_range, Sample};
pub use value_type::{InstanceId, Value, ValueType};

use crate::codec::{LogReader, LogWriter, Scalar};
use crate::config::{EngineConfig, ReusePolicy};
use crate::errors::FuzzError;
use crate::registry::{CapabilityRegistry, Object, TypeCapabilities};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::any::Any;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Output log used when no replay input is given.
pub const DEFAULT_LOG_NAME: &str = "fuzzlog";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Generate,
    Replay,
}

type LogSink = LogWriter<Box<dyn Write + Send>>;
type LogSource = LogReader<Box<dyn Read + Send>>;

enum DecisionSource {
    Generate(ChaCha20Rng),
    Replay(LogSource),
}

/// Heap value owned by the engine.
pub enum Instance {
    Object { type_name: String, data: Object },
    Bytes(Vec<u8>),
    Text(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub decisions: u64,
    pub max_depth: u32,
    pub max_spins: u64,
    pub reused: u64,
}

pub struct ValueEngine {
    source: DecisionSource,
    log: LogSink,
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    arena: Vec<Instance>,
    store: HashMap<String, Vec<Value>>,
    stats: EngineStats,
}

macro_rules! between_scalar_arms {
    ($engine:ident, $lo:ident, $hi:ident, $id:ident; $($variant:ident),*) => {
        match ($lo, $hi) {
            $(
                (Scalar::$variant(lo), Scalar::$variant(hi)) => {
                    Ok(Scalar::$variant($engine.between(lo, hi, $id)?))
                }
            )*
            (lo, hi) => Err(FuzzError::InvalidBounds(format!(
                "bounds have different types: {} and {}",
                lo.tag(),
                hi.tag()
            ))),
        }
    };
}

impl ValueEngine {
    pub fn generate(
        config: &EngineConfig,
        registry: Arc<CapabilityRegistry>,
        log: LogSink,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Self::new(DecisionSource::Generate(rng), config, registry, log)
    }

    pub fn replay(
        config: &EngineConfig,
        registry: Arc<CapabilityRegistry>,
        input: LogSource,
        log: LogSink,
    ) -> Self {
        Self::new(DecisionSource::Replay(input), config, registry, log)
    }

    pub fn generate_to(
        path: impl AsRef<Path>,
        config: &EngineConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Self, FuzzError> {
        let log = LogWriter::create(path.as_ref())?.boxed();
        info!(log = %path.as_ref().display(), "generating values");
        Ok(Self::generate(config, registry, log))
    }

    pub fn replay_from(
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        config: &EngineConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Self, FuzzError> {
        let reader = LogReader::open(input.as_ref())?.boxed();
        let log = LogWriter::create(output.as_ref())?.boxed();
        info!(
            input = %input.as_ref().display(),
            output = %output.as_ref().display(),
            "replaying values"
        );
        Ok(Self::replay(config, registry, reader, log))
    }

    /// Replays `args[k]` (logging to `args[k]` + `"+"`) when present, otherwise
    /// generates into [`DEFAULT_LOG_NAME`].
    pub fn from_args(
        args: &[String],
        k: usize,
        config: &EngineConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Self, FuzzError> {
        match args.get(k) {
            Some(input) => Self::replay_from(input, format!("{input}+"), config, registry),
            None => Self::generate_to(DEFAULT_LOG_NAME, config, registry),
        }
    }

    fn new(
        source: DecisionSource,
        config: &EngineConfig,
        registry: Arc<CapabilityRegistry>,
        log: LogSink,
    ) -> Self {
        Self {
            source,
            log: log.with_flush_each_record(config.flush_each_record),
            config: config.clone(),
            registry,
            arena: Vec::new(),
            store: HashMap::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        match self.source {
            DecisionSource::Generate(_) => Mode::Generate,
            DecisionSource::Replay(_) => Mode::Replay,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn records_written(&self) -> u64 {
        self.log.records()
    }

    /// Uniform value in `[lo, hi]`, or the next logged value when replaying.
    pub fn between<T: Sample>(&mut self, lo: T, hi: T, decision_id: u64) -> Result<T, FuzzError> {
        T::check_bounds(lo, hi)?;
        let value = match &mut self.source {
            DecisionSource::Generate(_) if lo == hi => lo,
            DecisionSource::Generate(rng) => T::sample(rng, lo, hi),
            DecisionSource::Replay(reader) => reader.read_value::<T>()?,
        };
        self.log.write_value(value, decision_id)?;
        self.stats.decisions += 1;
        Ok(value)
    }

    /// [`Self::between`] for runtime-typed bounds; both bounds must share a tag.
    pub fn between_scalar(
        &mut self,
        lo: Scalar,
        hi: Scalar,
        decision_id: u64,
    ) -> Result<Scalar, FuzzError> {
        between_scalar_arms!(self, lo, hi, decision_id;
            I64, U64, F64, I32, U32, I16, U16, I8, U8, F32, Bool)
    }

    pub fn make(
        &mut self,
        ty: &ValueType,
        decision_id: u64,
        allow_subclass: bool,
    ) -> Result<Value, FuzzError> {
        self.make_at(ty, decision_id, allow_subclass, 0)
    }

    fn make_at(
        &mut self,
        ty: &ValueType,
        decision_id: u64,
        allow_subclass: bool,
        depth: u32,
    ) -> Result<Value, FuzzError> {
        if depth > self.config.depth_limit {
            return Err(FuzzError::DepthLimit {
                type_name: ty.name(),
                limit: self.config.depth_limit,
            });
        }
        self.stats.max_depth = self.stats.max_depth.max(depth);

        match ty {
            ValueType::Scalar(tag) => {
                let (lo, hi) = full_range(*tag);
                Ok(Value::Scalar(self.between_scalar(lo, hi, decision_id)?))
            }
            ValueType::Enumerated { min, max } => {
                Ok(Value::Scalar(Scalar::I64(self.between(*min, *max, decision_id)?)))
            }
            ValueType::Composite(name) => {
                self.make_composite(name, decision_id, allow_subclass, depth)
            }
            ValueType::Reference(inner) => {
                let referent = self.make_at(inner, decision_id, allow_subclass, depth + 1)?;
                Ok(Value::Reference(Box::new(referent)))
            }
            ValueType::Opaque => {
                let max = self.config.buffer_max;
                let size = self.between(1u64, max, decision_id)?;
                expect_within("buffer size", size, 1, max)?;
                Ok(self.insert(Instance::Bytes(vec![0; size as usize])))
            }
            ValueType::Text => self.make_text(decision_id),
            ValueType::Callable => {
                debug!(decision_id, "callable values are not generated");
                Ok(Value::Null)
            }
        }
    }

    fn make_text(&mut self, decision_id: u64) -> Result<Value, FuzzError> {
        let max = self.config.text_max_len.max(1);
        let len = self.between(1u64, max, decision_id)?;
        expect_within("text length", len, 1, max)?;
        let mut bytes = Vec::with_capacity(len as usize);
        for _ in 1..len {
            let c = self.between(i8::MIN, i8::MAX, decision_id)?;
            bytes.push(c as u8);
        }
        bytes.push(0);
        Ok(self.insert(Instance::Text(bytes)))
    }

    fn make_composite(
        &mut self,
        name: &str,
        decision_id: u64,
        allow_subclass: bool,
        depth: u32,
    ) -> Result<Value, FuzzError> {
        let caps = self.registry.get(name)?;
        if let Some(value) = self.try_reuse(name, decision_id)? {
            return Ok(value);
        }

        if allow_subclass && !caps.subclasses.is_empty() {
            let coin = self.between(0.0f64, 1.0, decision_id)?;
            if coin > 0.5 {
                let pick = self.pick("subclass", caps.subclasses.len(), decision_id)?;
                // Only the type's own constructors feed its reuse store.
                return (caps.subclasses[pick])(&mut Builder::new(self, depth, decision_id));
            }
        }

        if caps.constructors.is_empty() {
            return Err(FuzzError::NoConstructor(name.to_string()));
        }
        let pick = self.pick("constructor", caps.constructors.len(), decision_id)?;
        let mut object = (caps.constructors[pick])(&mut Builder::new(self, depth, decision_id))?;
        let spins = self.apply_methods(name, &caps, object.as_mut(), decision_id, depth)?;
        debug!(type_name = name, spins, depth, "constructed composite");

        let value = self.insert(Instance::Object {
            type_name: name.to_string(),
            data: object,
        });
        self.remember(name, &value);
        Ok(value)
    }

    fn apply_methods(
        &mut self,
        name: &str,
        caps: &TypeCapabilities,
        object: &mut (dyn Any + Send + 'static),
        decision_id: u64,
        depth: u32,
    ) -> Result<u64, FuzzError> {
        if caps.methods.is_empty() {
            return Ok(0);
        }
        let limit = self.config.spin_limit;
        let spins = self.between(0u64, u64::from(limit), decision_id)?;
        if spins > u64::from(limit) {
            return Err(FuzzError::SpinLimit {
                type_name: name.to_string(),
                spins,
                limit,
            });
        }
        for _ in 0..spins {
            let pick = self.pick("method", caps.methods.len(), decision_id)?;
            (caps.methods[pick])(&mut Builder::new(self, depth, decision_id), &mut *object)?;
        }
        self.stats.max_spins = self.stats.max_spins.max(spins);
        Ok(spins)
    }

    fn try_reuse(&mut self, name: &str, decision_id: u64) -> Result<Option<Value>, FuzzError> {
        if self.config.reuse == ReusePolicy::Never {
            return Ok(None);
        }
        let available = self.store.get(name).map_or(0, Vec::len);
        if available == 0 || !self.between(false, true, decision_id)? {
            return Ok(None);
        }
        let pick = self.pick("reuse index", available, decision_id)?;
        self.stats.reused += 1;
        Ok(self.store.get(name).and_then(|values| values.get(pick)).cloned())
    }

    fn remember(&mut self, name: &str, value: &Value) {
        if self.config.reuse != ReusePolicy::Never {
            self.store
                .entry(name.to_string())
                .or_default()
                .push(value.clone());
        }
    }

    /// Logged index into a table of `len` entries.
    fn pick(&mut self, what: &'static str, len: usize, decision_id: u64) -> Result<usize, FuzzError> {
        let max = len.saturating_sub(1) as u64;
        let index = self.between(0u64, max, decision_id)?;
        expect_within(what, index, 0, max)?;
        Ok(index as usize)
    }

    fn insert(&mut self, instance: Instance) -> Value {
        self.arena.push(instance);
        Value::Instance(InstanceId(self.arena.len() - 1))
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.arena.get(id.0)
    }

    pub fn instance_count(&self) -> usize {
        self.arena.len()
    }

    pub fn object<T: Any>(&self, id: InstanceId) -> Option<&T> {
        match self.instance(id)? {
            Instance::Object { data, .. } => data.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn type_name(&self, id: InstanceId) -> Option<&str> {
        match self.instance(id)? {
            Instance::Object { type_name, .. } => Some(type_name),
            Instance::Bytes(_) => Some("opaque"),
            Instance::Text(_) => Some("text"),
        }
    }

    /// Raw bytes of an opaque buffer or text value (text keeps its terminator).
    pub fn bytes(&self, id: InstanceId) -> Option<&[u8]> {
        match self.instance(id)? {
            Instance::Bytes(bytes) | Instance::Text(bytes) => Some(bytes),
            Instance::Object { .. } => None,
        }
    }

    pub fn text_of(&self, value: &Value) -> Option<String> {
        let id = value.referent().as_instance()?;
        match self.instance(id)? {
            Instance::Text(bytes) => {
                let body = bytes.strip_suffix(&[0]).unwrap_or(bytes);
                Some(String::from_utf8_lossy(body).into_owned())
            }
            _ => None,
        }
    }

    /// Flushes the output log. Dropping the engine also releases both logs.
    pub fn finish(mut self) -> Result<EngineStats, FuzzError> {
        self.log.flush()?;
        Ok(self.stats)
    }
}

fn expect_within(what: &'static str, value: u64, lo: u64, hi: u64) -> Result<(), FuzzError> {
    if (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(FuzzError::ReplayOutOfRange {
            what,
            value,
            max: hi,
        })
    }
}

/// Handle passed to registry invokers. Carries the depth of the construction
/// in progress so nested `make` calls are bounded.
pub struct Builder<'a> {
    engine: &'a mut ValueEngine,
    depth: u32,
    decision_id: u64,
}

impl<'a> Builder<'a> {
    fn new(engine: &'a mut ValueEngine, depth: u32, decision_id: u64) -> Self {
        Self {
            engine,
            depth,
            decision_id,
        }
    }

    pub fn between<T: Sample>(&mut self, lo: T, hi: T, decision_id: u64) -> Result<T, FuzzError> {
        self.engine.between(lo, hi, decision_id)
    }

    pub fn make(
        &mut self,
        ty: &ValueType,
        decision_id: u64,
        allow_subclass: bool,
    ) -> Result<Value, FuzzError> {
        self.engine
            .make_at(ty, decision_id, allow_subclass, self.depth + 1)
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Decision id of the `make` call that created this builder.
    pub fn decision_id(&self) -> u64 {
        self.decision_id
    }

    pub fn object<T: Any>(&self, id: InstanceId) -> Option<&T> {
        self.engine.object(id)
    }

    pub fn text_of(&self, value: &Value) -> Option<String> {
        self.engine.text_of(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{Builder, Mode, Value, ValueEngine, ValueType};
    use crate::codec::{LogReader, LogWriter, Scalar, TypeTag};
    use crate::config::{EngineConfig, ReusePolicy};
    use crate::errors::FuzzError;
    use crate::registry::{builtin, CapabilityRegistry, TypeCapabilities};
    use std::io::{Cursor, Write};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().expect("buf lock").clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buf lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn config(seed: u64) -> EngineConfig {
        EngineConfig {
            seed: Some(seed),
            ..EngineConfig::default()
        }
    }

    fn generator(cfg: &EngineConfig, registry: CapabilityRegistry) -> (ValueEngine, SharedBuf) {
        let buf = SharedBuf::default();
        let log = LogWriter::new(buf.clone(), "mem").boxed();
        (ValueEngine::generate(cfg, Arc::new(registry), log), buf)
    }

    fn replayer(
        cfg: &EngineConfig,
        registry: CapabilityRegistry,
        input: Vec<u8>,
    ) -> (ValueEngine, SharedBuf) {
        let buf = SharedBuf::default();
        let reader = LogReader::new(Cursor::new(input), "mem").boxed();
        let log = LogWriter::new(buf.clone(), "mem").boxed();
        (ValueEngine::replay(cfg, Arc::new(registry), reader, log), buf)
    }

    #[derive(Debug, Default)]
    struct Counter {
        calls: u32,
    }

    fn counter_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            "Counter",
            TypeCapabilities::new()
                .constructor(|_b: &mut Builder<'_>| Ok(Counter::default()))
                .method(|_b: &mut Builder<'_>, c: &mut Counter| {
                    c.calls += 1;
                    Ok(())
                })
                .method(|b: &mut Builder<'_>, c: &mut Counter| {
                    c.calls += 1;
                    b.between(0u8, 9, 77).map(|_| ())
                }),
        );
        registry
    }

    #[test]
    fn replay_reproduces_generated_values_and_log() {
        let cfg = config(11);
        let (mut engine, log) = generator(&cfg, CapabilityRegistry::with_builtins());
        let mut generated = Vec::new();
        for id in 0..50u64 {
            generated.push(engine.between(-10i32, 10, id).expect("i32").to_string());
            generated.push(engine.between(0.0f64, 1.0, id).expect("f64").to_string());
            let v = engine
                .make(&ValueType::composite(builtin::INT_SEQUENCE), id, true)
                .expect("seq");
            let id = v.as_instance().expect("instance");
            generated.push(format!("{:?}", engine.object::<Vec<i64>>(id)));
        }
        let original = log.bytes();

        let (mut engine, replay_log) = replayer(&cfg, CapabilityRegistry::with_builtins(), original.clone());
        assert_eq!(engine.mode(), Mode::Replay);
        let mut replayed = Vec::new();
        for id in 0..50u64 {
            replayed.push(engine.between(-10i32, 10, id).expect("i32").to_string());
            replayed.push(engine.between(0.0f64, 1.0, id).expect("f64").to_string());
            let v = engine
                .make(&ValueType::composite(builtin::INT_SEQUENCE), id, true)
                .expect("seq");
            let id = v.as_instance().expect("instance");
            replayed.push(format!("{:?}", engine.object::<Vec<i64>>(id)));
        }
        assert_eq!(generated, replayed);
        assert_eq!(replay_log.bytes(), original);
    }

    #[test]
    fn equal_bounds_return_the_bound_and_still_log() {
        let (mut engine, log) = generator(&config(1), CapabilityRegistry::new());
        assert_eq!(engine.between(5u16, 5, 3).expect("tie"), 5);
        assert_eq!(engine.records_written(), 1);
        assert_eq!(log.bytes().len(), 1 + 2 + 8);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let (mut engine, _log) = generator(&config(1), CapabilityRegistry::new());
        let err = engine.between(3i64, 1, 0).expect_err("inverted");
        assert!(matches!(err, FuzzError::InvalidBounds(_)));
        let err = engine
            .between_scalar(Scalar::U8(0), Scalar::I8(1), 0)
            .expect_err("mixed");
        assert!(matches!(err, FuzzError::InvalidBounds(_)));
    }

    #[test]
    fn replay_tag_mismatch_is_fatal() {
        let (mut engine, log) = generator(&config(3), CapabilityRegistry::new());
        engine.between(0i32, 100, 1).expect("i32");
        let (mut engine, _) = replayer(&config(3), CapabilityRegistry::new(), log.bytes());
        let err = engine.between(0u64, 100, 1).expect_err("mismatch");
        assert!(err.is_replay_integrity());
        assert!(matches!(err, FuzzError::TagMismatch { expected: 2, found: 4, .. }));
    }

    #[test]
    fn spin_count_never_exceeds_limit() {
        let cfg = EngineConfig {
            spin_limit: 2,
            ..config(5)
        };
        let (mut engine, _log) = generator(&cfg, counter_registry());
        for id in 0..200 {
            let v = engine
                .make(&ValueType::composite("Counter"), id, false)
                .expect("counter");
            let counter = engine
                .object::<Counter>(v.as_instance().expect("instance"))
                .expect("downcast");
            assert!(counter.calls <= 2);
        }
        assert!(engine.stats().max_spins <= 2);
    }

    #[test]
    fn replayed_spin_count_above_limit_is_rejected() {
        let mut log = LogWriter::new(Vec::new(), "mem");
        log.write_value(0u64, 1).expect("constructor pick");
        log.write_value(5u64, 1).expect("spin count");
        let cfg = config(0);
        let (mut engine, _) = replayer(&cfg, counter_registry(), log.into_inner());
        let err = engine
            .make(&ValueType::composite("Counter"), 1, false)
            .expect_err("spin limit");
        assert!(err.is_resource_exhaustion());
        assert!(matches!(err, FuzzError::SpinLimit { spins: 5, limit: 3, .. }));
    }

    #[test]
    fn self_referential_types_stop_at_depth_limit() {
        let mut registry = CapabilityRegistry::new();
        registry.register(
            "Node",
            TypeCapabilities::new().constructor(|b: &mut Builder<'_>| {
                let next = b.make(&ValueType::reference(ValueType::composite("Node")), 9, false)?;
                Ok(next)
            }),
        );
        let cfg = EngineConfig {
            depth_limit: 6,
            ..config(8)
        };
        let (mut engine, _log) = generator(&cfg, registry);
        let err = engine
            .make(&ValueType::composite("Node"), 9, false)
            .expect_err("depth");
        assert!(matches!(err, FuzzError::DepthLimit { limit: 6, .. }));
        assert!(engine.stats().max_depth <= 6);
    }

    #[test]
    fn scalar_categories_cover_buffers_text_and_callables() {
        let cfg = EngineConfig {
            buffer_max: 32,
            text_max_len: 8,
            ..config(21)
        };
        let (mut engine, _log) = generator(&cfg, CapabilityRegistry::new());
        for id in 0..50 {
            let buffer = engine.make(&ValueType::Opaque, id, false).expect("opaque");
            let len = engine
                .bytes(buffer.as_instance().expect("instance"))
                .expect("bytes")
                .len();
            assert!((1..=32).contains(&len));

            let text = engine.make(&ValueType::Text, id, false).expect("text");
            let bytes = engine.bytes(text.as_instance().expect("instance")).expect("bytes");
            assert!((1..=8).contains(&bytes.len()));
            assert_eq!(bytes.last(), Some(&0));

            let e = engine
                .make(&ValueType::Enumerated { min: 2, max: 4 }, id, false)
                .expect("enum");
            let Some(Scalar::I64(v)) = e.as_scalar() else {
                panic!("expected i64 scalar, got {e:?}");
            };
            assert!((2..=4).contains(&v));
        }
        assert_eq!(
            engine.make(&ValueType::Callable, 0, false).expect("callable"),
            Value::Null
        );
        let wrapped = engine
            .make(&ValueType::reference(ValueType::Scalar(TypeTag::U8)), 0, false)
            .expect("reference");
        assert!(matches!(wrapped.referent(), Value::Scalar(Scalar::U8(_))));
    }

    #[test]
    fn subclass_selection_is_replayable() {
        let mut registry = counter_registry();
        registry.register(
            "Base",
            TypeCapabilities::new()
                .constructor(|_b: &mut Builder<'_>| Ok(Counter::default()))
                .subclass("Counter"),
        );
        let cfg = config(34);
        let (mut engine, log) = generator(&cfg, registry.clone());
        let generated = (0..40)
            .map(|id| engine.make(&ValueType::composite("Base"), id, true))
            .collect::<Result<Vec<_>, _>>()
            .expect("generate");
        let names = generated
            .iter()
            .map(|v| engine.type_name(v.as_instance().expect("instance")).map(str::to_string))
            .collect::<Vec<_>>();
        assert!(names.iter().any(|n| n.as_deref() == Some("Counter")));
        assert!(names.iter().any(|n| n.as_deref() == Some("Base")));

        let (mut engine, replay_log) = replayer(&cfg, registry, log.bytes());
        for id in 0..40 {
            engine
                .make(&ValueType::composite("Base"), id, true)
                .expect("replay");
        }
        assert_eq!(replay_log.bytes(), log.bytes());
    }

    #[test]
    fn coin_reuse_hands_back_stored_instances() {
        let cfg = EngineConfig {
            reuse: ReusePolicy::Coin,
            ..config(55)
        };
        let (mut engine, log) = generator(&cfg, counter_registry());
        for id in 0..60 {
            engine
                .make(&ValueType::composite("Counter"), id, false)
                .expect("make");
        }
        let stats = engine.stats();
        assert!(stats.reused > 0);
        assert!((engine.instance_count() as u64) + stats.reused == 60);

        let (mut engine, replay_log) = replayer(&cfg, counter_registry(), log.bytes());
        for id in 0..60 {
            engine
                .make(&ValueType::composite("Counter"), id, false)
                .expect("replay");
        }
        assert_eq!(engine.stats().reused, stats.reused);
        assert_eq!(replay_log.bytes(), log.bytes());
    }

    #[test]
    fn reused_instances_never_stand_in_for_a_subclass() {
        let mut registry = counter_registry();
        registry.register(
            "Base",
            TypeCapabilities::new()
                .constructor(|_b: &mut Builder<'_>| Ok(Counter::default()))
                .subclass("Counter"),
        );
        let mut saw_subclass = false;
        let mut reused = 0;
        for seed in 0..20 {
            let cfg = EngineConfig {
                reuse: ReusePolicy::Coin,
                ..config(seed)
            };
            let (mut engine, _log) = generator(&cfg, registry.clone());
            for id in 0..20 {
                let value = engine
                    .make(&ValueType::composite("Base"), id, true)
                    .expect("make with subclass");
                let name = engine.type_name(value.as_instance().expect("instance"));
                saw_subclass |= name == Some("Counter");
            }
            for id in 20..40 {
                let value = engine
                    .make(&ValueType::composite("Base"), id, false)
                    .expect("make without subclass");
                let name = engine.type_name(value.as_instance().expect("instance"));
                assert_eq!(name, Some("Base"), "seed {seed} id {id}");
            }
            reused += engine.stats().reused;
        }
        assert!(saw_subclass);
        assert!(reused > 0);
    }

    #[test]
    fn unknown_and_constructorless_types_fail_cleanly() {
        let mut registry = CapabilityRegistry::new();
        registry.register("Empty", TypeCapabilities::new());
        let (mut engine, _log) = generator(&config(1), registry);
        assert!(matches!(
            engine.make(&ValueType::composite("Nope"), 0, true),
            Err(FuzzError::UnknownType(_))
        ));
        assert!(matches!(
            engine.make(&ValueType::composite("Empty"), 0, true),
            Err(FuzzError::NoConstructor(_))
        ));
    }

    #[test]
    fn from_args_replays_and_logs_next_to_input() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let input = dir.path().join("run.log");
        let mut writer = LogWriter::create(&input).expect("create");
        writer.write_value(42u32, 4).expect("write");
        writer.flush().expect("flush");
        drop(writer);

        let args = vec!["harness".to_string(), input.display().to_string()];
        let mut engine =
            ValueEngine::from_args(&args, 1, &config(0), Arc::new(CapabilityRegistry::new()))
                .expect("engine");
        assert_eq!(engine.mode(), Mode::Replay);
        assert_eq!(engine.between(0u32, 100, 4).expect("value"), 42);
        engine.finish().expect("finish");

        let copy = std::fs::read(dir.path().join("run.log+")).expect("replay log");
        assert_eq!(copy, std::fs::read(&input).expect("input"));
    }
}
