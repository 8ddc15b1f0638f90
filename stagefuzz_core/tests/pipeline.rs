use stagefuzz_core::stats::{CORE_COMPONENT, StatValue};
use stagefuzz_core::{
    CoreState, DriverError, HostRuntime, MemorySink, Pipeline, Plugin, PluginCore, PluginState,
    StatRecorder, StatSnapshot, StatType, Value, ValueKind,
};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn runtime() -> HostRuntime {
    HostRuntime::new(StatRecorder::anonymous(8192).unwrap(), MemorySink::new()).unwrap()
}

/// Declares "x" and pushes "abc" every iteration.
struct Producer;

impl Plugin for Producer {
    fn name(&self) -> &str {
        "producer"
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        core.declare("x", ValueKind::Buffer)?;
        Ok(())
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        core.push_back("x", b"abc".to_vec())?;
        Ok(())
    }
}

/// Observes the front of "x" through `get_mut`, then pops it.
struct Consumer {
    seen: Log,
}

impl Plugin for Consumer {
    fn name(&self) -> &str {
        "consumer"
    }

    fn init(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn validate(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        anyhow::ensure!(core.store().expected_kind("x").is_some(), "'x' was not declared");
        Ok(())
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let front = core
            .get_mut("x", 0)
            .and_then(Value::as_bytes_mut)
            .map(|b| String::from_utf8_lossy(b).into_owned());
        self.seen.lock().unwrap().push(front.unwrap_or_default());
        core.pop_front("x");
        self.seen.lock().unwrap().push(format!("len={}", core.len("x")));
        Ok(())
    }
}

#[test]
fn value_pushed_by_one_plugin_is_visible_to_the_next() {
    let seen = Log::default();
    let mut pipeline = Pipeline::new(runtime()).unwrap();
    pipeline.add_plugin(Box::new(Producer)).unwrap();
    pipeline
        .add_plugin(Box::new(Consumer {
            seen: Arc::clone(&seen),
        }))
        .unwrap();

    pipeline.setup().unwrap();
    pipeline.run(Some(1)).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["abc".to_string(), "len=0".to_string()]);
    assert!(pipeline.teardown().is_clean());
}

/// Registers `total_execs` twice and writes 5, then 7.
struct Counter;

impl Plugin for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let first = core.add_stat("total_execs", StatType::Number, 8)?;
        let second = core.add_stat("total_execs", StatType::Number, 8)?;
        anyhow::ensure!(first == second, "registration is not idempotent");
        core.stats().set_number(first, 5)?;
        core.stats().set_number(second, 7)?;
        anyhow::ensure!(
            core.add_stat("total_execs", StatType::Signed, 8).is_err(),
            "a different type must be rejected"
        );
        Ok(())
    }

    fn do_work(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[test]
fn stat_file_holds_the_last_written_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.bin");
    let stats = StatRecorder::create(&path, 4096).unwrap();
    let runtime = HostRuntime::new(stats, MemorySink::new()).unwrap();
    let mut pipeline = Pipeline::new(runtime).unwrap();
    pipeline.add_plugin(Box::new(Counter)).unwrap();

    let before = StatSnapshot::open(&path).unwrap();
    assert_eq!(before.state, CoreState::Initializing);

    pipeline.setup().unwrap();
    pipeline.run(Some(3)).unwrap();

    let during = StatSnapshot::open(&path).unwrap();
    assert_eq!(during.state, CoreState::Fuzzing);
    assert_eq!(during.get("counter", "total_execs"), Some(&StatValue::Number(7)));
    assert_eq!(
        during.get(CORE_COMPONENT, "total_num_execs"),
        Some(&StatValue::Number(3))
    );

    drop(pipeline);
    let after = StatSnapshot::open(&path).unwrap();
    assert_eq!(after.state, CoreState::Exiting);
}

/// Counts its own lifecycle calls into a shared log.
struct Tracer {
    name: String,
    log: Log,
    fail_work: bool,
    fail_destroy: bool,
}

impl Tracer {
    fn boxed(name: &str, log: &Log, fail_work: bool, fail_destroy: bool) -> Box<dyn Plugin> {
        Box::new(Self {
            name: name.to_string(),
            log: Arc::clone(log),
            fail_work,
            fail_destroy,
        })
    }

    fn note(&self, phase: &str) {
        self.log.lock().unwrap().push(format!("{phase}:{}", self.name));
    }
}

impl Plugin for Tracer {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.note("init");
        Ok(())
    }

    fn validate(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.note("validate");
        Ok(())
    }

    fn do_work(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.note("do_work");
        anyhow::ensure!(!self.fail_work, "{} failed", self.name);
        Ok(())
    }

    fn destroy(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.note("destroy");
        anyhow::ensure!(!self.fail_destroy, "{} failed to clean up", self.name);
        Ok(())
    }
}

#[test]
fn lifecycle_phases_are_ordered_and_counted_despite_failures() {
    let log = Log::default();
    let mut pipeline = Pipeline::new(runtime()).unwrap();
    for (name, fail_work, fail_destroy) in [
        ("p0", false, true),
        ("p1", true, false),
        ("p2", false, false),
        ("p3", false, true),
    ] {
        pipeline
            .add_plugin(Tracer::boxed(name, &log, fail_work, fail_destroy))
            .unwrap();
    }

    pipeline.setup().unwrap();
    let summary = pipeline.run(Some(4)).unwrap();
    assert_eq!(summary.failures, 4);
    let report = pipeline.teardown();
    let failed: Vec<&str> = report.failures.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(failed, vec!["p3", "p0"]);

    let log = log.lock().unwrap();
    let phase_of = |entry: &String| entry.split(':').next().unwrap_or("").to_string();
    let last_init = log.iter().rposition(|e| phase_of(e) == "init").unwrap();
    let first_validate = log.iter().position(|e| phase_of(e) == "validate").unwrap();
    let last_validate = log.iter().rposition(|e| phase_of(e) == "validate").unwrap();
    let first_work = log.iter().position(|e| phase_of(e) == "do_work").unwrap();
    assert!(last_init < first_validate);
    assert!(last_validate < first_work);

    let count = |phase: &str| log.iter().filter(|e| phase_of(e) == phase).count();
    assert_eq!(count("init"), 4);
    assert_eq!(count("validate"), 4);
    assert_eq!(count("destroy"), 4);
    // p1 fails every iteration, so p2 and p3 never run.
    assert_eq!(count("do_work"), 8);

    let destroys: Vec<&String> = log.iter().filter(|e| phase_of(e) == "destroy").collect();
    assert_eq!(
        destroys,
        vec!["destroy:p3", "destroy:p2", "destroy:p1", "destroy:p0"]
    );
    assert!(pipeline.plugin_states().iter().all(|(_, s)| *s == PluginState::Destroyed));
}

struct FailingInit;

impl Plugin for FailingInit {
    fn name(&self) -> &str {
        "failing_init"
    }

    fn init(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        anyhow::bail!("missing dependency")
    }

    fn do_work(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        unreachable!("do_work must not run after a failed init")
    }
}

#[test]
fn init_failure_aborts_startup_before_any_work() {
    let log = Log::default();
    let mut pipeline = Pipeline::new(runtime()).unwrap();
    pipeline.add_plugin(Tracer::boxed("first", &log, false, false)).unwrap();
    pipeline.add_plugin(Box::new(FailingInit)).unwrap();
    pipeline.add_plugin(Tracer::boxed("never", &log, false, false)).unwrap();

    let err = pipeline.setup().unwrap_err();
    assert!(err.to_string().contains("missing dependency"), "{err}");
    assert!(matches!(err, DriverError::Setup { .. }));
    assert_eq!(*log.lock().unwrap(), vec!["init:first", "destroy:first"]);
    assert_eq!(
        pipeline.plugin_states(),
        vec![
            ("first".to_string(), PluginState::Destroyed),
            ("failing_init".to_string(), PluginState::Loaded),
            ("never".to_string(), PluginState::Loaded),
        ]
    );
}

#[test]
fn pipelines_do_not_share_state() {
    let mut one = Pipeline::new(runtime()).unwrap();
    let mut two = Pipeline::new(runtime()).unwrap();
    one.add_plugin(Box::new(Producer)).unwrap();
    two.add_plugin(Box::new(Counter)).unwrap();
    one.setup().unwrap();
    two.setup().unwrap();
    one.run(Some(2)).unwrap();

    assert_eq!(one.runtime().store().len("x"), 2);
    assert_eq!(two.runtime().store().len("x"), 0);
    let leaked = one.teardown().leaked;
    assert_eq!(leaked, vec![("x".to_string(), 2)]);
    assert!(two.teardown().is_clean());
}
