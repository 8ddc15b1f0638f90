use super::{conf, drain};
use crate::keys;
use crate::log::LogLevel;
use crate::plugin::{Plugin, PluginCore};
use crate::value::{CTuple, ExitStatus};
use anyhow::Context;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

pub const NAME: &str = "run_target";

/// Argument replaced by the input file path.
pub const INPUT_FILE_MARKER: &str = "@@";

const DEFAULT_INPUT_FILE_NAME: &str = "cur_input";
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Waits for `child`, killing it once `timeout` has elapsed.
fn run_and_wait_with_timeout(
    mut child: Child,
    timeout: Option<Duration>,
) -> Result<Option<std::process::ExitStatus>, std::io::Error> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let start_time = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start_time.elapsed() > timeout {
            log::debug!("Target timed out after {timeout:?}, killing");
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn classify(status: std::process::ExitStatus) -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Crash(signal);
        }
    }
    ExitStatus::Normal(status.code().unwrap_or(-1))
}

/// Runs the target on the stitched `cur_input_chunks`.
///
/// The input goes through a file in the state directory when an argument is
/// `@@` (or `run_target.input_file` is true), through stdin otherwise. Each
/// iteration replaces `exit_status` and `exec_time` (`first` = nanoseconds).
#[derive(Default)]
pub struct RunTarget {
    target: Option<PathBuf>,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    input_file: Option<(PathBuf, File)>,
    timeout: Option<Duration>,
    input: Vec<u8>,
}

impl RunTarget {
    fn command(&self) -> Result<Command, anyhow::Error> {
        let target = self.target.as_ref().context("run_target used before init")?;
        let mut cmd = Command::new(target);
        cmd.args(&self.args).stdout(Stdio::null()).stderr(Stdio::null());
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        if self.input_file.is_some() {
            cmd.stdin(Stdio::null());
        } else {
            cmd.stdin(Stdio::piped());
        }
        Ok(cmd)
    }

    fn write_input_file(&mut self) -> Result<(), anyhow::Error> {
        if let Some((path, file)) = &mut self.input_file {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&self.input)
                .with_context(|| format!("Failed to write target input {path:?}"))?;
            file.flush()?;
        }
        Ok(())
    }
}

impl Plugin for RunTarget {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let target = keys::first_str(core.store(), keys::TARGET_BIN)
            .map(PathBuf::from)
            .context("No target binary configured")?;
        if !target.is_file() {
            anyhow::bail!("Failed to find target binary {target:?}");
        }

        self.timeout = conf::<u64>(core, "timeout_ms")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let wants_file = conf::<bool>(core, "input_file")?.unwrap_or(false);
        let file_name = conf::<String>(core, "input_path")?
            .unwrap_or_else(|| DEFAULT_INPUT_FILE_NAME.to_string());

        let args = keys::str_values(core.store(), keys::TARGET_ARGS);
        let needs_file = wants_file || args.iter().any(|a| a == INPUT_FILE_MARKER);
        if needs_file {
            let state_dir = keys::first_str(core.store(), keys::STATE_DIR)
                .context("No state directory published")?;
            let path = PathBuf::from(state_dir).join(file_name);
            let file = File::create(&path)
                .with_context(|| format!("Failed to create input file {path:?}"))?;
            let path_arg = path.to_string_lossy().into_owned();

            self.args = args
                .into_iter()
                .map(|a| if a == INPUT_FILE_MARKER { path_arg.clone() } else { a })
                .collect();
            if !self.args.contains(&path_arg) {
                self.args.push(path_arg);
            }
            core.push_back(keys::CUR_INPUT_PATH, crate::value::Value::str(path.to_string_lossy()))?;
            self.input_file = Some((path, file));
        } else {
            self.args = args;
        }

        self.cwd = keys::first_str(core.store(), keys::CWD).map(PathBuf::from);
        core.log(
            LogLevel::Info,
            format!("Running {target:?} {:?} (timeout {:?})", self.args, self.timeout),
        );
        self.target = Some(target);
        Ok(())
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.input.clear();
        for index in 0..core.len(keys::CUR_INPUT_CHUNKS) {
            let chunk = core
                .get(keys::CUR_INPUT_CHUNKS, index)
                .and_then(|v| v.as_bytes())
                .with_context(|| format!("Input chunk {index} holds no readable bytes"))?;
            self.input.extend_from_slice(chunk);
        }
        self.write_input_file()?;

        let start = Instant::now();
        let mut child = self
            .command()?
            .spawn()
            .context("Failed to spawn target")?;

        if let Some(mut stdin) = child.stdin.take() {
            // A target that exits without reading closes the pipe early.
            if let Err(e) = stdin.write_all(&self.input) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e).context("Failed to write target stdin");
                }
            }
        }

        let status = match run_and_wait_with_timeout(child, self.timeout)
            .context("Error waiting for target")?
        {
            Some(status) => classify(status),
            None => ExitStatus::Timeout,
        };
        let elapsed = start.elapsed();

        drain(core, keys::EXIT_STATUS);
        drain(core, keys::EXEC_TIME);
        core.push_back(keys::EXIT_STATUS, status)?;
        core.push_back(keys::EXEC_TIME, CTuple::new(elapsed.as_nanos() as usize, 0))?;
        if status.is_interesting() {
            core.log(LogLevel::Debug, format!("Target finished with {status:?}"));
        }
        Ok(())
    }

    fn destroy(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        drain(core, keys::EXIT_STATUS);
        drain(core, keys::EXEC_TIME);
        drain(core, keys::CUR_INPUT_PATH);
        if let Some((path, file)) = self.input_file.take() {
            drop(file);
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove target input {path:?}: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::builtin::testing::Harness;
    use crate::value::{CVec, ForeignValue, Value, ValueKind};

    fn harness(args: &[&str], timeout_ms: u64, state_dir: &std::path::Path) -> Harness {
        let mut harness = Harness::new(NAME);
        harness.conf("run_target.timeout_ms", &timeout_ms.to_string());
        let store = &mut harness.store;
        store.push_back(keys::TARGET_BIN, Value::str("/bin/sh")).unwrap();
        for arg in args {
            store.push_back(keys::TARGET_ARGS, Value::str(*arg)).unwrap();
        }
        store
            .push_back(keys::STATE_DIR, Value::str(state_dir.to_string_lossy()))
            .unwrap();
        harness
    }

    fn run_once(plugin: &mut RunTarget, core: &mut PluginCore<'_>, input: &[u8]) -> ExitStatus {
        core.push_back(keys::CUR_INPUT_CHUNKS, input.to_vec()).unwrap();
        plugin.do_work(core).unwrap();
        core.pop_front(keys::CUR_INPUT_CHUNKS);
        let tuple = core.get(keys::EXIT_STATUS, 0).and_then(Value::as_tuple).unwrap();
        ExitStatus::from_tuple(tuple).unwrap()
    }

    #[test]
    fn exit_codes_are_normal_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = harness(&["-c", "exit 3"], 5000, dir.path());
        let mut plugin = RunTarget::default();
        let mut core = harness.core();
        plugin.init(&mut core).unwrap();
        assert_eq!(run_once(&mut plugin, &mut core, b""), ExitStatus::Normal(3));
        assert_eq!(core.len(keys::EXEC_TIME), 1);
        plugin.destroy(&mut core).unwrap();
        assert!(core.is_empty(keys::EXIT_STATUS));
    }

    #[test]
    fn signals_are_crashes() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = harness(&["-c", "kill -SEGV $$"], 5000, dir.path());
        let mut plugin = RunTarget::default();
        let mut core = harness.core();
        plugin.init(&mut core).unwrap();
        assert_eq!(run_once(&mut plugin, &mut core, b""), ExitStatus::Crash(11));
    }

    #[test]
    fn slow_targets_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = harness(&["-c", "sleep 5"], 50, dir.path());
        let mut plugin = RunTarget::default();
        let mut core = harness.core();
        plugin.init(&mut core).unwrap();
        let start = Instant::now();
        assert_eq!(run_once(&mut plugin, &mut core, b""), ExitStatus::Timeout);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn stdin_delivery_feeds_the_input() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"read line; [ "$line" = "crash" ] && kill -ABRT $$; exit 0"#;
        let mut harness = harness(&["-c", script], 5000, dir.path());
        let mut plugin = RunTarget::default();
        let mut core = harness.core();
        plugin.init(&mut core).unwrap();
        assert_eq!(run_once(&mut plugin, &mut core, b"fine\n"), ExitStatus::Normal(0));
        assert!(matches!(
            run_once(&mut plugin, &mut core, b"crash\n"),
            ExitStatus::Crash(_)
        ));
    }

    #[test]
    fn file_delivery_substitutes_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"[ "$(cat "$0")" = "boom" ] && exit 7; exit 0"#;
        let mut harness = harness(&["-c", script, "@@"], 5000, dir.path());
        let mut plugin = RunTarget::default();
        let mut core = harness.core();
        plugin.init(&mut core).unwrap();

        let input_path = dir.path().join("cur_input");
        assert_eq!(
            keys::first_str(core.store(), keys::CUR_INPUT_PATH),
            Some(input_path.to_string_lossy().into_owned())
        );
        assert_eq!(run_once(&mut plugin, &mut core, b"boom"), ExitStatus::Normal(7));
        assert_eq!(run_once(&mut plugin, &mut core, b"calm"), ExitStatus::Normal(0));
        assert_eq!(std::fs::read(&input_path).unwrap(), b"calm");
    }

    #[test]
    fn foreign_chunks_reach_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"[ "$(cat "$0")" = "boom" ] && exit 7; exit 0"#;
        let mut harness = harness(&["-c", script, "@@"], 5000, dir.path());
        let mut plugin = RunTarget::default();
        let mut core = harness.core();
        plugin.init(&mut core).unwrap();

        let module_buffer = Box::into_raw(Box::new(CVec::from(b"bo".to_vec())));
        // SAFETY: the buffer outlives its use in the store below.
        let foreign = unsafe { ForeignValue::new(ValueKind::Buffer, module_buffer.cast()) };
        core.push_back(keys::CUR_INPUT_CHUNKS, Value::Foreign(foreign)).unwrap();
        assert_eq!(run_once(&mut plugin, &mut core, b"om"), ExitStatus::Normal(7));

        core.pop_front(keys::CUR_INPUT_CHUNKS);
        // SAFETY: nothing refers to the buffer any more.
        drop(unsafe { Box::from_raw(module_buffer) });
    }

    #[test]
    fn unreadable_chunks_fail_the_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = harness(&["-c", "exit 0"], 5000, dir.path());
        let mut plugin = RunTarget::default();
        let mut core = harness.core();
        plugin.init(&mut core).unwrap();

        // SAFETY: a null payload is never read.
        let empty = unsafe { ForeignValue::new(ValueKind::Buffer, std::ptr::null_mut()) };
        core.push_back(keys::CUR_INPUT_CHUNKS, Value::Foreign(empty)).unwrap();
        let err = plugin.do_work(&mut core).unwrap_err();
        assert!(err.to_string().contains("chunk 0"), "got: {err}");
        assert!(core.is_empty(keys::EXIT_STATUS), "the target never ran");
    }

    #[test_log::test]
    fn destroy_survives_an_already_removed_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = harness(&["-c", "exit 0", "@@"], 5000, dir.path());
        let mut plugin = RunTarget::default();
        let mut core = harness.core();
        plugin.init(&mut core).unwrap();

        std::fs::remove_file(dir.path().join("cur_input")).unwrap();
        plugin.destroy(&mut core).unwrap();
        assert!(core.is_empty(keys::CUR_INPUT_PATH));
    }

    #[test]
    fn missing_target_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new(NAME);
        harness
            .store
            .push_back(keys::TARGET_BIN, Value::str(dir.path().join("nope").to_string_lossy()))
            .unwrap();
        let mut plugin = RunTarget::default();
        assert!(plugin.init(&mut harness.core()).is_err());
    }
}
