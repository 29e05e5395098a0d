//! Command construction and failure reporting for mt, mtx and dd.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tapevault_core::config::{TapeDriveConf, TapeRobotConf};
use tapevault_device::{
    CommandOutput, DeviceError, DeviceResult, ProcessExecutor, TapeDriveCommandService,
    TapeLoadUnloadService, TapeReadWriteService, drive_from_config, robot_from_config,
};

#[derive(Debug, Clone, PartialEq)]
struct Invocation {
    program: String,
    timeout: Duration,
    args: Vec<String>,
}

/// Records invocations and answers with a canned output.
struct RecordingExecutor {
    calls: Mutex<Vec<Invocation>>,
    output: CommandOutput,
}

impl RecordingExecutor {
    fn answering(exit_code: i32, stdout: &str, stderr: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            output: CommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                timed_out: false,
            },
        })
    }

    fn ok() -> Arc<Self> {
        Self::answering(0, "", "")
    }

    fn last(&self) -> Invocation {
        self.calls.lock().unwrap().last().cloned().unwrap()
    }
}

impl ProcessExecutor for RecordingExecutor {
    fn execute(
        &self,
        program: &str,
        timeout: Duration,
        args: &[String],
    ) -> DeviceResult<CommandOutput> {
        self.calls.lock().unwrap().push(Invocation {
            program: program.to_string(),
            timeout,
            args: args.to_vec(),
        });
        Ok(self.output.clone())
    }
}

fn drive_conf() -> TapeDriveConf {
    TapeDriveConf {
        index: 0,
        device: "/dev/nst0".to_string(),
        mt_path: "/bin/mt".to_string(),
        dd_path: "/bin/dd".to_string(),
        timeout_ms: 1000,
        read_write_timeout_ms: 5000,
        block_size: 262144,
    }
}

fn robot_conf() -> TapeRobotConf {
    TapeRobotConf {
        device: "/dev/sg0".to_string(),
        mtx_path: "/usr/sbin/mtx".to_string(),
        timeout_ms: 2000,
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_rewind_invokes_mt() {
    let executor = RecordingExecutor::ok();
    let drive = drive_from_config(&drive_conf(), executor.clone());
    drive.commands.rewind().unwrap();

    assert_eq!(
        executor.last(),
        Invocation {
            program: "/bin/mt".into(),
            timeout: Duration::from_millis(1000),
            args: args(&["-f", "/dev/nst0", "rewind"]),
        }
    );
}

#[test]
fn test_move_position_flags() {
    let executor = RecordingExecutor::ok();
    let drive = drive_from_config(&drive_conf(), executor.clone());

    drive.commands.move_position(5, false).unwrap();
    assert_eq!(executor.last().args, args(&["-f", "/dev/nst0", "fsf", "5"]));

    drive.commands.move_position(5, true).unwrap();
    assert_eq!(executor.last().args, args(&["-f", "/dev/nst0", "bsfm", "6"]));

    drive.commands.go_to_end().unwrap();
    assert_eq!(executor.last().args, args(&["-f", "/dev/nst0", "eod"]));
}

#[test]
fn test_failure_carries_stderr() {
    let executor = RecordingExecutor::answering(1, "", "X");
    let drive = drive_from_config(&drive_conf(), executor);
    let err = drive.commands.rewind().unwrap_err();

    assert!(matches!(err, DeviceError::Command { .. }));
    assert_eq!(err.output().unwrap().stderr, "X");
    assert_eq!(err.output().unwrap().exit_code, Some(1));
    assert!(err.to_string().contains("X"));
}

#[test]
fn test_timeout_is_a_failure() {
    let executor = Arc::new(RecordingExecutor {
        calls: Mutex::new(Vec::new()),
        output: CommandOutput {
            exit_code: None,
            timed_out: true,
            ..Default::default()
        },
    });
    let drive = drive_from_config(&drive_conf(), executor);
    let err = drive.commands.go_to_end().unwrap_err();
    assert!(err.output().unwrap().timed_out);
}

#[test]
fn test_drive_status_parsed() {
    let executor = RecordingExecutor::answering(
        0,
        "SCSI 2 tape drive:\nFile number=0, block number=0, partition=0.\n\
         General status bits on (41010000):\n BOT ONLINE IM_REP_EN\n",
        "",
    );
    let drive = drive_from_config(&drive_conf(), executor.clone());
    let status = drive.commands.status().unwrap();
    assert!(status.at_beginning());
    assert!(status.has_tape());
    assert_eq!(executor.last().args, args(&["-f", "/dev/nst0", "status"]));
}

#[test]
fn test_robot_load_unload_args() {
    let executor = RecordingExecutor::ok();
    let robot = robot_from_config(&robot_conf(), executor.clone());

    robot.load_tape(3, 1).unwrap();
    let call = executor.last();
    assert_eq!(call.program, "/usr/sbin/mtx");
    assert_eq!(call.timeout, Duration::from_millis(2000));
    assert_eq!(call.args, args(&["-f", "/dev/sg0", "load", "3", "1"]));

    robot.unload_tape(3, 1).unwrap();
    assert_eq!(executor.last().args, args(&["-f", "/dev/sg0", "unload", "3", "1"]));
}

#[test]
fn test_robot_failure_messages() {
    let executor = RecordingExecutor::answering(2, "", "Source Element Address 3 is Empty");
    let robot = robot_from_config(&robot_conf(), executor);

    let err = robot.load_tape(3, 1).unwrap_err();
    assert!(err.to_string().starts_with("Could not load tape from slot 3 into drive 1"));
    let err = robot.unload_tape(3, 1).unwrap_err();
    assert!(err.to_string().starts_with("Could not unload tape from drive 1 into slot 3"));
    let err = robot.status().unwrap_err();
    assert!(err.to_string().starts_with("Could not retrieve tape library status"));
}

#[test]
fn test_dd_uses_read_write_timeout() {
    let executor = RecordingExecutor::ok();
    let drive = drive_from_config(&drive_conf(), executor.clone());

    drive.read_write.write_to_tape(Path::new("/tmp/a.tar")).unwrap();
    let call = executor.last();
    assert_eq!(call.program, "/bin/dd");
    assert_eq!(call.timeout, Duration::from_millis(5000));
    assert_eq!(call.args, args(&["if=/tmp/a.tar", "of=/dev/nst0", "bs=262144"]));

    drive.read_write.read_from_tape(Path::new("/tmp/b.tar")).unwrap();
    assert_eq!(
        executor.last().args,
        args(&["if=/dev/nst0", "of=/tmp/b.tar", "bs=262144"])
    );
}
