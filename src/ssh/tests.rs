//! Unit tests for the SSH data path.

use rstest::{fixture, rstest};

use super::args::{Direction, scp_args, ssh_args};
use super::*;
use crate::model::{CopyInput, HostBuilder, PlatformOs};
use crate::test_support::{ScriptedRunner, sample_host};

#[fixture]
fn config() -> SshConfig {
    SshConfig {
        ssh_bin: "ssh".to_owned(),
        scp_bin: "scp".to_owned(),
        ssh_user: "root".to_owned(),
        ssh_batch_mode: true,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: "/dev/null".to_owned(),
        ssh_identity_file: None,
        connect_timeout_secs: 10,
        transfer_timeout_secs: 300,
    }
}

fn strings(args: &[std::ffi::OsString]) -> Vec<String> {
    args.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

async fn open(
    factory: &SshConnectionFactory<ScriptedRunner>,
    host: &Host,
) -> (Arc<dyn Connection>, Arc<dyn ContentTransferAgent>) {
    let connection = ConnectionFactory::connect(factory, host)
        .await
        .expect("connection opens");
    let agent = ContentTransferAgentFactory::connect(factory, "req", Arc::clone(&connection), host)
        .await
        .expect("agent opens");
    (connection, agent)
}

#[rstest]
fn ssh_args_escape_extra_arguments(config: SshConfig) {
    let input = CommandInput::new("ls -la | head").arg("my dir").arg("it's");
    let args = strings(&ssh_args(&config, &sample_host(1), &input));

    assert_eq!(
        args,
        vec![
            "-p",
            "22",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=10",
            "root@host-1.example.com",
            "ls -la | head 'my dir' 'it'\\''s'",
        ]
    );
}

#[rstest]
fn ssh_args_include_proxy_and_identity(mut config: SshConfig) {
    config.ssh_identity_file = Some("/keys/id_ed25519".to_owned());
    config.ssh_batch_mode = false;
    config.ssh_strict_host_key_checking = true;
    config.connect_timeout_secs = 0;
    let host = HostBuilder::default()
        .device_id("edge")
        .host_name("edge.internal")
        .port(2222)
        .proxy_jump(Some("bastion.example.com".to_owned()))
        .platform(PlatformOs::new("unix", "arm64"))
        .build()
        .expect("valid host");

    let args = strings(&ssh_args(&config, &host, &CommandInput::new("true")));

    assert_eq!(
        args,
        vec![
            "-p",
            "2222",
            "-J",
            "bastion.example.com",
            "-i",
            "/keys/id_ed25519",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "root@edge.internal",
            "true",
        ]
    );
}

#[rstest]
#[case::send(Direction::Send, "./build", "root@host-1.example.com:/srv/build")]
#[case::receive(Direction::Receive, "root@host-1.example.com:./build", "/srv/build")]
fn scp_args_follow_direction(
    config: SshConfig,
    #[case] direction: Direction,
    #[case] first: &str,
    #[case] second: &str,
) {
    let input = CopyInput::new("./build", "/srv/build").recursive();
    let args = strings(&scp_args(&config, &sample_host(1), &input, direction));

    assert_eq!(args.first().map(String::as_str), Some("-P"));
    assert!(args.iter().any(|arg| arg == "-r"));
    let tail: Vec<&str> = args.iter().rev().take(2).rev().map(String::as_str).collect();
    assert_eq!(tail, vec![first, second]);
}

#[rstest]
fn scp_brackets_ipv6_hosts(config: SshConfig) {
    let host = HostBuilder::default()
        .device_id("v6")
        .host_name("fd00::1")
        .platform(PlatformOs::new("unix", "amd64"))
        .build()
        .expect("valid host");
    let input = CopyInput::new("a.txt", "/tmp/a.txt");

    let args = strings(&scp_args(&config, &host, &input, Direction::Send));

    assert!(!args.iter().any(|arg| arg == "-r"));
    assert_eq!(
        args.last().map(String::as_str),
        Some("root@[fd00::1]:/tmp/a.txt")
    );
}

#[rstest]
#[case::bin(|cfg: &mut SshConfig| cfg.ssh_bin = "  ".to_owned(), "DEVICE_POOL_SSH_SSH_BIN")]
#[case::user(|cfg: &mut SshConfig| cfg.ssh_user = String::new(), "DEVICE_POOL_SSH_SSH_USER")]
#[case::identity(|cfg: &mut SshConfig| cfg.ssh_identity_file = Some(" ".to_owned()), "DEVICE_POOL_SSH_SSH_IDENTITY_FILE")]
#[case::transfer(|cfg: &mut SshConfig| cfg.transfer_timeout_secs = 0, "DEVICE_POOL_SSH_TRANSFER_TIMEOUT_SECS")]
fn factory_rejects_invalid_config(
    mut config: SshConfig,
    #[case] mutate: fn(&mut SshConfig),
    #[case] env_var: &str,
) {
    mutate(&mut config);
    let Err(ConfigError::Invalid(message)) = SshConnectionFactory::new(config, ScriptedRunner::new())
    else {
        panic!("factory should reject config missing {env_var}");
    };
    assert!(message.contains(env_var), "message was {message}");
}

#[rstest]
#[tokio::test]
async fn execute_passes_stdin_and_timeout(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "hello\n", "");
    let factory = SshConnectionFactory::new(config, runner.clone()).expect("valid config");
    let (connection, _agent) = open(&factory, &sample_host(1)).await;

    let input = CommandInput::new("cat")
        .stdin(b"hello\n".to_vec())
        .timeout(Duration::from_secs(3));
    let output = connection.execute(&input).await.expect("command runs");

    assert_eq!(output.to_utf8_string().expect("exit 0"), "hello\n");
    assert_eq!(output.original_input, input);
    let invocations = runner.invocations();
    let call = invocations.first().expect("one call");
    assert_eq!(call.program, "ssh");
    assert_eq!(call.stdin.as_deref(), Some(b"hello\n".as_slice()));
    assert_eq!(call.timeout, Duration::from_secs(3));
    assert!(call.command_string().ends_with("root@host-1.example.com cat"));
}

#[rstest]
#[tokio::test]
async fn non_zero_exit_is_returned_not_raised(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(2), "", "no such file");
    let factory = SshConnectionFactory::new(config, runner).expect("valid config");
    let (connection, _agent) = open(&factory, &sample_host(1)).await;

    let output = connection
        .execute(&CommandInput::new("ls /missing"))
        .await
        .expect("command ran");

    assert_eq!(output.exit_code, 2);
    assert!(matches!(
        output.to_bytes(),
        Err(ConnectionError::NonZeroExit { exit_code: 2, .. })
    ));
}

#[rstest]
#[tokio::test]
async fn exit_255_means_unreachable(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(SSH_CONNECTION_FAILURE), "", "Connection refused");
    let factory = SshConnectionFactory::new(config, runner).expect("valid config");
    let (connection, _agent) = open(&factory, &sample_host(1)).await;

    let err = connection
        .execute(&CommandInput::new("true"))
        .await
        .expect_err("host unreachable");

    assert_eq!(
        err,
        ConnectionError::Unreachable {
            host: "host-1.example.com".to_owned(),
            message: "Connection refused".to_owned(),
        }
    );
}

#[rstest]
#[tokio::test]
async fn missing_exit_code_is_an_error(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_missing_exit_code();
    let factory = SshConnectionFactory::new(config, runner).expect("valid config");
    let (connection, _agent) = open(&factory, &sample_host(1)).await;

    let err = connection
        .execute(&CommandInput::new("sleep 100"))
        .await
        .expect_err("killed by signal");

    assert_eq!(
        err,
        ConnectionError::MissingExitCode {
            program: "ssh".to_owned()
        }
    );
}

#[rstest]
#[tokio::test]
async fn failed_copy_reports_status_and_stderr(config: SshConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_output(Some(1), "", "permission denied");
    let factory = SshConnectionFactory::new(config, runner.clone()).expect("valid config");
    let (_connection, agent) = open(&factory, &sample_host(1)).await;
    let input = CopyInput::new("./out", "/srv/out");

    agent.send(&input).await.expect("first copy succeeds");
    let err = agent.receive(&input).await.expect_err("second copy fails");

    assert_eq!(
        err,
        TransferError::CommandFailure {
            program: "scp".to_owned(),
            status_text: "exit code 1".to_owned(),
            stderr: "permission denied".to_owned(),
        }
    );
    let timeouts: Vec<Duration> = runner
        .invocations()
        .iter()
        .map(|call| call.timeout)
        .collect();
    assert_eq!(timeouts, vec![Duration::from_secs(300); 2]);
}

#[rstest]
#[tokio::test]
async fn spawn_failure_surfaces_as_connection_error(config: SshConfig) {
    let runner = ScriptedRunner::new();
    let factory = SshConnectionFactory::new(config, runner).expect("valid config");
    let (connection, _agent) = open(&factory, &sample_host(1)).await;

    let err = connection
        .execute(&CommandInput::new("true"))
        .await
        .expect_err("nothing scripted");

    assert!(matches!(err, ConnectionError::Spawn { .. }));
}
