//! Argument builders for the `ssh` and `scp` clients.

use std::ffi::OsString;

use camino::Utf8Path;
use shell_escape::unix::escape;

use super::SshConfig;
use crate::model::{CommandInput, CopyInput, Host};

/// Expands a leading `~/` prefix to the user's home directory, leaving the
/// path unchanged when `HOME` is unset.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Renders a command for the remote shell.
///
/// `line` is passed verbatim so callers may use shell syntax; every extra
/// argument is escaped.
#[must_use]
pub fn render_remote_command(input: &CommandInput) -> String {
    let mut rendered = input.line.clone();
    for arg in &input.args {
        rendered.push(' ');
        rendered.push_str(&escape(arg.as_str().into()));
    }
    rendered
}

/// Flag each client uses to select the port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum PortFlag {
    Ssh,
    Scp,
}

impl PortFlag {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "-p",
            Self::Scp => "-P",
        }
    }
}

pub(super) fn common_options(config: &SshConfig, host: &Host, flag: PortFlag) -> Vec<OsString> {
    let mut args = vec![
        OsString::from(flag.as_str()),
        OsString::from(host.port.to_string()),
    ];

    if let Some(proxy) = &host.proxy_jump {
        args.push(OsString::from("-J"));
        args.push(OsString::from(proxy));
    }

    if let Some(identity_file) = &config.ssh_identity_file {
        args.push(OsString::from("-i"));
        args.push(OsString::from(expand_tilde(identity_file)));
    }

    if config.ssh_batch_mode {
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
    }

    if !config.ssh_strict_host_key_checking {
        args.push(OsString::from("-o"));
        args.push(OsString::from("StrictHostKeyChecking=no"));
    }

    if !config.ssh_known_hosts_file.trim().is_empty() {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "UserKnownHostsFile={}",
            config.ssh_known_hosts_file
        )));
    }

    if config.connect_timeout_secs > 0 {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            config.connect_timeout_secs
        )));
    }

    args
}

fn login(config: &SshConfig, host: &Host) -> String {
    format!("{}@{}", config.ssh_user, host.host_name)
}

fn remote_path(config: &SshConfig, host: &Host, path: &Utf8Path) -> String {
    if host.host_name.contains(':') {
        format!("{}@[{}]:{path}", config.ssh_user, host.host_name)
    } else {
        format!("{}:{path}", login(config, host))
    }
}

pub(super) fn ssh_args(config: &SshConfig, host: &Host, input: &CommandInput) -> Vec<OsString> {
    let mut args = common_options(config, host, PortFlag::Ssh);
    args.push(OsString::from(login(config, host)));
    args.push(OsString::from(render_remote_command(input)));
    args
}

/// Direction of an `scp` transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Direction {
    Send,
    Receive,
}

pub(super) fn scp_args(
    config: &SshConfig,
    host: &Host,
    input: &CopyInput,
    direction: Direction,
) -> Vec<OsString> {
    let mut args = common_options(config, host, PortFlag::Scp);
    if input.is_recursive() {
        args.push(OsString::from("-r"));
    }
    match direction {
        Direction::Send => {
            args.push(OsString::from(input.source.as_str()));
            args.push(OsString::from(remote_path(
                config,
                host,
                &input.destination,
            )));
        }
        Direction::Receive => {
            args.push(OsString::from(remote_path(config, host, &input.source)));
            args.push(OsString::from(input.destination.as_str()));
        }
    }
    args
}
