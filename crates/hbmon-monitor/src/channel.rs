//! The text command channel.
//!
//! Clients drive attach and detach by writing a decimal integer:
//! positive attaches to that group, negative detaches from it, zero is
//! invalid. The role (producer or consumer) is carried out of band by
//! which endpoint the client writes to.

use hbmon_core::error::{MonitorError, MonitorResult};
use hbmon_core::id::Caller;
use hbmon_core::kdebug;

use crate::attach::HeartRateMonitor;

/// Which endpoint a command arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

/// A parsed channel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Attach(i32),
    Detach(i32),
}

/// Parse a command from channel text.
///
/// Leading whitespace and a sign are accepted; parsing stops at the
/// first non-digit, and anything after the number is ignored. No
/// digits, a zero, or an out-of-range value is invalid.
pub fn parse(text: &str) -> MonitorResult<Command> {
    let rest = text.trim_start();
    let (negative, rest) = match rest.as_bytes().first() {
        Some(b'-') => (true, &rest[1..]),
        Some(b'+') => (false, &rest[1..]),
        _ => (false, rest),
    };
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return Err(MonitorError::InvalidArgument);
    }
    let gid: i32 = rest[..digits]
        .parse()
        .map_err(|_| MonitorError::InvalidArgument)?;
    if gid == 0 {
        return Err(MonitorError::InvalidArgument);
    }
    if negative {
        Ok(Command::Detach(gid))
    } else {
        Ok(Command::Attach(gid))
    }
}

/// Handle one channel write from `caller` in `role`.
pub fn write(
    monitor: &HeartRateMonitor,
    caller: Caller,
    role: Role,
    text: &str,
) -> MonitorResult<()> {
    let command = parse(text)?;
    kdebug!(
        "channel: tid {} {:?} -> {:?}",
        caller.task.0,
        role,
        command
    );
    match (role, command) {
        (Role::Producer, Command::Attach(gid)) => monitor.attach_producer(caller, gid),
        (Role::Producer, Command::Detach(gid)) => monitor.detach_producer(caller, gid),
        (Role::Consumer, Command::Attach(gid)) => monitor.attach_consumer(caller, gid),
        (Role::Consumer, Command::Detach(gid)) => monitor.detach_consumer(caller, gid),
    }
}
