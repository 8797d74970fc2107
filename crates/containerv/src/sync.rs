//! Setup handshake between the host and the forked child.
//!
//! The child reports each stage on the event pipe and blocks until the host
//! answers on the ack pipe. Both directions carry the same 8-byte record.

use crate::error::{Error, Result};
use bytemuck::{Pod, Zeroable};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub(crate) enum Stage {
    NsSetup = 1,
    CgroupsSetup = 2,
    NetworkSetup = 3,
    PolicySetup = 4,
    Up = 5,
    Down = 6,
}

impl Stage {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Stage::NsSetup,
            2 => Stage::CgroupsSetup,
            3 => Stage::NetworkSetup,
            4 => Stage::PolicySetup,
            5 => Stage::Up,
            6 => Stage::Down,
            _ => return None,
        })
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Stage::NsSetup => "WAITING_FOR_NS_SETUP",
            Stage::CgroupsSetup => "WAITING_FOR_CGROUPS_SETUP",
            Stage::NetworkSetup => "WAITING_FOR_NETWORK_SETUP",
            Stage::PolicySetup => "WAITING_FOR_POLICY_SETUP",
            Stage::Up => "CV_CONTAINER_UP",
            Stage::Down => "CV_CONTAINER_DOWN",
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SyncMessage {
    stage: u32,
    status: i32,
}

/// One end of the handshake: a pipe to write and a pipe to read.
pub(crate) struct Channel {
    tx: File,
    rx: File,
}

impl Channel {
    pub(crate) fn new(tx: OwnedFd, rx: OwnedFd) -> Self {
        Self {
            tx: File::from(tx),
            rx: File::from(rx),
        }
    }

    pub(crate) fn send(&mut self, stage: Stage, status: i32) -> Result<()> {
        let msg = SyncMessage {
            stage: stage as u32,
            status,
        };
        self.tx
            .write_all(bytemuck::bytes_of(&msg))
            .map_err(|err| Error::io(format!("send {}", stage.name()), err))
    }

    pub(crate) fn recv(&mut self) -> Result<(Stage, i32)> {
        let mut msg = SyncMessage::zeroed();
        self.rx
            .read_exact(bytemuck::bytes_of_mut(&mut msg))
            .map_err(|err| Error::io("sync pipe closed", err))?;
        let stage = Stage::from_raw(msg.stage)
            .ok_or_else(|| Error::Protocol(format!("unknown setup stage {}", msg.stage)))?;
        Ok((stage, msg.status))
    }

    /// Child side: announce `stage` and wait for the host's answer.
    pub(crate) fn request(&mut self, stage: Stage) -> Result<()> {
        self.send(stage, 0)?;
        let (acked, status) = self.recv()?;
        if acked != stage {
            return Err(Error::Protocol(format!(
                "expected ack for {}, got {}",
                stage.name(),
                acked.name()
            )));
        }
        if status != 0 {
            return Err(Error::ChildFailed {
                stage: stage.name(),
                status,
            });
        }
        Ok(())
    }
}

/// Host side ordering check: stages only move forward and nothing
/// follows UP or DOWN.
#[derive(Debug, Default)]
pub(crate) struct Sequencer {
    last: Option<Stage>,
}

impl Sequencer {
    pub(crate) fn accept(&mut self, stage: Stage) -> Result<()> {
        match self.last {
            Some(Stage::Up | Stage::Down) => Err(Error::Protocol(format!(
                "{} after the container finished setup",
                stage.name()
            ))),
            Some(last) if stage != Stage::Down && stage <= last => Err(Error::Protocol(format!(
                "{} out of order after {}",
                stage.name(),
                last.name()
            ))),
            _ => {
                self.last = Some(stage);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::thread;

    fn pair() -> (Channel, Channel) {
        let (event_rx, event_tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (ack_rx, ack_tx) = pipe2(OFlag::O_CLOEXEC).unwrap();
        (
            Channel::new(event_tx, ack_rx),
            Channel::new(ack_tx, event_rx),
        )
    }

    #[test]
    fn request_waits_for_the_ack() {
        let (mut child, mut host) = pair();
        let worker = thread::spawn(move || {
            child.request(Stage::NsSetup)?;
            child.request(Stage::CgroupsSetup)
        });
        let (stage, status) = host.recv().unwrap();
        assert_eq!((stage, status), (Stage::NsSetup, 0));
        host.send(Stage::NsSetup, 0).unwrap();
        let (stage, _) = host.recv().unwrap();
        assert_eq!(stage, Stage::CgroupsSetup);
        host.send(Stage::CgroupsSetup, libc::ENOSPC).unwrap();

        let err = worker.join().unwrap().unwrap_err();
        assert_eq!(err.errno(), libc::ENOSPC);
        assert!(err.to_string().contains("WAITING_FOR_CGROUPS_SETUP"));
    }

    #[test]
    fn closed_pipe_is_an_error() {
        let (child, mut host) = pair();
        drop(child);
        assert!(host.recv().is_err());
    }

    #[test]
    fn sequencer_enforces_order() {
        let mut seq = Sequencer::default();
        seq.accept(Stage::NsSetup).unwrap();
        seq.accept(Stage::NetworkSetup).unwrap();
        assert!(seq.accept(Stage::CgroupsSetup).is_err());
        seq.accept(Stage::Up).unwrap();
        assert!(seq.accept(Stage::PolicySetup).is_err());

        let mut seq = Sequencer::default();
        seq.accept(Stage::PolicySetup).unwrap();
        seq.accept(Stage::Down).unwrap();
        assert!(seq.accept(Stage::Down).is_err());
    }
}
