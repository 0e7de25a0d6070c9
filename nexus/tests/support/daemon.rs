use std::{
    net::TcpStream,
    path::{Path, PathBuf},
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;
use tempfile::TempDir;

use super::{free_addr, nexus_bin};

/// Proc is a helper handle for a `nexus serve` subprocess. It kills the
/// subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    _tmp_dir: TempDir,
    pub tmp_dir: PathBuf,
    pub bind_addr: String,
    pub log_file: PathBuf,
}

impl Proc {
    /// Spawns a daemon with no config file, bound to a random local port.
    pub fn spawn() -> anyhow::Result<Proc> {
        Proc::spawn_with_config(None)
    }

    pub fn spawn_with_config<P: AsRef<Path>>(config_file: Option<P>) -> anyhow::Result<Proc> {
        let tmp_dir =
            tempfile::Builder::new().prefix("nexus-test").rand_bytes(20).tempdir().context("creating tmp dir")?;
        let bind_addr = free_addr();
        let log_file = tmp_dir.path().join("daemon.log");

        let mut cmd = Command::new(nexus_bin()?);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("serve")
            .arg("--bind")
            .arg(&bind_addr)
            .arg("--log-file")
            .arg(&log_file);
        if let Some(config_file) = config_file {
            cmd.arg("--config-file").arg(config_file.as_ref());
        }

        let proc = cmd.spawn().context("spawning nexus serve process")?;

        // spin until we can dial the listener successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if TcpStream::connect(&bind_addr).is_ok() {
                break;
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }

        Ok(Proc { proc, tmp_dir: tmp_dir.path().to_path_buf(), _tmp_dir: tmp_dir, bind_addr, log_file })
    }

    pub fn connect(&self) -> anyhow::Result<TcpStream> {
        TcpStream::connect(&self.bind_addr).context("connecting to daemon under test")
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        let _ = self.proc.kill();
        let _ = self.proc.wait();
    }
}
