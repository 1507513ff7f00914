use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// `vxfuzz` command isolated from the caller's config and environment.
pub fn vxfuzz(cwd: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vxfuzz"));
    cmd.current_dir(cwd)
        .env("HOME", cwd)
        .env("XDG_CONFIG_HOME", cwd.join(".config"))
        .env_remove("VXFUZZ_CONFIG")
        .env_remove("VXFUZZ_LOG")
        .env_remove("VXFUZZ_TARGET_ADDR")
        .env_remove("VXFUZZ_TARGET_PORT")
        .env_remove("VXFUZZ_TARGET_VERSION");
    cmd
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("Failed to write script");
    let mut perms = fs::metadata(path).expect("stat script").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod script");
}

/// Fake `vmrun`, fake debug agent and a local echo service in a temp dir.
pub struct HarnessFixture {
    pub dir: TempDir,
    pub vmrun: PathBuf,
    pub vmx: PathBuf,
    pub agent: PathBuf,
    pub config: PathBuf,
    pub crash_log: PathBuf,
    pub session_log: PathBuf,
    pub port: u16,
}

impl HarnessFixture {
    /// `crash_once`: the first debug connection reports a fault.
    pub fn new(crash_once: bool) -> Self {
        crate::test_log!("FIXTURE: Creating fake VM environment");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path();
        let vmrun = root.join("vmrun");
        let vmx = root.join("vx6.vmx");
        let agent = root.join("wdb-agent");
        let state = root.join("vm.running");
        let crashed = root.join("agent.crashed");

        fs::write(&vmx, "config.version = \"8\"\n").expect("Failed to write vmx");
        write_script(
            &vmrun,
            &format!(
                r#"#!/bin/sh
case "$1" in
  start) touch "{state}" ;;
  revertToSnapshot|stop|suspend) rm -f "{state}" ;;
  list)
    if [ -e "{state}" ]; then
      echo "Total running VMs: 1"
      echo "{vmx}"
    else
      echo "Total running VMs: 0"
    fi
    ;;
  *) echo "unknown command $1" >&2; exit 1 ;;
esac
"#,
                state = state.display(),
                vmx = vmx.display()
            ),
        );

        let crash_step = if crash_once {
            format!(
                r#"if [ ! -e "{crashed}" ]; then
  touch "{crashed}"
  echo '{{"event":"crash","context":{{"task":"tPortmapd","pc":"0x0010a2c4"}}}}'
fi
"#,
                crashed = crashed.display()
            )
        } else {
            String::new()
        };
        write_script(
            &agent,
            &format!(
                "#!/bin/sh\necho '{{\"event\":\"ready\"}}'\nread cmd\n{crash_step}while read line; do :; done\n"
            ),
        );

        let port = spawn_echo_service();
        let crash_log = root.join("crashes.jsonl");
        let session_log = root.join("session.log");
        let config = root.join("vxfuzz.toml");
        fs::write(
            &config,
            format!(
                r#"[vmware]
vmrun = "{vmrun}"
vm_path = "{vmx}"
snapshot = "portmap-ready"

[target]
address = "127.0.0.1"
port = {port}
version = 6
transport_timeout = "500ms"

[debug]
agent = "{agent}"
connect_timeout = "5s"

[session]
poll_interval = "10ms"
settle_delay = "20ms"
log_file = "{session_log}"
crash_log = "{crash_log}"
"#,
                vmrun = vmrun.display(),
                vmx = vmx.display(),
                agent = agent.display(),
                session_log = session_log.display(),
                crash_log = crash_log.display(),
            ),
        )
        .expect("Failed to write vxfuzz.toml");

        Self {
            dir,
            vmrun,
            vmx,
            agent,
            config,
            crash_log,
            session_log,
            port,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Accepts forever, echoing one read per connection.
fn spawn_echo_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind echo service");
    let port = listener.local_addr().expect("local addr").port();
    std::thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            std::thread::spawn(move || {
                let mut buf = [0u8; 512];
                if let Ok(n) = stream.read(&mut buf) {
                    let _ = stream.write_all(&buf[..n]);
                }
            });
        }
    });
    port
}
