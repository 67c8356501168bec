//! Test utilities & fixtures.
//! Provides a scripted stand-in for meshcore-cli and a matching bridge config.

use meshcore_bridge::bridge::Bridge;
use meshcore_bridge::config::Config;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// `/bin/sh` script standing in for meshcore-cli. Every stdin line is appended
/// to the file named by `$1` so tests can see exactly what reached the process.
pub const FAKE_CLI: &str = r#"
log="$1"
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$log"
  case "$line" in
    pending_contacts)
      if [ ! -e "$log.no-pending" ]; then
        echo "Skyllancer: f9ef 123abc"
        echo "garbage line"
      fi
      ;;
    badutf8)
      printf 'Node\377name: ab\n'
      ;;
    advert_burst)
      for i in 1 2 3 4 5 6 7 8; do
        echo "{\"type\":\"ADVERTISEMENT\",\"adv_name\":\"n$i\"}"
      done
      echo "burst sent"
      ;;
    "apply_to "*)
      echo "removed 2 contacts"
      ;;
    advert_then_reply)
      echo '{"type":"ADVERTISEMENT","adv_name":"Bob","public_key":"beef"}'
      echo "reply done"
      ;;
    get_channels)
      echo "0: Public [8b3387e9c5cdea6ac9e5edbaa115cd72]"
      echo "1: hiking"
      ;;
    infos)
      echo '{"name":"FakeNode","tx_power":22}'
      ;;
    crash)
      exit 3
      ;;
    close_stdout)
      exec 1>&-
      ;;
    slow)
      sleep 2
      echo "late"
      ;;
    warn)
      echo "careful" >&2
      echo "done"
      ;;
    "echo "*)
      printf '%s\n' "${line#echo }"
      ;;
    "add_pending "*)
      echo "added ${line#add_pending }"
      ;;
    "chan "*)
      echo "sent"
      ;;
    "set "*)
      echo "ok"
      ;;
  esac
done
"#;

/// Config wired to [`FAKE_CLI`] with short timings, rooted in `dir`.
pub fn fake_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.bridge.device_name = "TestNode".to_string();
    config.bridge.config_dir = dir.join("meshcore").display().to_string();
    config.storage.data_dir = dir.join("data").display().to_string();
    config.cli.binary = "/bin/sh".to_string();
    config.cli.args = Some(vec![
        "-c".to_string(),
        FAKE_CLI.to_string(),
        "fake-meshcore-cli".to_string(),
        stdin_log_path(dir).display().to_string(),
    ]);
    config.session.quiet_period_ms = 150;
    config.session.command_timeout_ms = 3000;
    config.session.init_settle_ms = 200;
    config.session.stop_timeout_ms = 1000;
    config.watchdog.interval_ms = 100;
    config.watchdog.initial_backoff_ms = 50;
    config.watchdog.max_backoff_ms = 200;
    config.watchdog.max_attempts = 3;
    config.http.bind = "127.0.0.1:0".to_string();
    std::fs::create_dir_all(dir.join("meshcore")).expect("config dir");
    config
}

pub fn stdin_log_path(dir: &Path) -> PathBuf {
    dir.join("stdin.log")
}

/// Make the fake CLI answer `pending_contacts` with no output at all.
#[allow(dead_code)]
pub fn clear_pending_contacts(dir: &Path) {
    let marker = PathBuf::from(format!("{}.no-pending", stdin_log_path(dir).display()));
    std::fs::write(marker, "").expect("pending marker");
}

/// Lines the fake CLI has received so far, across every session.
#[allow(dead_code)]
pub fn stdin_lines(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(stdin_log_path(dir))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Poll a synchronous condition until it holds or `limit` elapses.
#[allow(dead_code)]
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until the live session has the given generation.
#[allow(dead_code)]
pub async fn wait_for_generation(bridge: &Bridge, generation: u64, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if bridge.session().alive_generation().await == Some(generation) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(25)).await;
    }
}
