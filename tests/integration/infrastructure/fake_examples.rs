use anyhow::{Context, Result};
use example_harness::scenarios::Examples;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Argument parsing shared by every stand-in, followed by the per-address state key.
///
/// Messages "in flight" live in `$key.msgs`, one `{"sequence"=N}` line each.
const PRELUDE: &str = r#"
addr=""
count=100
delay=0
while [ $# -gt 0 ]; do
  case "$1" in
    -a) addr="$2"; shift 2 ;;
    -m*) count="${1#-m}"; shift ;;
    -d*) delay="${1#-d}"; shift ;;
    *) echo "unknown argument: $1" >&2; exit 2 ;;
  esac
done
key="@STATE@/$(printf %s "$addr" | tr -c 'A-Za-z0-9' '_')"

lines() {
  if [ -f "$1" ]; then wc -l < "$1" | tr -d ' '; else echo 0; fi
}

produce() {
  i=1
  while [ "$i" -le "$1" ]; do
    printf '{"sequence"=%d}\n' "$i" >> "$key.msgs"
    if [ "$2" -gt 0 ]; then sleep "$(awk "BEGIN { print $2 / 1000 }")"; fi
    i=$((i + 1))
  done
}
"#;

const BROKER: &str = r#"
echo "listening on $addr"
exec sleep 300
"#;

const SEND: &str = r#"
produce "$count" "$delay"
echo "$count" > "$key.done"
echo "$count messages sent and acknowledged"
"#;

const RECEIVE: &str = r#"
touch "$key.recv"
tries=0
while [ "$(lines "$key.msgs")" -lt "$count" ]; do
  tries=$((tries + 1))
  if [ "$tries" -gt 400 ]; then echo "gave up waiting for $count messages" >&2; exit 1; fi
  sleep 0.05
done
if [ -f "$key.msgs" ]; then
  head -n "$count" "$key.msgs"
  tail -n +"$((count + 1))" "$key.msgs" > "$key.rest"
  mv "$key.rest" "$key.msgs"
fi
touch "$key.ack"
echo "$count messages received"
"#;

/// The direct peer also accepts (and drops) TCP connections on its address,
/// so the harness's listener check has something to connect to.
const DIRECT: &str = r#"
perl -MIO::Socket::INET -e '
  alarm 60;
  my $s = IO::Socket::INET->new(LocalAddr => $ARGV[0], Listen => 5, ReuseAddr => 1) or die "listen: $!\n";
  while (my $c = $s->accept) { close $c }
' "${addr%%/*}" >/dev/null 2>&1 &
listener=$!
trap 'kill "$listener" 2>/dev/null' EXIT
echo "listening on $addr"
tries=0
while :; do
  if [ -f "$key.done" ]; then
    if [ -f "$key.msgs" ]; then cat "$key.msgs"; fi
    echo "$(cat "$key.done") messages received"
    exit 0
  fi
  if [ -f "$key.recv" ]; then
    produce "$count" 0
    while [ ! -f "$key.ack" ]; do sleep 0.05; done
    echo "$count messages sent and acknowledged"
    exit 0
  fi
  tries=$((tries + 1))
  if [ "$tries" -gt 400 ]; then echo "nobody connected" >&2; exit 1; fi
  sleep 0.05
done
"#;

/// `sh` stand-ins for the broker, send, receive and direct examples.
///
/// Scripts are run as `sh <script>` so they never need the executable bit.
/// Processes that share an address exchange messages through files in a
/// scratch directory that lives as long as this value.
pub struct FakeExamples {
    dir: TempDir,
}

impl FakeExamples {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("Failed to create temporary directory")?;
        let fake = Self { dir };
        fake.write("broker", BROKER)?;
        fake.write("send", SEND)?;
        fake.write("receive", RECEIVE)?;
        fake.write("direct", DIRECT)?;
        Ok(fake)
    }

    /// Replaces one stand-in with `body`, which runs after the shared prelude.
    pub fn with_script(self, name: &str, body: &str) -> Result<Self> {
        self.write(name, body)?;
        Ok(self)
    }

    pub fn examples(&self) -> Arc<Examples> {
        let command = |name: &str| vec!["sh".to_string(), self.script(name).to_string_lossy().into_owned()];
        Arc::new(Examples {
            broker: command("broker"),
            send: command("send"),
            receive: command("receive"),
            direct: command("direct"),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn script(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{}.sh", name))
    }

    fn write(&self, name: &str, body: &str) -> Result<()> {
        let state = self.dir.path().to_string_lossy();
        let script = format!("{}{}", PRELUDE.replace("@STATE@", &state), body);
        std::fs::write(self.script(name), script)
            .with_context(|| format!("Failed to write fake {}", name))
    }
}
